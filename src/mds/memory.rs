use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MdsError, Result};
use crate::mds::record::{JobRecord, JobRecordState, KeyResult, TaskGroupRecord, TaskGroupState};
use crate::mds::store::MetadataStore;

#[derive(Default)]
struct StoreState {
    jobs: HashMap<String, JobRecord>,
    /// Task groups per job, in creation order.
    groups: HashMap<String, Vec<TaskGroupRecord>>,
    group_ids: HashSet<Uuid>,
    /// Per-job change feed: (sequence, group id), append-only.
    changes: HashMap<String, Vec<(u64, Uuid)>>,
    seq: u64,
    /// Object key -> hosts, preference order.
    locations: HashMap<String, Vec<String>>,
}

/// In-memory [`MetadataStore`] with the same conditional-write semantics an
/// external store provides. Backs the test suite and the standalone binary;
/// also exposes direct mutators so tests can play the part of compute
/// agents and of racing supervisors.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    /// While set, every operation fails `Transient` (simulated outage).
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MdsError::Transient("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Simulate a store outage; while offline every call fails `Transient`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Insert or replace a job record unconditionally.
    pub async fn seed_job(&self, record: JobRecord) {
        self.state.write().await.jobs.insert(record.job_id.clone(), record);
    }

    /// Register the hosts holding `key`.
    pub async fn set_location(&self, key: impl Into<String>, hosts: Vec<&str>) {
        self.state
            .write()
            .await
            .locations
            .insert(key.into(), hosts.into_iter().map(String::from).collect());
    }

    /// Direct read of a job record, bypassing the gateway.
    pub async fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    /// Direct read of a job's task groups, in creation order.
    pub async fn task_groups(&self, job_id: &str) -> Vec<TaskGroupRecord> {
        self.state
            .read()
            .await
            .groups
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Agent stand-in: mark a group done with the given per-key results.
    pub async fn finish_task_group(&self, job_id: &str, group_id: Uuid, results: Vec<KeyResult>) {
        let mut state = self.state.write().await;
        let Some(groups) = state.groups.get_mut(job_id) else {
            return;
        };
        let Some(group) = groups.iter_mut().find(|g| g.task_group_id == group_id) else {
            return;
        };
        group.state = TaskGroupState::Done;
        group.results = results;
        state.seq += 1;
        let seq = state.seq;
        state
            .changes
            .entry(job_id.to_string())
            .or_default()
            .push((seq, group_id));
    }

    /// Agent stand-in: mark every group of a job's phase done, reporting
    /// each input key `ok` with `outputs(key)` as its outputs.
    pub async fn finish_phase<F>(&self, job_id: &str, phase_num: usize, outputs: F)
    where
        F: Fn(&str) -> Vec<String>,
    {
        let pending: Vec<(Uuid, Vec<String>)> = self
            .task_groups(job_id)
            .await
            .into_iter()
            .filter(|g| g.phase_num == phase_num && !g.is_done())
            .map(|g| (g.task_group_id, g.input_keys))
            .collect();
        for (group_id, keys) in pending {
            let results = keys
                .iter()
                .map(|k| KeyResult::ok(k.clone(), outputs(k)))
                .collect();
            self.finish_task_group(job_id, group_id, results).await;
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn scan_abandoned_jobs(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut matches: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| j.state != JobRecordState::Done)
            .filter(|j| j.worker.is_none() || j.mtime < stale_before)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(matches)
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.check_online()?;
        self.state
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| MdsError::NotFound(format!("job {job_id}")))
    }

    async fn put_job(&self, record: &JobRecord, expected_worker: Option<&str>) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let stored_worker = state
            .jobs
            .get(&record.job_id)
            .and_then(|j| j.worker.as_deref());
        if stored_worker != expected_worker {
            return Err(MdsError::Conflict(format!(
                "job {} owned by {:?}, expected {:?}",
                record.job_id, stored_worker, expected_worker
            )));
        }
        state.jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn touch_job(&self, job_id: &str, worker: &str, mtime: DateTime<Utc>) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(MdsError::NotFound(format!("job {job_id}")));
        };
        if job.worker.as_deref() != Some(worker) {
            return Err(MdsError::Conflict(format!(
                "job {} owned by {:?}, not {}",
                job_id, job.worker, worker
            )));
        }
        job.mtime = mtime;
        Ok(())
    }

    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>> {
        self.check_online()?;
        Ok(self
            .state
            .read()
            .await
            .groups
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_task_group(&self, record: &TaskGroupRecord) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if !state.group_ids.insert(record.task_group_id) {
            return Err(MdsError::Conflict(format!(
                "task group {} already exists",
                record.task_group_id
            )));
        }
        state
            .groups
            .entry(record.job_id.clone())
            .or_default()
            .push(record.clone());
        state.seq += 1;
        let seq = state.seq;
        state
            .changes
            .entry(record.job_id.clone())
            .or_default()
            .push((seq, record.task_group_id));
        Ok(())
    }

    async fn watch_task_groups(
        &self,
        job_id: &str,
        since: u64,
    ) -> Result<(u64, Vec<TaskGroupRecord>)> {
        self.check_online()?;
        let state = self.state.read().await;
        let cursor = state.seq;
        let Some(changes) = state.changes.get(job_id) else {
            return Ok((cursor, Vec::new()));
        };
        // One entry per changed group, latest record wins.
        let mut changed_ids: Vec<Uuid> = Vec::new();
        for (seq, id) in changes {
            if *seq > since && !changed_ids.contains(id) {
                changed_ids.push(*id);
            }
        }
        let groups = state.groups.get(job_id).cloned().unwrap_or_default();
        let changed = changed_ids
            .into_iter()
            .filter_map(|id| groups.iter().find(|g| g.task_group_id == id).cloned())
            .collect();
        Ok((cursor, changed))
    }

    async fn locate_keys(&self, keys: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut out = HashMap::new();
        for key in keys {
            // Unknown keys are omitted, mirroring a locate service that has
            // not indexed them yet. An explicitly registered empty host
            // list marks a key unlocatable.
            if let Some(hosts) = state.locations.get(key) {
                out.insert(key.clone(), hosts.clone());
            }
        }
        Ok(out)
    }
}
