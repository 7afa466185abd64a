use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{MdsError, Result};
use crate::mds::record::{JobRecord, TaskGroupRecord};
use crate::mds::store::MetadataStore;

/// Capacity of the discovery event channel. Scans that outrun the
/// supervisor loop drop events; discovery is idempotent and re-polls.
const DISCOVERY_CHANNEL_CAPACITY: usize = 256;

/// Typed facade over the metadata store.
///
/// The supervisor never touches a [`MetadataStore`] directly. This layer
/// adds what the raw port does not provide:
///
/// - a wall-clock deadline on every call, so a pending operation can never
///   wedge a job (elapsed deadlines surface as `Transient`),
/// - schema validation on records read from the store (bad records are
///   skipped and logged, never acted on),
/// - discovery events: unassigned and abandoned jobs are emitted on an
///   event channel rather than returned, so scans and the supervisor loop
///   stay decoupled,
/// - error classification, e.g. a heartbeat conflict becomes `LockLost`.
pub struct MdsGateway {
    store: Arc<dyn MetadataStore>,
    op_timeout: Duration,
    stale_after: chrono::Duration,
    jobs_bucket: String,
    task_groups_bucket: String,
    discovery_tx: mpsc::Sender<JobRecord>,
}

impl MdsGateway {
    /// Wrap `store`. The returned receiver yields one [`JobRecord`] per
    /// discovery match; hand it to the supervisor loop.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        config: &SupervisorConfig,
    ) -> (Self, mpsc::Receiver<JobRecord>) {
        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let gateway = Self {
            store,
            op_timeout: config.op_timeout,
            stale_after: chrono::Duration::from_std(config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            jobs_bucket: config.jobs_bucket.clone(),
            task_groups_bucket: config.task_groups_bucket.clone(),
            discovery_tx,
        };
        (gateway, discovery_rx)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MdsError::Transient(format!(
                "{op} exceeded deadline of {:?}",
                self.op_timeout
            ))),
        }
    }

    /// Scan for unassigned or abandoned jobs and emit one discovery event
    /// per match. Idempotent; may over-report (the conditional write in
    /// `assign_job` is what decides ownership).
    pub async fn find_unassigned_jobs(&self) -> Result<usize> {
        let stale_before = Utc::now() - self.stale_after;
        let records = self
            .bounded("scan", self.store.scan_abandoned_jobs(stale_before))
            .await?;

        let mut emitted = 0;
        for record in records {
            if let Err(e) = record.validate() {
                tracing::warn!(bucket = %self.jobs_bucket, error = %e, "Skipping malformed job record");
                continue;
            }
            // try_send: a full channel means the loop is behind; the next
            // scan will re-report anything dropped here.
            match self.discovery_tx.try_send(record) {
                Ok(()) => emitted += 1,
                Err(mpsc::error::TrySendError::Full(record)) => {
                    tracing::debug!(job_id = %record.job_id, "Discovery channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(MdsError::Fatal("discovery channel closed".to_string()));
                }
            }
        }
        Ok(emitted)
    }

    /// Conditional ownership write: succeeds only if the stored record's
    /// `worker` still equals `expected_worker` (absent, or the prior owner
    /// observed during discovery).
    pub async fn assign_job(
        &self,
        candidate: &JobRecord,
        expected_worker: Option<&str>,
    ) -> Result<()> {
        self.bounded("assign", self.store.put_job(candidate, expected_worker))
            .await
    }

    /// Refresh `mtime` on an owned job. A conflict here means another
    /// supervisor took the job over.
    pub async fn heartbeat(&self, job_id: &str, worker: &str) -> Result<()> {
        let result = self
            .bounded("heartbeat", self.store.touch_job(job_id, worker, Utc::now()))
            .await;
        match result {
            Err(MdsError::Conflict(msg)) | Err(MdsError::NotFound(msg)) => {
                Err(MdsError::LockLost(msg))
            }
            other => other,
        }
    }

    /// Write the final job record, conditional on still owning the job.
    pub async fn complete_job(&self, record: &JobRecord) -> Result<()> {
        let owner = record.worker.as_deref();
        let result = self
            .bounded("complete", self.store.put_job(record, owner))
            .await;
        match result {
            Err(MdsError::Conflict(msg)) => Err(MdsError::LockLost(msg)),
            other => other,
        }
    }

    /// All task-group records for a job, malformed records filtered out.
    pub async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>> {
        let records = self
            .bounded("listTaskGroups", self.store.list_task_groups(job_id))
            .await?;
        Ok(self.retain_valid(records))
    }

    /// Persist freshly-planned task groups. Bulk call with per-record
    /// outcomes: some records may land while others fail.
    pub async fn save_task_groups(
        &self,
        groups: &[TaskGroupRecord],
    ) -> Vec<(Uuid, Result<()>)> {
        let mut outcomes = Vec::with_capacity(groups.len());
        for group in groups {
            let outcome = self
                .bounded("saveTaskGroup", self.store.create_task_group(group))
                .await;
            if let Err(e) = &outcome {
                tracing::warn!(
                    bucket = %self.task_groups_bucket,
                    task_group_id = %group.task_group_id,
                    error = %e,
                    "Task group write failed"
                );
            }
            outcomes.push((group.task_group_id, outcome));
        }
        outcomes
    }

    /// Drain the task-group change feed from `since`. Returns the new
    /// cursor and the changed records, malformed ones filtered out.
    pub async fn watch_task_groups(
        &self,
        job_id: &str,
        since: u64,
    ) -> Result<(u64, Vec<TaskGroupRecord>)> {
        let (cursor, records) = self
            .bounded("watchTaskGroups", self.store.watch_task_groups(job_id, since))
            .await?;
        Ok((cursor, self.retain_valid(records)))
    }

    /// Resolve keys to hosts. The response may omit keys and may contain
    /// keys that were never requested; callers handle both.
    pub async fn locate(&self, keys: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.bounded("locate", self.store.locate_keys(keys)).await
    }

    fn retain_valid(&self, records: Vec<TaskGroupRecord>) -> Vec<TaskGroupRecord> {
        records
            .into_iter()
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        bucket = %self.task_groups_bucket,
                        error = %e,
                        "Skipping malformed task-group record"
                    );
                    false
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mds::memory::MemoryStore;
    use crate::mds::record::JobRecordState;

    fn setup() -> (Arc<MemoryStore>, MdsGateway, mpsc::Receiver<JobRecord>) {
        let store = Arc::new(MemoryStore::new());
        let config = SupervisorConfig::new("w-test");
        let (gateway, rx) = MdsGateway::new(store.clone(), &config);
        (store, gateway, rx)
    }

    #[tokio::test]
    async fn discovery_emits_unassigned_jobs_and_skips_malformed() {
        let (store, gateway, mut rx) = setup();
        store
            .seed_job(JobRecord::new(
                "job-001",
                vec![serde_json::json!({})],
                vec!["k1".to_string()],
            ))
            .await;
        // No phases: must be skipped, not emitted.
        store
            .seed_job(JobRecord::new("job-bad", vec![], vec!["k1".to_string()]))
            .await;

        let emitted = gateway.find_unassigned_jobs().await.unwrap();
        assert_eq!(emitted, 1);
        assert_eq!(rx.recv().await.unwrap().job_id, "job-001");
    }

    #[tokio::test]
    async fn discovery_ignores_done_and_fresh_owned_jobs() {
        let (store, gateway, _rx) = setup();
        let mut owned = JobRecord::new("job-owned", vec![serde_json::json!({})], vec![]);
        owned.worker = Some("w-other".to_string());
        owned.state = JobRecordState::Running;
        store.seed_job(owned).await;

        let mut done = JobRecord::new("job-done", vec![serde_json::json!({})], vec![]);
        done.state = JobRecordState::Done;
        store.seed_job(done).await;

        assert_eq!(gateway.find_unassigned_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_task_groups_filters_malformed_records() {
        let (store, gateway, _rx) = setup();
        let good = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-a",
            vec!["k1".to_string()],
        );
        let mut bad = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-b",
            vec!["k2".to_string()],
        );
        bad.input_keys.clear();
        store.create_task_group(&good).await.unwrap();
        store.create_task_group(&bad).await.unwrap();

        let listed = gateway.list_task_groups("job-001").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_group_id, good.task_group_id);
    }

    #[tokio::test]
    async fn heartbeat_conflict_maps_to_lock_lost() {
        let (store, gateway, _rx) = setup();
        let mut job = JobRecord::new("job-001", vec![serde_json::json!({})], vec![]);
        job.worker = Some("w-other".to_string());
        store.seed_job(job).await;

        let err = gateway.heartbeat("job-001", "w-test").await.unwrap_err();
        assert!(matches!(err, MdsError::LockLost(_)));
    }

    #[tokio::test]
    async fn save_task_groups_reports_per_record_outcomes() {
        let (_store, gateway, _rx) = setup();
        let g1 = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-a",
            vec!["k1".to_string()],
        );
        let mut dup = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-b",
            vec!["k2".to_string()],
        );
        dup.task_group_id = g1.task_group_id;

        let outcomes = gateway.save_task_groups(&[g1, dup]).await;
        assert!(outcomes[0].1.is_ok());
        assert!(matches!(outcomes[1].1, Err(MdsError::Conflict(_))));
    }
}
