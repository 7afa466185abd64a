//! Supervisor core: discovery, ownership, and the per-job tick loop.
//!
//! A fleet of supervisors cooperates over the metadata store; each job is
//! owned by exactly one supervisor at a time, and ownership is recoverable
//! when an owner dies. This module drives that protocol:
//!
//! 1. A recurring tick fires discovery on its own cadence and then ticks
//!    every tracked job.
//! 2. [`Supervisor::on_job`] admits discovered jobs into the table (up to
//!    the owned-job cap) in the `Unassigned` state.
//! 3. Each job advances through its [`job::Lifecycle`] one asynchronous
//!    operation at a time: claim ownership, restore persisted progress,
//!    plan task groups for the current phase, then watch groups run to
//!    completion and advance the phase.
//! 4. Finished jobs get their final record written back and are dropped
//!    from the table.
//!
//! # Concurrency
//!
//! The job table lives behind one mutex and is only ever touched
//! synchronously; no lock is held across a store call. Store calls run in
//! spawned tasks guarded by the per-job `pending_op` marker, and their
//! completion handlers re-validate liveness (job still tracked, operation
//! token still current) before mutating anything. A job whose lock was
//! stolen mid-operation therefore discards the result instead of acting
//! on it.

pub mod job;
pub mod planner;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::MdsError;
use crate::introspection::{JobSnapshot, WorkerSnapshot};
use crate::mds::gateway::MdsGateway;
use crate::mds::record::{JobFailure, JobRecord, JobRecordState, TaskGroupRecord};
use crate::mds::store::MetadataStore;

use job::{JobState, Lifecycle, OpKind, PendingOp, PhaseStatus};

/// Handle to a running supervisor. Cheap to clone; the introspection
/// server holds one.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    gateway: MdsGateway,
    jobs: Mutex<HashMap<String, JobState>>,
    discovery_rx: Mutex<mpsc::Receiver<JobRecord>>,
    started_at: DateTime<Utc>,
    ticks: AtomicU64,
    last_find: std::sync::Mutex<Option<Instant>>,
    next_op_token: AtomicU64,
}

/// Work to launch for a job, decided under the table lock and spawned
/// outside it.
enum Launch {
    Assign {
        candidate: JobRecord,
        prior_worker: Option<String>,
    },
    Restore,
    Plan {
        phase_index: usize,
        phase: serde_json::Value,
        unassigned: std::collections::BTreeSet<String>,
    },
    Refresh {
        cursor: u64,
    },
    Finalize {
        record: JobRecord,
    },
}

/// What a completion handler decided about its job.
enum OpOutcome {
    /// Leave the job in the table; the next tick continues.
    Keep,
    /// Remove the job from the table.
    Drop,
    /// Leave the job in the table and tick it again immediately.
    Retick,
}

impl Supervisor {
    pub fn new(store: Arc<dyn MetadataStore>, config: SupervisorConfig) -> Self {
        let (gateway, discovery_rx) = MdsGateway::new(store, &config);
        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                jobs: Mutex::new(HashMap::new()),
                discovery_rx: Mutex::new(discovery_rx),
                started_at: Utc::now(),
                ticks: AtomicU64::new(0),
                last_find: std::sync::Mutex::new(None),
                next_op_token: AtomicU64::new(0),
            }),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.inner.config.uuid
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Drive the supervisor until `shutdown` fires. Ticks never overlap:
    /// the interval is only polled again after the previous tick's
    /// synchronous phase returned. Discovery events interleave with ticks
    /// on this loop but never interrupt one.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(uuid = %self.inner.config.uuid, "Supervisor starting");
        let mut discovery_rx = self
            .inner
            .discovery_rx
            .try_lock()
            .expect("supervisor loop started twice");
        let mut interval = tokio::time::interval(self.inner.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(uuid = %self.inner.config.uuid, "Supervisor stopping");
                    return;
                }
                _ = interval.tick() => self.tick().await,
                Some(record) = discovery_rx.recv() => self.on_job(record).await,
            }
        }
    }

    /// One reconciliation pass: fire discovery when due, then tick every
    /// tracked job. Never awaits a store call itself; per-job operations
    /// run in spawned tasks.
    pub async fn tick(&self) {
        let inner = &self.inner;
        inner.ticks.fetch_add(1, Ordering::Relaxed);

        let find_due = {
            let mut last = inner.last_find.lock().unwrap();
            match *last {
                Some(at) if at.elapsed() < inner.config.find_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if find_due {
            let inner = inner.clone();
            tokio::spawn(async move {
                match inner.gateway.find_unassigned_jobs().await {
                    Ok(n) if n > 0 => tracing::debug!(discovered = n, "Discovery scan emitted events"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Discovery scan failed"),
                }
            });
        }

        let ids: Vec<String> = inner.jobs.lock().await.keys().cloned().collect();
        for id in &ids {
            tick_job(inner, id).await;
        }
    }

    /// Discovery handler. Unknown jobs enter the table `Unassigned`
    /// (subject to the owned-job cap) and are ticked at once. A job
    /// already racing is ignored; a job this supervisor believed it owned
    /// means the lock is presumed lost, so it is dropped and re-admitted
    /// as new.
    pub async fn on_job(&self, record: JobRecord) {
        let inner = &self.inner;
        let job_id = record.job_id.clone();
        {
            let mut jobs = inner.jobs.lock().await;
            match jobs.get(&job_id) {
                Some(js) if js.lifecycle == Lifecycle::Unassigned => {
                    tracing::debug!(job_id = %job_id, "Already racing on discovered job");
                    return;
                }
                Some(js) => {
                    tracing::warn!(
                        job_id = %job_id,
                        state = %js.lifecycle,
                        "Discovered a job this supervisor believed it owned; lock presumed lost"
                    );
                    jobs.remove(&job_id);
                }
                None => {
                    if jobs.len() >= inner.config.max_owned_jobs {
                        tracing::debug!(
                            job_id = %job_id,
                            cap = inner.config.max_owned_jobs,
                            "Owned-job cap reached, dropping discovery event"
                        );
                        return;
                    }
                }
            }
            tracing::info!(job_id = %job_id, prior_worker = ?record.worker, "Tracking discovered job");
            jobs.insert(job_id.clone(), JobState::discovered(record));
        }
        tick_job(inner, &job_id).await;
    }

    /// Remove a job from the table. Any outstanding operation self-
    /// discards through the liveness check in its completion handler.
    pub async fn drop_job(&self, job_id: &str) -> bool {
        let removed = self.inner.jobs.lock().await.remove(job_id).is_some();
        if removed {
            tracing::info!(job_id = %job_id, "Dropped job");
        }
        removed
    }

    pub async fn worker_snapshot(&self) -> WorkerSnapshot {
        let jobs = self.inner.jobs.lock().await;
        WorkerSnapshot {
            uuid: self.inner.config.uuid.clone(),
            started_at: self.inner.started_at,
            ticks: self.inner.ticks.load(Ordering::Relaxed),
            tracked_jobs: jobs.len(),
            tick_interval_ms: self.inner.config.tick_interval.as_millis() as u64,
            find_interval_ms: self.inner.config.find_interval.as_millis() as u64,
        }
    }

    pub async fn job_snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(JobSnapshot::capture).collect();
        snapshots.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        snapshots
    }

    pub async fn job_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(JobSnapshot::capture)
    }
}

fn start_op(inner: &Inner, js: &mut JobState, kind: OpKind) -> u64 {
    let token = inner.next_op_token.fetch_add(1, Ordering::SeqCst) + 1;
    js.pending_op = Some(PendingOp {
        kind,
        token,
        started_at: Instant::now(),
    });
    token
}

/// Advance one job by at most one operation. Short-circuits while an
/// operation is pending; otherwise dispatches on the lifecycle, possibly
/// spawning a store operation.
fn tick_job<'a>(
    inner: &'a Arc<Inner>,
    job_id: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let launch = {
            let mut jobs = inner.jobs.lock().await;
            decide(inner, &mut jobs, job_id)
        };
        let Some((token, launch)) = launch else {
            return;
        };

        let inner = inner.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match launch {
                Launch::Assign {
                    candidate,
                    prior_worker,
                } => run_assign(inner, job_id, token, candidate, prior_worker).await,
                Launch::Restore => run_restore(inner, job_id, token).await,
                Launch::Plan {
                    phase_index,
                    phase,
                    unassigned,
                } => run_plan(inner, job_id, token, phase_index, phase, unassigned).await,
                Launch::Refresh { cursor } => run_refresh(inner, job_id, token, cursor).await,
                Launch::Finalize { record } => run_finalize(inner, job_id, token, record).await,
            }
        });
    })
}

fn decide(
    inner: &Inner,
    jobs: &mut HashMap<String, JobState>,
    job_id: &str,
) -> Option<(u64, Launch)> {
    let js = jobs.get_mut(job_id)?;

    if let Some(op) = &js.pending_op {
        // The gateway bounds every call, so a wedged op is a bug, not a
        // condition to recover from.
        if op.started_at.elapsed() > inner.config.op_timeout * 3 {
            tracing::error!(
                job_id = %job_id,
                op = %op.kind,
                "Pending operation exceeded its deadline without completing"
            );
            debug_assert!(false, "pending operation wedged");
        }
        return None;
    }

    match js.lifecycle {
        Lifecycle::Unassigned => {
            let mut candidate = js.record.clone();
            candidate.worker = Some(inner.config.uuid.clone());
            candidate.state = JobRecordState::Running;
            candidate.mtime = Utc::now();
            let prior_worker = js.prior_worker.clone();
            let token = start_op(inner, js, OpKind::Assign);
            Some((
                token,
                Launch::Assign {
                    candidate,
                    prior_worker,
                },
            ))
        }
        Lifecycle::Uninitialized => {
            let token = start_op(inner, js, OpKind::Restore);
            Some((token, Launch::Restore))
        }
        Lifecycle::Planning => {
            let k = js.phase_index;
            if js.phases[k].input.is_empty() {
                let prev = k.checked_sub(1).and_then(|i| js.phases.get(i));
                let input = planner::resolve_input(&js.record, prev, k);
                js.phases[k].input = input;
            }
            let unassigned = planner::unassigned_keys(&js.phases[k]);
            if unassigned.is_empty() {
                // Every input key already has a group (or a recorded
                // failure); nothing to persist.
                js.enter(Lifecycle::Running);
                return None;
            }
            let phase = js.record.phases[k].clone();
            let token = start_op(inner, js, OpKind::Plan);
            Some((
                token,
                Launch::Plan {
                    phase_index: k,
                    phase,
                    unassigned,
                },
            ))
        }
        Lifecycle::Running => {
            let cursor = js.watch_cursor;
            let token = start_op(inner, js, OpKind::Refresh);
            Some((token, Launch::Refresh { cursor }))
        }
        Lifecycle::Done => {
            if js.finalized {
                tracing::info!(job_id = %job_id, "Job complete, dropping from table");
                jobs.remove(job_id);
                return None;
            }
            let record = js.final_record();
            let token = start_op(inner, js, OpKind::Finalize);
            Some((token, Launch::Finalize { record }))
        }
    }
}

/// Apply an operation's result to its job, if the job is still live and
/// this operation is still the current one. The token check covers both
/// drops and drop-then-rediscover of the same job id: a fresh `JobState`
/// never reuses a token, and no state can change underneath a pending
/// operation because ticks short-circuit on it.
async fn finish_op<F>(inner: &Arc<Inner>, job_id: &str, token: u64, apply: F)
where
    F: FnOnce(&Inner, &mut JobState) -> OpOutcome,
{
    let outcome = {
        let mut jobs = inner.jobs.lock().await;
        let Some(js) = jobs.get_mut(job_id) else {
            tracing::debug!(job_id = %job_id, "Discarding completion for an untracked job");
            return;
        };
        if !js.pending_op.as_ref().is_some_and(|op| op.token == token) {
            tracing::debug!(job_id = %job_id, "Discarding completion for a superseded operation");
            return;
        }
        js.pending_op = None;
        let outcome = apply(inner, js);
        if matches!(outcome, OpOutcome::Drop) {
            jobs.remove(job_id);
        }
        outcome
    };
    if matches!(outcome, OpOutcome::Retick) {
        tick_job(inner, job_id).await;
    }
}

/// UNASSIGNED → UNINITIALIZED: conditional ownership write.
async fn run_assign(
    inner: Arc<Inner>,
    job_id: String,
    token: u64,
    candidate: JobRecord,
    prior_worker: Option<String>,
) {
    let result = inner
        .gateway
        .assign_job(&candidate, prior_worker.as_deref())
        .await;
    finish_op(&inner, &job_id, token, move |inner, js| match result {
        Ok(()) => {
            tracing::info!(job_id = %candidate.job_id, "Job assigned to this supervisor");
            js.record = candidate;
            js.transient_failures = 0;
            js.enter(Lifecycle::Uninitialized);
            OpOutcome::Retick
        }
        Err(MdsError::Conflict(reason)) => {
            tracing::info!(job_id = %candidate.job_id, reason = %reason, "Lost assignment race, dropping job");
            OpOutcome::Drop
        }
        Err(e) if e.is_transient() => {
            js.note_transient("assign", &e, inner.config.max_transient_failures);
            OpOutcome::Keep
        }
        Err(e) => panic!("impossible error from assign: {e}"),
    })
    .await;
}

/// UNINITIALIZED → PLANNING: rebuild progress from the durable records.
async fn run_restore(inner: Arc<Inner>, job_id: String, token: u64) {
    let result = inner.gateway.list_task_groups(&job_id).await;
    finish_op(&inner, &job_id, token, move |inner, js| match result {
        Ok(records) => {
            let found = records.len();
            js.restore_from_groups(records);
            js.transient_failures = 0;
            tracing::info!(
                job_id = %js.record.job_id,
                groups = found,
                phase = js.phase_index,
                "Restored job progress"
            );
            js.enter(Lifecycle::Planning);
            OpOutcome::Retick
        }
        Err(e) if e.is_transient() => {
            js.note_transient("restore", &e, inner.config.max_transient_failures);
            OpOutcome::Keep
        }
        Err(e) => panic!("impossible error from listTaskGroups: {e}"),
    })
    .await;
}

/// One planning pass over the current phase: heartbeat, locate the
/// still-unassigned keys, cut per-host task groups, persist them. The
/// phase cannot change underneath this operation; the unassigned set was
/// computed under the lock and no other operation can run meanwhile.
async fn run_plan(
    inner: Arc<Inner>,
    job_id: String,
    token: u64,
    phase_index: usize,
    phase: serde_json::Value,
    unassigned: std::collections::BTreeSet<String>,
) {
    match inner.gateway.heartbeat(&job_id, &inner.config.uuid).await {
        Ok(()) => {}
        Err(e) => {
            heartbeat_failure(&inner, &job_id, token, e).await;
            return;
        }
    }

    let keys: Vec<String> = unassigned.iter().cloned().collect();
    let locations = match inner.gateway.locate(&keys).await {
        Ok(locations) => locations,
        Err(e) if e.is_transient() => {
            finish_op(&inner, &job_id, token, move |inner, js| {
                js.note_transient("locate", &e, inner.config.max_transient_failures);
                OpOutcome::Keep
            })
            .await;
            return;
        }
        Err(e) => panic!("impossible error from locate: {e}"),
    };

    let partition = planner::partition_by_host(&job_id, phase_index, &phase, &unassigned, &locations);
    let outcomes = inner.gateway.save_task_groups(&partition.groups).await;

    finish_op(&inner, &job_id, token, move |inner, js| {
        debug_assert_eq!(js.phase_index, phase_index);
        let mut by_id: HashMap<Uuid, TaskGroupRecord> = partition
            .groups
            .into_iter()
            .map(|g| (g.task_group_id, g))
            .collect();

        let mut transient: Option<MdsError> = None;
        let mut persisted = 0usize;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    let rec = by_id.remove(&id).expect("outcome for a group never planned");
                    let prev = js.phases[phase_index].groups.insert(id, rec);
                    assert!(prev.is_none(), "freshly generated task group id collided");
                    persisted += 1;
                }
                Err(MdsError::Conflict(reason)) => {
                    panic!("task group uuid collision: {reason}")
                }
                Err(e) if e.is_transient() => transient = Some(e),
                Err(e) => panic!("impossible error from saveTaskGroups: {e}"),
            }
        }

        for key in partition.unlocatable {
            tracing::warn!(job_id = %js.record.job_id, key = %key, phase = phase_index, "Input key has no storage host");
            js.phases[phase_index]
                .failures
                .push(JobFailure::for_key(key, "no storage host for key"));
        }

        if persisted > 0 {
            tracing::info!(
                job_id = %js.record.job_id,
                phase = phase_index,
                groups = persisted,
                "Dispatched task groups"
            );
        }

        if let Some(e) = transient {
            // Keys of the failed writes are still unassigned; the next
            // planning pass retries exactly those.
            js.note_transient("saveTaskGroups", &e, inner.config.max_transient_failures);
            return OpOutcome::Keep;
        }

        js.transient_failures = 0;
        if planner::unassigned_keys(&js.phases[phase_index]).is_empty() {
            js.enter(Lifecycle::Running);
        }
        OpOutcome::Keep
    })
    .await;
}

/// RUNNING upkeep: heartbeat, drain the task-group change feed, then test
/// the current phase for completion.
async fn run_refresh(inner: Arc<Inner>, job_id: String, token: u64, cursor: u64) {
    match inner.gateway.heartbeat(&job_id, &inner.config.uuid).await {
        Ok(()) => {}
        Err(e) => {
            heartbeat_failure(&inner, &job_id, token, e).await;
            return;
        }
    }

    let result = inner.gateway.watch_task_groups(&job_id, cursor).await;
    finish_op(&inner, &job_id, token, move |inner, js| match result {
        Ok((new_cursor, changed)) => {
            js.watch_cursor = new_cursor;
            for rec in changed {
                js.merge_group(rec);
            }
            js.transient_failures = 0;
            match js.evaluate_current_phase() {
                PhaseStatus::Incomplete => OpOutcome::Keep,
                PhaseStatus::NeedsPlanning => {
                    tracing::info!(
                        job_id = %js.record.job_id,
                        phase = js.phase_index,
                        "Uncovered input keys appeared, returning to planning"
                    );
                    js.enter(Lifecycle::Planning);
                    OpOutcome::Retick
                }
                PhaseStatus::Complete => {
                    tracing::info!(
                        job_id = %js.record.job_id,
                        phase = js.phase_index,
                        "Phase complete"
                    );
                    js.advance_phase();
                    OpOutcome::Retick
                }
                PhaseStatus::Failed(reason) => {
                    js.fail(reason);
                    OpOutcome::Retick
                }
            }
        }
        Err(e) if e.is_transient() => {
            js.note_transient("watchTaskGroups", &e, inner.config.max_transient_failures);
            OpOutcome::Keep
        }
        Err(e) => panic!("impossible error from watchTaskGroups: {e}"),
    })
    .await;
}

/// DONE: write the final job record, then let the next tick drop the job.
async fn run_finalize(inner: Arc<Inner>, job_id: String, token: u64, record: JobRecord) {
    let result = inner.gateway.complete_job(&record).await;
    finish_op(&inner, &job_id, token, move |inner, js| match result {
        Ok(()) => {
            tracing::info!(
                job_id = %record.job_id,
                failures = record.results.len(),
                "Job finished, final record written"
            );
            js.finalized = true;
            js.transient_failures = 0;
            OpOutcome::Keep
        }
        Err(MdsError::LockLost(reason)) => {
            tracing::warn!(job_id = %record.job_id, reason = %reason, "Lost the job before writing its final record");
            OpOutcome::Drop
        }
        Err(e) if e.is_transient() => {
            if js.note_transient("finalize", &e, inner.config.max_transient_failures) {
                // Out of retries with the final record unwritten; the
                // record's stale mtime lets another supervisor take over.
                tracing::error!(job_id = %record.job_id, "Giving up on final record write, dropping job");
                OpOutcome::Drop
            } else {
                OpOutcome::Keep
            }
        }
        Err(e) => panic!("impossible error from complete: {e}"),
    })
    .await;
}

/// Shared handling for heartbeat outcomes inside plan and refresh
/// operations: a lost lock drops the job, anything else retries.
async fn heartbeat_failure(inner: &Arc<Inner>, job_id: &str, token: u64, err: MdsError) {
    finish_op(inner, job_id, token, move |inner, js| match err {
        MdsError::LockLost(reason) => {
            tracing::warn!(job_id = %js.record.job_id, reason = %reason, "Heartbeat lost the lock, dropping job");
            OpOutcome::Drop
        }
        e if e.is_transient() => {
            js.note_transient("heartbeat", &e, inner.config.max_transient_failures);
            OpOutcome::Keep
        }
        e => panic!("impossible error from heartbeat: {e}"),
    })
    .await;
}
