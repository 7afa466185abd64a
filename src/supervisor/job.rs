use std::time::Instant;

use chrono::Utc;

use crate::error::MdsError;
use crate::mds::record::{JobFailure, JobRecord, JobRecordState, TaskGroupRecord};
use crate::supervisor::planner::{self, PhaseSlot};

/// Per-job lifecycle. A job enters the table as `Unassigned` when
/// discovered and leaves it from `Done`, from a lost ownership race, or
/// from a lost lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unassigned,
    Uninitialized,
    Planning,
    Running,
    Done,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Unassigned => write!(f, "unassigned"),
            Lifecycle::Uninitialized => write!(f, "uninitialized"),
            Lifecycle::Planning => write!(f, "planning"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Done => write!(f, "done"),
        }
    }
}

/// What a pending operation is doing, for logs and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Assign,
    Restore,
    Plan,
    Refresh,
    Finalize,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Assign => write!(f, "assign"),
            OpKind::Restore => write!(f, "restore"),
            OpKind::Plan => write!(f, "plan"),
            OpKind::Refresh => write!(f, "refresh"),
            OpKind::Finalize => write!(f, "finalize"),
        }
    }
}

/// Marker for the single in-flight asynchronous operation of a job.
///
/// The token is unique per spawned operation across the supervisor's
/// lifetime; completion handlers compare it before mutating anything, which
/// makes results of operations outlasting a `drop_job` (or a drop-and-
/// rediscover of the same job id) self-discarding.
#[derive(Debug)]
pub struct PendingOp {
    pub kind: OpKind,
    pub token: u64,
    pub started_at: Instant,
}

/// Result of evaluating the current phase while the job is `Running`.
#[derive(Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Some group has not reported done yet.
    Incomplete,
    /// Input keys exist that no group covers; go back to planning.
    NeedsPlanning,
    /// Every group is done and every result is ok.
    Complete,
    /// An agent reported a terminal per-key failure.
    Failed(String),
}

/// In-memory state for one owned job. Everything here is reconstructible
/// from the durable records; losing it costs at most a restore pass.
#[derive(Debug)]
pub struct JobState {
    /// Latest known job record. `worker` is self once assignment succeeds.
    pub record: JobRecord,
    /// Owner observed at discovery time, named in the conditional assign.
    pub prior_worker: Option<String>,
    pub lifecycle: Lifecycle,
    pub state_entered_at: Instant,
    pub pending_op: Option<PendingOp>,
    pub phase_index: usize,
    /// One slot per phase descriptor in the job record.
    pub phases: Vec<PhaseSlot>,
    /// Consecutive transient failures; reset on any success.
    pub transient_failures: u32,
    /// Task-group change-feed cursor, advanced by refresh operations.
    pub watch_cursor: u64,
    /// Job-level fatal reason, set at most once.
    pub fatal: Option<String>,
    /// The final job record has been written back.
    pub finalized: bool,
}

impl JobState {
    /// Fresh state for a job just reported by discovery.
    pub fn discovered(record: JobRecord) -> Self {
        let prior_worker = record.worker.clone();
        let phases = (0..record.phases.len()).map(|_| PhaseSlot::default()).collect();
        Self {
            record,
            prior_worker,
            lifecycle: Lifecycle::Unassigned,
            state_entered_at: Instant::now(),
            pending_op: None,
            phase_index: 0,
            phases,
            transient_failures: 0,
            watch_cursor: 0,
            fatal: None,
            finalized: false,
        }
    }

    pub fn enter(&mut self, next: Lifecycle) {
        tracing::debug!(
            job_id = %self.record.job_id,
            from = %self.lifecycle,
            to = %next,
            phase = self.phase_index,
            "Job state transition"
        );
        self.lifecycle = next;
        self.state_entered_at = Instant::now();
    }

    /// Bin restored task-group records into their phase slots and position
    /// `phase_index` at the highest phase that has a record: a record in
    /// phase k proves every earlier phase completed in the past, so their
    /// planning structures are never rebuilt. Records referencing a phase
    /// past the end of the job, and duplicate ids within a phase, are
    /// ignored.
    pub fn restore_from_groups(&mut self, records: Vec<TaskGroupRecord>) {
        let phase_count = self.record.phases.len();
        let mut max_phase = 0usize;
        for rec in records {
            if rec.phase_num >= phase_count {
                tracing::warn!(
                    job_id = %self.record.job_id,
                    task_group_id = %rec.task_group_id,
                    phase_num = rec.phase_num,
                    phases = phase_count,
                    "Task group references a phase out of range, ignoring"
                );
                continue;
            }
            let slot = &mut self.phases[rec.phase_num];
            if slot.groups.contains_key(&rec.task_group_id) {
                tracing::warn!(
                    job_id = %self.record.job_id,
                    task_group_id = %rec.task_group_id,
                    "Duplicate task group id, ignoring"
                );
                continue;
            }
            max_phase = max_phase.max(rec.phase_num);
            slot.groups.insert(rec.task_group_id, rec);
        }
        self.phase_index = max_phase;
    }

    /// Merge a changed record from the watch feed. Records for phases other
    /// than the current one carry no new work: earlier phases are already
    /// complete and later phases cannot have groups yet (only the owner
    /// creates them).
    pub fn merge_group(&mut self, rec: TaskGroupRecord) {
        if rec.phase_num != self.phase_index {
            tracing::debug!(
                job_id = %self.record.job_id,
                task_group_id = %rec.task_group_id,
                phase_num = rec.phase_num,
                current = self.phase_index,
                "Ignoring change outside the current phase"
            );
            return;
        }
        self.phases[self.phase_index]
            .groups
            .insert(rec.task_group_id, rec);
    }

    /// Completion test for the current phase (valid in `Running`, after the
    /// planner resolved the phase's input).
    pub fn evaluate_current_phase(&self) -> PhaseStatus {
        let slot = &self.phases[self.phase_index];
        if !planner::unassigned_keys(slot).is_empty() {
            return PhaseStatus::NeedsPlanning;
        }
        if slot.groups.values().any(|g| !g.is_done()) {
            return PhaseStatus::Incomplete;
        }
        for group in slot.groups.values() {
            if let Some(failed) = group.results.iter().find(|r| !r.is_ok()) {
                return PhaseStatus::Failed(format!(
                    "key {} failed in phase {}",
                    failed.key, self.phase_index
                ));
            }
        }
        PhaseStatus::Complete
    }

    /// Advance past a completed phase: on to planning the next one, or to
    /// `Done` after the final phase. `phase_index` only ever grows.
    pub fn advance_phase(&mut self) {
        if self.phase_index + 1 < self.record.phases.len() {
            self.phase_index += 1;
            self.enter(Lifecycle::Planning);
        } else {
            self.enter(Lifecycle::Done);
        }
    }

    /// Count a transient failure against the retry budget. Returns true
    /// when the budget is exhausted, in which case the job has been failed.
    pub fn note_transient(&mut self, context: &str, err: &MdsError, budget: u32) -> bool {
        self.transient_failures += 1;
        tracing::warn!(
            job_id = %self.record.job_id,
            context,
            error = %err,
            failures = self.transient_failures,
            "Transient failure, will retry on a later tick"
        );
        if self.transient_failures > budget {
            self.fail(format!(
                "{context}: retry budget exhausted after {} attempts: {err}",
                self.transient_failures
            ));
            return true;
        }
        false
    }

    /// Record a job-level fatal error and move to `Done`.
    pub fn fail(&mut self, reason: String) {
        tracing::error!(job_id = %self.record.job_id, reason = %reason, "Job failed");
        if self.fatal.is_none() {
            self.fatal = Some(reason);
        }
        self.enter(Lifecycle::Done);
    }

    /// The record written back when the job finishes: final state plus the
    /// per-key and job-level failures accumulated along the way.
    pub fn final_record(&self) -> JobRecord {
        let mut rec = self.record.clone();
        rec.state = JobRecordState::Done;
        rec.mtime = Utc::now();
        rec.results = self
            .phases
            .iter()
            .flat_map(|slot| slot.failures.iter().cloned())
            .collect();
        if let Some(reason) = &self.fatal {
            rec.results.push(JobFailure::job_level(reason.clone()));
        }
        rec
    }
}
