use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::supervisor::job::JobState;
use crate::supervisor::planner;

/// Point-in-time view of the supervisor itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub uuid: String,
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub tracked_jobs: usize,
    pub tick_interval_ms: u64,
    pub find_interval_ms: u64,
}

/// Per-phase progress counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSnapshot {
    pub input_keys: usize,
    pub groups: usize,
    pub done_groups: usize,
    pub unassigned_keys: usize,
    pub failed_keys: usize,
}

/// Point-in-time view of one tracked job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: String,
    pub phase_index: usize,
    pub phase_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_op: Option<String>,
    pub transient_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    pub phases: Vec<PhaseSnapshot>,
}

impl JobSnapshot {
    pub fn capture(js: &JobState) -> Self {
        Self {
            job_id: js.record.job_id.clone(),
            state: js.lifecycle.to_string(),
            phase_index: js.phase_index,
            phase_count: js.record.phases.len(),
            pending_op: js.pending_op.as_ref().map(|op| op.kind.to_string()),
            transient_failures: js.transient_failures,
            fatal: js.fatal.clone(),
            phases: js
                .phases
                .iter()
                .map(|slot| PhaseSnapshot {
                    input_keys: slot.input.len(),
                    groups: slot.groups.len(),
                    done_groups: slot.groups.values().filter(|g| g.is_done()).count(),
                    unassigned_keys: planner::unassigned_keys(slot).len(),
                    failed_keys: slot.failures.len(),
                })
                .collect(),
        }
    }
}
