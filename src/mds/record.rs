use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MdsError, Result};

/// Coarse job status stored in the job bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRecordState {
    Unassigned,
    Running,
    Done,
}

impl std::fmt::Display for JobRecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRecordState::Unassigned => write!(f, "unassigned"),
            JobRecordState::Running => write!(f, "running"),
            JobRecordState::Done => write!(f, "done"),
        }
    }
}

/// A user-visible failure recorded on the job when it finishes.
///
/// `key` is set for per-key outcomes (an unlocatable input, a key the agent
/// reported as failed); it is absent for job-level errors such as an
/// exhausted retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub reason: String,
}

impl JobFailure {
    pub fn for_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            reason: reason.into(),
        }
    }

    pub fn job_level(reason: impl Into<String>) -> Self {
        Self {
            key: None,
            reason: reason.into(),
        }
    }
}

/// Durable job record, one per job, keyed by `jobId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    /// Ordered, non-empty phase descriptors. Opaque to the supervisor; each
    /// is copied verbatim into the task groups of its phase so agents can
    /// execute without reading the job record.
    pub phases: Vec<serde_json::Value>,
    /// Ordered object keys feeding phase 0.
    pub input_keys: Vec<String>,
    /// Owning supervisor, absent when unassigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Refreshed by the owner; staleness marks the job abandoned.
    pub mtime: DateTime<Utc>,
    pub state: JobRecordState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<JobFailure>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, phases: Vec<serde_json::Value>, input_keys: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            phases,
            input_keys,
            worker: None,
            mtime: Utc::now(),
            state: JobRecordState::Unassigned,
            results: Vec::new(),
        }
    }

    /// Schema checks applied at the gateway boundary. A record that fails
    /// here is skipped, never acted on.
    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(MdsError::Validation("job record with empty jobId".to_string()));
        }
        if self.phases.is_empty() {
            return Err(MdsError::Validation(format!(
                "job {} has no phases",
                self.job_id
            )));
        }
        Ok(())
    }
}

/// Per-key outcome reported by a compute agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOutcome {
    Ok,
    Fail,
}

/// One entry of a task group's `results`, written by the agent as it works
/// through the group's keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResult {
    pub key: String,
    pub result: KeyOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl KeyResult {
    pub fn ok(key: impl Into<String>, outputs: Vec<String>) -> Self {
        Self {
            key: key.into(),
            result: KeyOutcome::Ok,
            outputs,
        }
    }

    pub fn fail(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: KeyOutcome::Fail,
            outputs: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == KeyOutcome::Ok
    }
}

/// Execution state of a task group, advanced only by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskGroupState {
    Dispatched,
    Running,
    Done,
}

impl std::fmt::Display for TaskGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskGroupState::Dispatched => write!(f, "dispatched"),
            TaskGroupState::Running => write!(f, "running"),
            TaskGroupState::Done => write!(f, "done"),
        }
    }
}

/// Durable task-group record: a set of keys assigned to one compute host
/// for one phase of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupRecord {
    pub job_id: String,
    pub task_group_id: Uuid,
    pub phase_num: usize,
    pub host: String,
    pub input_keys: Vec<String>,
    /// The phase descriptor, copied from the job record at dispatch time.
    pub phase: serde_json::Value,
    pub state: TaskGroupState,
    #[serde(default)]
    pub results: Vec<KeyResult>,
}

impl TaskGroupRecord {
    /// Build a freshly-dispatched group for `host` covering `input_keys`.
    pub fn dispatch(
        job_id: impl Into<String>,
        phase_num: usize,
        phase: serde_json::Value,
        host: impl Into<String>,
        input_keys: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_group_id: Uuid::new_v4(),
            phase_num,
            host: host.into(),
            input_keys,
            phase,
            state: TaskGroupState::Dispatched,
            results: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(MdsError::Validation(format!(
                "task group {} with empty jobId",
                self.task_group_id
            )));
        }
        if self.task_group_id.is_nil() {
            return Err(MdsError::Validation(format!(
                "task group for job {} with nil id",
                self.job_id
            )));
        }
        if self.input_keys.is_empty() {
            return Err(MdsError::Validation(format!(
                "task group {} has no input keys",
                self.task_group_id
            )));
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskGroupState::Done
    }

    /// Output keys of every `ok` result, in result order.
    pub fn ok_outputs(&self) -> impl Iterator<Item = &String> {
        self.results
            .iter()
            .filter(|r| r.is_ok())
            .flat_map(|r| r.outputs.iter())
    }
}
