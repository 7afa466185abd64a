use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Stable identity used in conditional writes against the job bucket.
    pub uuid: String,
    /// Polling period for unassigned-job discovery.
    pub find_interval: Duration,
    /// Per-supervisor reconciliation period.
    pub tick_interval: Duration,
    /// Age of an owned job's mtime beyond which it counts as abandoned.
    pub stale_after: Duration,
    /// Wall-clock deadline for a single metadata-store call.
    pub op_timeout: Duration,
    /// Consecutive transient failures before a job is failed outright.
    pub max_transient_failures: u32,
    /// Discovery events beyond this many owned jobs are dropped.
    pub max_owned_jobs: usize,
    pub jobs_bucket: String,
    pub task_groups_bucket: String,
    /// Read-only HTTP introspection endpoint, disabled when unset.
    pub introspection_addr: Option<SocketAddr>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            find_interval: Duration::from_millis(5000),
            tick_interval: Duration::from_millis(1000),
            stale_after: Duration::from_millis(30_000),
            op_timeout: Duration::from_millis(10_000),
            max_transient_failures: 10,
            max_owned_jobs: 128,
            jobs_bucket: "marlinJobs".to_string(),
            task_groups_bucket: "marlinTaskGroups".to_string(),
            introspection_addr: None,
        }
    }
}

impl SupervisorConfig {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_find_interval(mut self, interval: Duration) -> Self {
        self.find_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_owned_jobs(mut self, max: usize) -> Self {
        self.max_owned_jobs = max;
        self
    }
}
