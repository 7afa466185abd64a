use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::mds::record::{JobRecord, TaskGroupRecord};

/// Storage port over the external metadata store.
///
/// Implementations translate these calls onto whatever the deployment uses
/// (the in-memory [`MemoryStore`](crate::mds::MemoryStore) backs tests and
/// standalone mode). The conditional-write semantics are the contract the
/// whole design leans on:
///
/// - `put_job` succeeds only when the stored record's `worker` equals
///   `expected_worker`, atomically. This is the mutual-exclusion primitive.
/// - `create_task_group` fails with `Conflict` when the id already exists.
///
/// Reads may return stale data; the supervisor reconciles every tick.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Jobs with no worker, or whose mtime is older than `stale_before`,
    /// excluding finished jobs. May over-report.
    async fn scan_abandoned_jobs(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    async fn get_job(&self, job_id: &str) -> Result<JobRecord>;

    /// Write `record` if and only if the stored `worker` equals
    /// `expected_worker` (`None` matches an absent field, and an absent
    /// stored record). Errors with `Conflict` otherwise.
    async fn put_job(&self, record: &JobRecord, expected_worker: Option<&str>) -> Result<()>;

    /// Refresh `mtime` on a job, conditional on `worker` still owning it.
    async fn touch_job(&self, job_id: &str, worker: &str, mtime: DateTime<Utc>) -> Result<()>;

    /// All task-group records for a job, in creation order. May include
    /// records later superseded.
    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>>;

    /// Create a new task-group record; `Conflict` when the id exists.
    async fn create_task_group(&self, record: &TaskGroupRecord) -> Result<()>;

    /// Change feed for a job's task groups. Returns the new cursor and the
    /// records changed since `since` (a cursor previously returned here, or
    /// 0 for the beginning). Restartable: any cursor may be replayed.
    async fn watch_task_groups(
        &self,
        job_id: &str,
        since: u64,
    ) -> Result<(u64, Vec<TaskGroupRecord>)>;

    /// Resolve object keys to the hosts storing them, in preference order.
    /// Keys may be omitted from the response; an empty host list means the
    /// key is unlocatable.
    async fn locate_keys(&self, keys: &[String]) -> Result<HashMap<String, Vec<String>>>;
}
