//! Read-only view of a running supervisor.
//!
//! Snapshots are copies taken under the job-table lock and handed out by
//! value; nothing here can mutate supervisor state, and no lock crosses
//! the boundary. The HTTP surface serves the same snapshots to operators;
//! the test suite uses them directly.

pub mod http;
pub mod snapshot;

pub use http::{router, run_introspection};
pub use snapshot::{JobSnapshot, PhaseSnapshot, WorkerSnapshot};
