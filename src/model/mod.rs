pub mod job;
pub mod queue;
pub mod spec;
pub mod user;
pub mod worker;

pub use job::{Job, JobStatus};
pub use queue::{DispatchStrategy, Queue, QueuePriority, QueueState};
pub use spec::JobSpec;
pub use user::{Session, User};
pub use worker::{AuthMethod, Worker, WorkerKind, WorkerState, WorkerStatus};

/// Name of the reserved local worker that always exists and cannot be
/// deleted.
pub const SYSTEM_WORKER: &str = "System";
