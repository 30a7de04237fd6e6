//! Generic execution queue for long-running jobs.

pub mod context;
pub mod events;
pub mod executor;
pub mod record;

pub use context::{CancelSignal, OperationContext, TerminationReason};
pub use events::{JobEvent, JobEventStream};
pub use executor::{ExecutionQueue, JobFuture, JobHandle};
pub use record::{JobId, JobRecord, JobStatus};
