pub mod aggregate;
pub mod dedup;
pub mod orchestrator;
pub mod record;
pub mod retry;

pub use aggregate::{finalize, ConsistencyError, RunTotals};
pub use dedup::FrameDeduplicator;
pub use orchestrator::{Orchestrator, PipelineError};
pub use record::{FrameRecord, FrameStatus, Report, SkipReason, Stage};
pub use retry::{with_retries, Backoff, RetryPolicy};
