//! Durable-style job queues with retry/backoff, a dead-letter lane, and an
//! independent message processor for request/response-shaped work.

pub mod dlq;
pub mod job;
pub mod processor;
pub mod registry;

pub use dlq::{DeadLetterQueue, DlqRecord, RetryBatchReport, RetryFilters};
pub use job::{Job, JobEvent, JobOptions, JobQueue, JobStatus, QueueStatus};
pub use processor::{BatchCounts, Handler, Message, MessageOutcome, MessageProcessor};
pub use registry::QueueRegistry;
