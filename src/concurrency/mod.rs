//! Concurrency primitives shared by the replication engine
//!
//! - [`pool`]: bounded worker pool plus the job coordinator lane
//! - [`retry`]: exponential backoff honouring cancellation

pub mod pool;
pub mod retry;

pub use pool::{TaskHandle, WorkerPool};
pub use retry::{Backoff, retry_with_backoff};
