// Application Layer - concurrency primitives and the resource pipeline

pub mod cache;
pub mod queue;
pub mod storage;
pub mod worker;

// Re-exports
pub use cache::{CacheCallback, ResourceCache};
pub use queue::BlockingQueue;
pub use storage::{Reply, StorageActor, StorageRequest};
pub use worker::{Job, JobCallback, JobHandle, JobOutcome, WorkerPool};
