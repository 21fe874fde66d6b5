// Worker constants (No magic values)

/// Name prefix of worker pool threads (suffixed with the worker index)
pub const WORKER_THREAD_PREFIX: &str = "tessera-worker";

/// Name of the storage actor thread
pub const STORAGE_THREAD_NAME: &str = "tessera-storage";
