// Resource Generator Port
// Abstraction for the decode/thumbnail/hash work executed on worker threads

use crate::application::worker::JobHandle;
use crate::domain::{BlobInfo, FileEntry, ResourceInfo, ResourceLocator, TileEntry};
use crate::error::Result;

/// Produces cache records from source files
///
/// Every method is called on a worker thread and may block. Long running
/// implementations should poll `handle.is_aborted()` between units of work.
pub trait ResourceGenerator: Send + Sync {
    /// Stat and hash the file at `path`
    fn generate_file_entry(&self, path: &str) -> Result<FileEntry>;

    /// Inspect the resource and describe the decoded artifact
    fn generate_resource_info(&self, locator: &ResourceLocator, blob: &BlobInfo) -> Result<ResourceInfo>;

    /// Render every tile of `file` at `scale` (image downscaled by `2^scale`)
    fn generate_tiles(&self, file: &FileEntry, scale: i32, handle: &JobHandle) -> Result<Vec<TileEntry>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::{RowId, TileFormat, TileKey};
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Mock generator behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed
        Success,
        /// Always fail with message
        Fail(String),
        /// Panic with message (for panic isolation testing)
        Panic(String),
    }

    /// Mock generator: a virtual image of `grid_at_scale_0` x `grid_at_scale_0`
    /// tiles that halves with every scale step
    pub struct MockGenerator {
        behavior: Arc<Mutex<MockBehavior>>,
        delay: Arc<Mutex<Duration>>,
        grid_at_scale_0: i32,
        file_calls: Arc<AtomicUsize>,
        resource_calls: Arc<AtomicUsize>,
        tile_calls: Arc<AtomicUsize>,
    }

    impl MockGenerator {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                delay: Arc::new(Mutex::new(Duration::ZERO)),
                grid_at_scale_0: 4,
                file_calls: Arc::new(AtomicUsize::new(0)),
                resource_calls: Arc::new(AtomicUsize::new(0)),
                tile_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        /// Sleep this long inside every generation call
        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock().unwrap() = delay;
            self
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn file_calls(&self) -> usize {
            self.file_calls.load(Ordering::SeqCst)
        }

        pub fn resource_calls(&self) -> usize {
            self.resource_calls.load(Ordering::SeqCst)
        }

        pub fn tile_calls(&self) -> usize {
            self.tile_calls.load(Ordering::SeqCst)
        }

        /// Bytes the mock renders for a tile
        pub fn tile_bytes(file_id: RowId, scale: i32, x: i32, y: i32) -> Vec<u8> {
            format!("tile:{}:{}:{}:{}", file_id, scale, x, y).into_bytes()
        }

        fn act(&self) -> Result<()> {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockBehavior::Success => Ok(()),
                MockBehavior::Fail(msg) => Err(AppError::Internal(msg)),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
            }
        }
    }

    impl ResourceGenerator for MockGenerator {
        fn generate_file_entry(&self, path: &str) -> Result<FileEntry> {
            self.file_calls.fetch_add(1, Ordering::SeqCst);
            self.act()?;
            Ok(FileEntry::new(path, path.len() as u64, 1_000, format!("hash-of-{}", path)))
        }

        fn generate_resource_info(&self, _locator: &ResourceLocator, blob: &BlobInfo) -> Result<ResourceInfo> {
            self.resource_calls.fetch_add(1, Ordering::SeqCst);
            self.act()?;
            let edge = (self.grid_at_scale_0 * 256) as u32;
            Ok(ResourceInfo::image(blob.hash.clone(), "mock", edge, edge))
        }

        fn generate_tiles(&self, file: &FileEntry, scale: i32, _handle: &JobHandle) -> Result<Vec<TileEntry>> {
            self.tile_calls.fetch_add(1, Ordering::SeqCst);
            self.act()?;
            let file_id = file
                .id
                .ok_or_else(|| AppError::Internal(format!("{} has no row id", file)))?;
            let grid = (self.grid_at_scale_0 >> scale.clamp(0, 30)).max(1);
            let mut tiles = Vec::with_capacity((grid * grid) as usize);
            for y in 0..grid {
                for x in 0..grid {
                    tiles.push(TileEntry::new(
                        TileKey::new(file_id, scale, x, y),
                        Self::tile_bytes(file_id, scale, x, y),
                        TileFormat::Jpeg,
                    ));
                }
            }
            Ok(tiles)
        }
    }
}
