// Storage Actor - the single thread that owns the persistent store

mod request;

pub use request::{Reply, StorageRequest};

use crate::application::queue::BlockingQueue;
use crate::application::worker::constants::STORAGE_THREAD_NAME;
use crate::domain::{BlobInfo, FileEntry, ImageInfo, ResourceInfo, RowId, TileEntry, TileKey};
use crate::error::{AppError, Result};
use crate::port::ResourceStore;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

struct Shared {
    queue: BlockingQueue<StorageRequest>,
    aborted: AtomicBool,
}

/// Handle to the storage actor thread
///
/// Every store access goes through `send` (or one of the typed helpers) and
/// is executed on the actor thread in FIFO order. Reply callbacks run on the
/// actor thread: they may send further requests but must never block waiting
/// for one.
pub struct StorageActor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl StorageActor {
    /// Start the actor thread and open the store on it
    ///
    /// `open` runs on the actor thread inside its own single-threaded tokio
    /// runtime, which then drives every store call. Returns once the store is
    /// open; an open failure is returned here and no loop is started.
    pub fn spawn<S, F, Fut>(open: F) -> Result<Self>
    where
        S: ResourceStore + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S>>,
    {
        let shared = Arc::new(Shared {
            queue: BlockingQueue::new(),
            aborted: AtomicBool::new(false),
        });
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(STORAGE_THREAD_NAME.to_string())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            let _ = ready_tx.send(Err(AppError::Io(err)));
                            return;
                        }
                    };

                    let store = match runtime.block_on(open()) {
                        Ok(store) => store,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };

                    if ready_tx.send(Ok(())).is_err() {
                        return;
                    }
                    run_loop(&runtime, &store, &shared);
                })?
        };

        let startup = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AppError::Internal("storage thread exited during startup".to_string())));

        if let Err(err) = startup {
            error!(error = %err, "Failed to open resource store");
            if thread.join().is_err() {
                error!("Storage thread panicked during startup");
            }
            return Err(err);
        }

        info!("Storage actor started");
        Ok(Self {
            shared,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a request without blocking
    ///
    /// After `stop` or `abort` the request is answered at once, on the calling
    /// thread, with `AppError::ActorStopped`.
    pub fn send(&self, request: StorageRequest) {
        if let Err(request) = self.shared.queue.push(request) {
            debug!(request = request.kind(), "Storage actor closed, rejecting request");
            request.reject(|| AppError::ActorStopped);
        }
    }

    /// Process everything already queued, then exit
    pub fn stop(&self) {
        self.send(StorageRequest::Stop);
    }

    /// Exit after the current request; queued requests are answered with
    /// `AppError::Aborted`
    pub fn abort(&self) {
        if self.shared.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.close();
        for request in self.shared.queue.drain() {
            request.reject(|| AppError::Aborted);
        }
        warn!("Storage actor aborted");
    }

    /// Wait for the actor thread to exit (after `stop` or `abort`)
    pub fn join(&self) {
        if thread::current().id() == self.thread_id {
            warn!("join called from the storage thread itself, ignoring");
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("Storage thread terminated abnormally");
            }
        }
    }

    /// Requests waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether the calling code runs on the actor thread
    pub fn is_actor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Send a request built by `make` and block for its reply
    ///
    /// Fails with `AppError::Internal` when called from the actor thread,
    /// where waiting would deadlock.
    pub fn call<T, M>(&self, make: M) -> Result<T>
    where
        T: Send + 'static,
        M: FnOnce(Reply<T>) -> StorageRequest,
    {
        if self.is_actor_thread() {
            return Err(AppError::Internal(
                "blocking storage call issued from the storage thread".to_string(),
            ));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.send(make(Box::new(move |result: Result<T>| {
            let _ = tx.send(result);
        })));
        rx.recv().unwrap_or(Err(AppError::ActorStopped))
    }

    // Typed helpers, one per request kind

    pub fn request_file<F>(&self, path: impl Into<String>, reply: F)
    where
        F: FnOnce(Result<Option<FileEntry>>) + Send + 'static,
    {
        self.send(StorageRequest::GetFileEntry {
            path: path.into(),
            reply: Box::new(reply),
        });
    }

    pub fn store_file_entry<F>(&self, entry: FileEntry, reply: F)
    where
        F: FnOnce(Result<FileEntry>) + Send + 'static,
    {
        self.send(StorageRequest::StoreFileEntry {
            entry,
            reply: Box::new(reply),
        });
    }

    pub fn request_all_files<F>(&self, reply: F)
    where
        F: FnOnce(Result<Vec<FileEntry>>) + Send + 'static,
    {
        self.send(StorageRequest::GetAllFileEntries { reply: Box::new(reply) });
    }

    /// Files whose path matches a glob pattern
    pub fn request_files_by_pattern<F>(&self, pattern: impl Into<String>, reply: F)
    where
        F: FnOnce(Result<Vec<FileEntry>>) + Send + 'static,
    {
        self.send(StorageRequest::GetFileEntriesByPattern {
            pattern: pattern.into(),
            reply: Box::new(reply),
        });
    }

    pub fn request_tile<F>(&self, key: TileKey, reply: F)
    where
        F: FnOnce(Result<Option<TileEntry>>) + Send + 'static,
    {
        self.send(StorageRequest::GetTile {
            key,
            reply: Box::new(reply),
        });
    }

    /// Every stored tile of `scale` for `file_id`
    pub fn request_tiles<F>(&self, file_id: RowId, scale: i32, reply: F)
    where
        F: FnOnce(Result<Vec<TileEntry>>) + Send + 'static,
    {
        self.send(StorageRequest::GetTiles {
            file_id,
            scale,
            reply: Box::new(reply),
        });
    }

    pub fn store_tiles<F>(&self, tiles: Vec<TileEntry>, reply: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.send(StorageRequest::StoreTiles {
            tiles,
            reply: Box::new(reply),
        });
    }

    pub fn request_min_max_scale<F>(&self, file_id: RowId, reply: F)
    where
        F: FnOnce(Result<Option<(i32, i32)>>) + Send + 'static,
    {
        self.send(StorageRequest::GetMinMaxScale {
            file_id,
            reply: Box::new(reply),
        });
    }

    pub fn request_blob_info<F>(&self, hash: impl Into<String>, reply: F)
    where
        F: FnOnce(Result<Option<BlobInfo>>) + Send + 'static,
    {
        self.send(StorageRequest::GetBlobInfo {
            hash: hash.into(),
            reply: Box::new(reply),
        });
    }

    pub fn store_blob_info<F>(&self, blob: BlobInfo, reply: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.send(StorageRequest::StoreBlobInfo {
            blob,
            reply: Box::new(reply),
        });
    }

    pub fn request_resource_info<F>(&self, blob_hash: impl Into<String>, reply: F)
    where
        F: FnOnce(Result<Option<ResourceInfo>>) + Send + 'static,
    {
        self.send(StorageRequest::GetResourceInfo {
            blob_hash: blob_hash.into(),
            reply: Box::new(reply),
        });
    }

    pub fn store_resource_info<F>(&self, info: ResourceInfo, reply: F)
    where
        F: FnOnce(Result<ResourceInfo>) + Send + 'static,
    {
        self.send(StorageRequest::StoreResourceInfo {
            info,
            reply: Box::new(reply),
        });
    }

    pub fn request_image_info<F>(&self, resource_id: RowId, reply: F)
    where
        F: FnOnce(Result<Option<ImageInfo>>) + Send + 'static,
    {
        self.send(StorageRequest::GetImageInfo {
            resource_id,
            reply: Box::new(reply),
        });
    }

    pub fn store_image_info<F>(&self, info: ImageInfo, reply: F)
    where
        F: FnOnce(Result<ImageInfo>) + Send + 'static,
    {
        self.send(StorageRequest::StoreImageInfo {
            info,
            reply: Box::new(reply),
        });
    }

    /// Delete a file entry and all its tiles; replies with the tile count
    pub fn delete_file_entry<F>(&self, file_id: RowId, reply: F)
    where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        self.send(StorageRequest::DeleteFileEntry {
            file_id,
            reply: Box::new(reply),
        });
    }

    pub fn vacuum<F>(&self, reply: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.send(StorageRequest::Vacuum { reply: Box::new(reply) });
    }
}

impl Drop for StorageActor {
    fn drop(&mut self) {
        if self.thread.lock().is_none() {
            return;
        }
        self.stop();
        self.join();
    }
}

fn run_loop<S>(runtime: &tokio::runtime::Runtime, store: &S, shared: &Shared)
where
    S: ResourceStore + ?Sized,
{
    // Block for one request, then drain whatever queued up meanwhile
    'serve: while let Some(first) = shared.queue.pop() {
        let mut batch = vec![first];
        while let Some(next) = shared.queue.try_pop() {
            batch.push(next);
        }
        debug!(batch_size = batch.len(), "Processing storage batch");

        let mut batch = batch.into_iter();
        while let Some(request) = batch.next() {
            if shared.aborted.load(Ordering::SeqCst) {
                request.reject(|| AppError::Aborted);
                batch.for_each(|rest| rest.reject(|| AppError::Aborted));
                break 'serve;
            }

            if let StorageRequest::Stop = request {
                shared.queue.close();
                batch.for_each(|rest| rest.reject(|| AppError::ActorStopped));
                for rest in shared.queue.drain() {
                    rest.reject(|| AppError::ActorStopped);
                }
                break 'serve;
            }

            runtime.block_on(request.dispatch(store));
        }
    }

    info!("Storage actor stopped");
}
