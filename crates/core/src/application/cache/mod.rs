// Resource Cache - lookup through the storage actor, generate on the worker pool on a miss

mod batch;
mod inflight;
mod jobs;
mod render;

pub use inflight::CacheCallback;

use crate::application::storage::StorageActor;
use crate::application::worker::{JobCallback, JobHandle, JobOutcome, WorkerPool};
use crate::domain::{
    BlobInfo, CacheKey, DomainError, FileEntry, ImageInfo, ResourceInfo, ResourceKind, ResourceLocator, RowId,
    TileEntry, TileKey,
};
use crate::error::{AppError, JobError};
use crate::port::ResourceGenerator;
use batch::TileBatch;
use inflight::{InFlight, Waiter};
use jobs::{FileEntryJob, ResourceInfoJob, TileGenerationJob};
use render::Renders;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Inner {
    storage: Arc<StorageActor>,
    pool: Arc<WorkerPool>,
    generator: Arc<dyn ResourceGenerator>,
    files: InFlight<FileEntry>,
    tiles: InFlight<TileEntry>,
    resources: InFlight<ResourceInfo>,
    renders: Renders,
}

/// Lookup-or-generate pipeline over the storage actor and the worker pool
///
/// Every request returns a fresh [`JobHandle`] at once; the callback fires
/// exactly once, on the storage thread for hits and for stored results.
/// Concurrent requests for the same key share one lookup and at most one
/// generation, and tile misses of one scale share one render.
///
/// Aborting a request's handle reaches the generation job once every caller
/// waiting on that job has aborted.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

impl ResourceCache {
    pub fn new(storage: Arc<StorageActor>, pool: Arc<WorkerPool>, generator: Arc<dyn ResourceGenerator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                pool,
                generator,
                files: InFlight::new(),
                tiles: InFlight::new(),
                resources: InFlight::new(),
                renders: Renders::new(),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<StorageActor> {
        &self.inner.storage
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Keys with a lookup or generation in progress
    pub fn in_flight(&self) -> usize {
        self.inner.files.len() + self.inner.tiles.len() + self.inner.resources.len()
    }

    /// Scales with a tile render in progress
    pub fn renders(&self) -> usize {
        self.inner.renders.len()
    }

    /// FileEntry for `path`, stat-and-hashing the file on a miss
    pub fn request_file_entry<F>(&self, path: impl Into<String>, callback: F) -> JobHandle
    where
        F: FnOnce(JobOutcome<FileEntry>) + Send + 'static,
    {
        let path = path.into();
        let key = CacheKey::Path(path.clone());
        let handle = JobHandle::new();

        if !self.inner.files.attach(&key, Waiter::new(handle.clone(), Box::new(callback))) {
            debug!(key = %key, "Joined in-flight request");
            return handle;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.storage.request_file(path.clone(), move |found| match found {
            Ok(Some(entry)) => {
                debug!(key = %key, "Cache hit");
                inner.files.complete(&key, Ok(entry));
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                inner.generate_file_entry(key, path);
            }
            Err(err) => {
                inner.files.complete(&key, Err(err.into()));
            }
        });
        handle
    }

    /// Tile (`x`, `y`) of `file` at `scale`, rendering the whole scale on a miss
    ///
    /// `file` must be a stored entry (with a row id). A coordinate outside the
    /// rendered grid fails with `JobError::NotFound`.
    pub fn request_tile<F>(&self, file: &FileEntry, scale: i32, x: i32, y: i32, callback: F) -> JobHandle
    where
        F: FnOnce(JobOutcome<TileEntry>) + Send + 'static,
    {
        let handle = JobHandle::new();
        let waiter = Waiter::new(handle.clone(), Box::new(callback) as CacheCallback<TileEntry>);
        self.inner.attach_tile(file, scale, x, y, waiter);
        handle
    }

    /// Every tile of `file` for each scale in `min_scale..=max_scale`,
    /// rendering the scales that are missing
    ///
    /// Tiles are ordered by scale, then row, then column. The first scale
    /// that fails decides the outcome.
    pub fn request_tiles<F>(&self, file: &FileEntry, min_scale: i32, max_scale: i32, callback: F) -> JobHandle
    where
        F: FnOnce(JobOutcome<Vec<TileEntry>>) + Send + 'static,
    {
        let handle = JobHandle::new();
        let waiter = Waiter::new(handle.clone(), Box::new(callback) as CacheCallback<Vec<TileEntry>>);

        let file_id = match file.id {
            Some(id) => id,
            None => {
                waiter.notify(Err(JobError::NotFound(format!("{} is not stored", file))));
                return handle;
            }
        };
        if min_scale < 0 || min_scale > max_scale {
            let err = AppError::from(DomainError::InvalidScaleRange {
                min: min_scale,
                max: max_scale,
            });
            waiter.notify(Err(err.into()));
            return handle;
        }

        let batch = Arc::new(TileBatch::new((max_scale - min_scale) as usize + 1, waiter));
        for scale in min_scale..=max_scale {
            // Tile (0, 0) exists at every scale; once it is stored the whole scale is
            let outer = handle.clone();
            let scale_handle = JobHandle::with_abort_check(move || outer.is_aborted());
            let inner = Arc::clone(&self.inner);
            let batch = Arc::clone(&batch);
            let on_first = move |first: JobOutcome<TileEntry>| match first {
                Ok(_) => {
                    inner.storage.request_tiles(file_id, scale, move |stored| {
                        batch.add(stored.map_err(JobError::from));
                    });
                }
                Err(err) => batch.add(Err(err)),
            };
            self.inner
                .attach_tile(file, scale, 0, 0, Waiter::new(scale_handle, Box::new(on_first)));
        }
        handle
    }

    /// Descriptor of the resource behind `locator`, keyed by the blob's content hash
    pub fn request_resource_info<F>(&self, locator: ResourceLocator, blob: BlobInfo, callback: F) -> JobHandle
    where
        F: FnOnce(JobOutcome<ResourceInfo>) + Send + 'static,
    {
        let key = CacheKey::ContentHash(blob.hash.clone());
        let handle = JobHandle::new();

        if !self.inner.resources.attach(&key, Waiter::new(handle.clone(), Box::new(callback))) {
            debug!(key = %key, "Joined in-flight request");
            return handle;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.storage.request_resource_info(blob.hash.clone(), move |found| match found {
            Ok(Some(info)) => {
                debug!(key = %key, "Cache hit");
                inner.resources.complete(&key, Ok(info));
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                inner.generate_resource_info(key, locator, blob);
            }
            Err(err) => {
                inner.resources.complete(&key, Err(err.into()));
            }
        });
        handle
    }
}

// Continuations. These run on the storage thread (lookup replies) or on a
// worker thread (job completions) and never block.
impl Inner {
    /// Generation handle that aborts once `abandoned` holds for the cache
    fn job_handle<F>(self: &Arc<Self>, abandoned: F) -> JobHandle
    where
        F: Fn(&Inner) -> bool + Send + Sync + 'static,
    {
        // Weak: the handle sits in the pool queue, which the cache owns
        let inner = Arc::downgrade(self);
        JobHandle::with_abort_check(move || inner.upgrade().map_or(true, |inner| abandoned(inner.as_ref())))
    }

    /// A job that stopped because its callers left may have gained new ones since
    fn rerun_after_abort(&self, abandoned: bool) -> bool {
        !abandoned && !self.pool.is_aborted()
    }

    fn generate_file_entry(self: Arc<Self>, key: CacheKey, path: String) {
        if self.files.all_aborted(&key) {
            debug!(key = %key, "Every waiter aborted, skipping generation");
            self.files.complete(&key, Err(JobError::Aborted));
            return;
        }

        let watched = key.clone();
        let handle = self.job_handle(move |inner| inner.files.all_aborted(&watched));
        let job = FileEntryJob {
            generator: Arc::clone(&self.generator),
            path,
        };
        let inner = Arc::clone(&self);
        let callback: JobCallback<FileEntryJob> = Box::new(move |job: FileEntryJob, outcome: JobOutcome<FileEntry>| match outcome {
            Ok(entry) => inner.store_file_entry(key, entry),
            Err(JobError::Aborted) if inner.rerun_after_abort(inner.files.all_aborted(&key)) => {
                debug!(key = %key, "Waiters joined after abort, generating again");
                inner.generate_file_entry(key, job.path);
            }
            Err(err) => {
                inner.files.complete(&key, Err(err));
            }
        });
        self.pool.request_with_handle(handle, job, Some(callback));
    }

    fn store_file_entry(self: Arc<Self>, key: CacheKey, entry: FileEntry) {
        // FIFO on the actor: the blob row lands before the file row that refers to it
        self.storage.store_blob_info(entry.blob(), |stored| {
            if let Err(err) = stored {
                warn!(error = %err, "Failed to store blob info");
            }
        });

        let inner = Arc::clone(&self);
        self.storage.store_file_entry(entry, move |stored| {
            let outcome = stored.map_err(JobError::from);
            if outcome.is_ok() {
                info!(key = %key, "Stored generated file entry");
            }
            inner.files.complete(&key, outcome);
        });
    }

    fn attach_tile(self: &Arc<Self>, file: &FileEntry, scale: i32, x: i32, y: i32, waiter: Waiter<TileEntry>) {
        let file_id = match file.id {
            Some(id) => id,
            None => {
                waiter.notify(Err(JobError::NotFound(format!("{} is not stored", file))));
                return;
            }
        };
        if scale < 0 || x < 0 || y < 0 {
            let err = AppError::from(DomainError::InvalidTileCoordinate { scale, x, y });
            waiter.notify(Err(err.into()));
            return;
        }

        let tile_key = TileKey::new(file_id, scale, x, y);
        let key = CacheKey::Tile(tile_key);
        if !self.tiles.attach(&key, waiter) {
            debug!(key = %key, "Joined in-flight request");
            return;
        }

        let inner = Arc::clone(self);
        let file = file.clone();
        self.storage.request_tile(tile_key, move |found| match found {
            Ok(Some(tile)) => {
                debug!(key = %key, "Cache hit");
                inner.tiles.complete(&key, Ok(tile));
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                inner.check_scale_range(key, tile_key, file);
            }
            Err(err) => {
                inner.tiles.complete(&key, Err(err.into()));
            }
        });
    }

    fn check_scale_range(self: Arc<Self>, key: CacheKey, tile_key: TileKey, file: FileEntry) {
        let inner = Arc::clone(&self);
        self.storage.request_min_max_scale(tile_key.file_id, move |range| match range {
            Ok(Some((min, max))) if (min..=max).contains(&tile_key.scale) => {
                // The scale may have been rendered and stored since the first lookup
                let retry = Arc::clone(&inner);
                inner.storage.request_tile(tile_key, move |found| match found {
                    Ok(Some(tile)) => {
                        debug!(key = %key, "Cache hit after render");
                        retry.tiles.complete(&key, Ok(tile));
                    }
                    Ok(None) => {
                        warn!(
                            key = %key,
                            min_scale = min,
                            max_scale = max,
                            "Tile missing inside the stored scale range, database incomplete"
                        );
                        retry.generate_tiles(key, tile_key, file);
                    }
                    Err(err) => {
                        retry.tiles.complete(&key, Err(err.into()));
                    }
                });
            }
            Ok(_) => inner.generate_tiles(key, tile_key, file),
            Err(err) => {
                warn!(key = %key, error = %err, "Scale range lookup failed");
                inner.generate_tiles(key, tile_key, file);
            }
        });
    }

    fn generate_tiles(self: Arc<Self>, key: CacheKey, tile_key: TileKey, file: FileEntry) {
        if self.tiles.all_aborted(&key) {
            debug!(key = %key, "Every waiter aborted, skipping generation");
            self.tiles.complete(&key, Err(JobError::Aborted));
            return;
        }

        if !self.renders.join(tile_key) {
            debug!(key = %key, "Joined render in progress");
            return;
        }
        self.start_render(file, tile_key.file_id, tile_key.scale);
    }

    fn render_abandoned(&self, file_id: RowId, scale: i32) -> bool {
        self.renders
            .keys(file_id, scale)
            .into_iter()
            .all(|tile_key| self.tiles.all_aborted(&CacheKey::Tile(tile_key)))
    }

    fn start_render(self: Arc<Self>, file: FileEntry, file_id: RowId, scale: i32) {
        let handle = self.job_handle(move |inner| inner.render_abandoned(file_id, scale));
        let job = TileGenerationJob {
            generator: Arc::clone(&self.generator),
            file,
            scale,
        };
        let inner = Arc::clone(&self);
        let callback: JobCallback<TileGenerationJob> =
            Box::new(move |job: TileGenerationJob, outcome: JobOutcome<Vec<TileEntry>>| match outcome {
                Ok(tiles) => inner.store_tiles(file_id, scale, tiles),
                Err(JobError::Aborted) => inner.render_aborted(job.file, file_id, scale),
                Err(err) => {
                    for tile_key in inner.renders.finish(file_id, scale) {
                        inner.tiles.complete(&CacheKey::Tile(tile_key), Err(err.clone()));
                    }
                }
            });
        self.pool.request_with_handle(handle, job, Some(callback));
    }

    fn render_aborted(self: Arc<Self>, file: FileEntry, file_id: RowId, scale: i32) {
        let mut live = Vec::new();
        for tile_key in self.renders.finish(file_id, scale) {
            let key = CacheKey::Tile(tile_key);
            if self.rerun_after_abort(self.tiles.all_aborted(&key)) {
                live.push(tile_key);
            } else {
                self.tiles.complete(&key, Err(JobError::Aborted));
            }
        }

        let mut lead = false;
        for tile_key in &live {
            lead |= self.renders.join(*tile_key);
        }
        if lead {
            debug!(file_id, scale, waiting = live.len(), "Waiters joined after abort, rendering again");
            self.start_render(file, file_id, scale);
        }
    }

    fn store_tiles(self: Arc<Self>, file_id: RowId, scale: i32, tiles: Vec<TileEntry>) {
        let inner = Arc::clone(&self);
        self.storage.store_tiles(tiles.clone(), move |stored| {
            let waiting = inner.renders.finish(file_id, scale);
            let err = match stored {
                Ok(()) => {
                    info!(file_id, scale, tiles = tiles.len(), waiting = waiting.len(), "Stored generated tiles");
                    None
                }
                Err(err) => Some(JobError::from(err)),
            };

            for tile_key in waiting {
                let key = CacheKey::Tile(tile_key);
                let outcome = match &err {
                    Some(err) => Err(err.clone()),
                    None => tiles
                        .iter()
                        .find(|tile| tile.key() == tile_key)
                        .cloned()
                        .ok_or_else(|| JobError::NotFound(format!("{} is outside the tile grid", key))),
                };
                inner.tiles.complete(&key, outcome);
            }
        });
    }

    fn generate_resource_info(self: Arc<Self>, key: CacheKey, locator: ResourceLocator, blob: BlobInfo) {
        if self.resources.all_aborted(&key) {
            debug!(key = %key, "Every waiter aborted, skipping generation");
            self.resources.complete(&key, Err(JobError::Aborted));
            return;
        }

        let watched = key.clone();
        let handle = self.job_handle(move |inner| inner.resources.all_aborted(&watched));
        let job = ResourceInfoJob {
            generator: Arc::clone(&self.generator),
            locator,
            blob,
        };
        let inner = Arc::clone(&self);
        let callback: JobCallback<ResourceInfoJob> = Box::new(move |job: ResourceInfoJob, outcome: JobOutcome<ResourceInfo>| match outcome {
            Ok(info) => inner.store_resource_info(key, job.blob, info),
            Err(JobError::Aborted) if inner.rerun_after_abort(inner.resources.all_aborted(&key)) => {
                debug!(key = %key, "Waiters joined after abort, generating again");
                inner.generate_resource_info(key, job.locator, job.blob);
            }
            Err(err) => {
                inner.resources.complete(&key, Err(err));
            }
        });
        self.pool.request_with_handle(handle, job, Some(callback));
    }

    fn store_resource_info(self: Arc<Self>, key: CacheKey, blob: BlobInfo, info: ResourceInfo) {
        self.storage.store_blob_info(blob, |stored| {
            if let Err(err) = stored {
                warn!(error = %err, "Failed to store blob info");
            }
        });

        let inner = Arc::clone(&self);
        self.storage.store_resource_info(info, move |stored| match stored {
            Err(err) => {
                inner.resources.complete(&key, Err(err.into()));
            }
            Ok(info) => match (info.kind, info.id) {
                (ResourceKind::Image, Some(resource_id)) => {
                    let image = ImageInfo::new(resource_id, info.width, info.height);
                    let done = Arc::clone(&inner);
                    inner.storage.store_image_info(image, move |stored| {
                        let outcome = stored.map(|_| info).map_err(JobError::from);
                        done.resources.complete(&key, outcome);
                    });
                }
                _ => {
                    inner.resources.complete(&key, Ok(info));
                }
            },
        });
    }
}
