// Storage actor protocol: one variant per request kind, each owning its reply callback

use crate::application::worker::{execute_guarded, PanicGuardResult};
use crate::domain::{BlobInfo, FileEntry, ImageInfo, ResourceInfo, RowId, TileEntry, TileKey};
use crate::error::{AppError, Result};
use crate::port::ResourceStore;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// Reply callback, invoked exactly once on the actor thread
pub type Reply<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Message accepted by the storage actor
pub enum StorageRequest {
    GetFileEntry {
        path: String,
        reply: Reply<Option<FileEntry>>,
    },
    StoreFileEntry {
        entry: FileEntry,
        reply: Reply<FileEntry>,
    },
    GetAllFileEntries {
        reply: Reply<Vec<FileEntry>>,
    },
    GetFileEntriesByPattern {
        pattern: String,
        reply: Reply<Vec<FileEntry>>,
    },
    GetTile {
        key: TileKey,
        reply: Reply<Option<TileEntry>>,
    },
    GetTiles {
        file_id: RowId,
        scale: i32,
        reply: Reply<Vec<TileEntry>>,
    },
    StoreTiles {
        tiles: Vec<TileEntry>,
        reply: Reply<()>,
    },
    GetMinMaxScale {
        file_id: RowId,
        reply: Reply<Option<(i32, i32)>>,
    },
    GetBlobInfo {
        hash: String,
        reply: Reply<Option<BlobInfo>>,
    },
    StoreBlobInfo {
        blob: BlobInfo,
        reply: Reply<()>,
    },
    GetResourceInfo {
        blob_hash: String,
        reply: Reply<Option<ResourceInfo>>,
    },
    StoreResourceInfo {
        info: ResourceInfo,
        reply: Reply<ResourceInfo>,
    },
    GetImageInfo {
        resource_id: RowId,
        reply: Reply<Option<ImageInfo>>,
    },
    StoreImageInfo {
        info: ImageInfo,
        reply: Reply<ImageInfo>,
    },
    DeleteFileEntry {
        file_id: RowId,
        reply: Reply<u64>,
    },
    Vacuum {
        reply: Reply<()>,
    },
    /// Exit once every request queued ahead of this one is processed
    Stop,
}

impl StorageRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageRequest::GetFileEntry { .. } => "get_file_entry",
            StorageRequest::StoreFileEntry { .. } => "store_file_entry",
            StorageRequest::GetAllFileEntries { .. } => "get_all_file_entries",
            StorageRequest::GetFileEntriesByPattern { .. } => "get_file_entries_by_pattern",
            StorageRequest::GetTile { .. } => "get_tile",
            StorageRequest::GetTiles { .. } => "get_tiles",
            StorageRequest::StoreTiles { .. } => "store_tiles",
            StorageRequest::GetMinMaxScale { .. } => "get_min_max_scale",
            StorageRequest::GetBlobInfo { .. } => "get_blob_info",
            StorageRequest::StoreBlobInfo { .. } => "store_blob_info",
            StorageRequest::GetResourceInfo { .. } => "get_resource_info",
            StorageRequest::StoreResourceInfo { .. } => "store_resource_info",
            StorageRequest::GetImageInfo { .. } => "get_image_info",
            StorageRequest::StoreImageInfo { .. } => "store_image_info",
            StorageRequest::DeleteFileEntry { .. } => "delete_file_entry",
            StorageRequest::Vacuum { .. } => "vacuum",
            StorageRequest::Stop => "stop",
        }
    }

    /// Execute against the store and hand the result to the reply callback
    pub(crate) async fn dispatch<S>(self, store: &S)
    where
        S: ResourceStore + ?Sized,
    {
        let kind = self.kind();
        match self {
            StorageRequest::GetFileEntry { path, reply } => {
                deliver(kind, reply, store.get_file_entry(&path).await)
            }
            StorageRequest::StoreFileEntry { entry, reply } => {
                deliver(kind, reply, store.store_file_entry(&entry).await)
            }
            StorageRequest::GetAllFileEntries { reply } => {
                deliver(kind, reply, store.get_all_file_entries().await)
            }
            StorageRequest::GetFileEntriesByPattern { pattern, reply } => {
                deliver(kind, reply, store.get_file_entries_by_pattern(&pattern).await)
            }
            StorageRequest::GetTile { key, reply } => deliver(kind, reply, store.get_tile(&key).await),
            StorageRequest::GetTiles { file_id, scale, reply } => {
                deliver(kind, reply, store.get_tiles(file_id, scale).await)
            }
            StorageRequest::StoreTiles { tiles, reply } => {
                deliver(kind, reply, store.store_tiles(&tiles).await)
            }
            StorageRequest::GetMinMaxScale { file_id, reply } => {
                deliver(kind, reply, store.get_min_max_scale(file_id).await)
            }
            StorageRequest::GetBlobInfo { hash, reply } => {
                deliver(kind, reply, store.get_blob_info(&hash).await)
            }
            StorageRequest::StoreBlobInfo { blob, reply } => {
                deliver(kind, reply, store.store_blob_info(&blob).await)
            }
            StorageRequest::GetResourceInfo { blob_hash, reply } => {
                deliver(kind, reply, store.get_resource_info(&blob_hash).await)
            }
            StorageRequest::StoreResourceInfo { info, reply } => {
                deliver(kind, reply, store.store_resource_info(&info).await)
            }
            StorageRequest::GetImageInfo { resource_id, reply } => {
                deliver(kind, reply, store.get_image_info(resource_id).await)
            }
            StorageRequest::StoreImageInfo { info, reply } => {
                deliver(kind, reply, store.store_image_info(&info).await)
            }
            StorageRequest::DeleteFileEntry { file_id, reply } => {
                deliver(kind, reply, store.delete_file_entry(file_id).await)
            }
            StorageRequest::Vacuum { reply } => deliver(kind, reply, store.vacuum().await),
            StorageRequest::Stop => {}
        }
    }

    /// Answer the request with `err` without touching the store
    pub(crate) fn reject(self, err: fn() -> AppError) {
        let kind = self.kind();
        match self {
            StorageRequest::GetFileEntry { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::StoreFileEntry { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetAllFileEntries { reply } => deliver(kind, reply, Err(err())),
            StorageRequest::GetFileEntriesByPattern { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetTile { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetTiles { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::StoreTiles { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetMinMaxScale { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetBlobInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::StoreBlobInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetResourceInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::StoreResourceInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::GetImageInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::StoreImageInfo { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::DeleteFileEntry { reply, .. } => deliver(kind, reply, Err(err())),
            StorageRequest::Vacuum { reply } => deliver(kind, reply, Err(err())),
            StorageRequest::Stop => {}
        }
    }
}

impl std::fmt::Debug for StorageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageRequest::{}", self.kind())
    }
}

fn deliver<T>(kind: &'static str, reply: Reply<T>, result: Result<T>) {
    if let Err(err) = &result {
        match err {
            AppError::Aborted | AppError::ActorStopped => {}
            _ => warn!(request = kind, error = %err, "Storage request failed"),
        }
    }

    if let PanicGuardResult::Panicked(msg) = execute_guarded(AssertUnwindSafe(move || reply(result))) {
        error!(request = kind, panic_msg = %msg, "Storage reply callback panicked, aborting");
        std::process::abort();
    }
}
