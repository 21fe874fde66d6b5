// Resource Store Port (Interface)
//
// Only the storage actor thread ever holds a ResourceStore. Implementations do
// not need to guard against concurrent use across requests.

use crate::domain::{BlobInfo, FileEntry, ImageInfo, ResourceInfo, RowId, TileEntry, TileKey};
use crate::error::Result;
use async_trait::async_trait;

/// Persistence interface for cache records
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Find file entry by exact path
    async fn get_file_entry(&self, path: &str) -> Result<Option<FileEntry>>;

    /// Insert or replace the file entry for its path, returning it with its row id
    async fn store_file_entry(&self, entry: &FileEntry) -> Result<FileEntry>;

    /// All file entries, ordered by path
    async fn get_all_file_entries(&self) -> Result<Vec<FileEntry>>;

    /// File entries whose path matches a glob pattern (`*`, `?`, `[...]`)
    async fn get_file_entries_by_pattern(&self, pattern: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file entry and every tile referring to it, returns deleted tile count
    async fn delete_file_entry(&self, file_id: RowId) -> Result<u64>;

    /// Find a tile by coordinate
    async fn get_tile(&self, key: &TileKey) -> Result<Option<TileEntry>>;

    /// Every stored tile of one scale of a file, ordered by row then column
    async fn get_tiles(&self, file_id: RowId, scale: i32) -> Result<Vec<TileEntry>>;

    /// Insert or replace a batch of tiles
    async fn store_tiles(&self, tiles: &[TileEntry]) -> Result<()>;

    /// Smallest and largest scale stored for a file, if any tile exists
    async fn get_min_max_scale(&self, file_id: RowId) -> Result<Option<(i32, i32)>>;

    /// Find blob by content hash
    async fn get_blob_info(&self, hash: &str) -> Result<Option<BlobInfo>>;

    /// Insert or replace blob
    async fn store_blob_info(&self, blob: &BlobInfo) -> Result<()>;

    /// Find resource descriptor by content hash
    async fn get_resource_info(&self, blob_hash: &str) -> Result<Option<ResourceInfo>>;

    /// Insert or replace resource descriptor, returning it with its row id
    async fn store_resource_info(&self, info: &ResourceInfo) -> Result<ResourceInfo>;

    /// Find image info by resource row id
    async fn get_image_info(&self, resource_id: RowId) -> Result<Option<ImageInfo>>;

    /// Insert or replace image info, returning it with its row id
    async fn store_image_info(&self, info: &ImageInfo) -> Result<ImageInfo>;

    /// Reclaim unused space
    async fn vacuum(&self) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Tables {
        files: BTreeMap<String, FileEntry>,
        tiles: HashMap<TileKey, TileEntry>,
        blobs: HashMap<String, BlobInfo>,
        resources: HashMap<String, ResourceInfo>,
        images: HashMap<RowId, ImageInfo>,
        next_id: RowId,
    }

    impl Tables {
        fn next_id(&mut self) -> RowId {
            self.next_id += 1;
            self.next_id
        }
    }

    /// In-memory store with call counting and failure injection
    ///
    /// Clones share the same tables, so a test can keep one clone for
    /// inspection while the actor owns another.
    #[derive(Clone, Default)]
    pub struct InMemoryStore {
        tables: Arc<Mutex<Tables>>,
        tile_lookup_delay: Arc<Mutex<HashMap<TileKey, Duration>>>,
        fail_writes: Arc<Mutex<Option<String>>>,
        tile_lookups: Arc<AtomicUsize>,
        tile_writes: Arc<AtomicUsize>,
        file_writes: Arc<AtomicUsize>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make lookups of `key` sleep before answering
        pub fn delay_tile_lookup(&self, key: TileKey, delay: Duration) {
            self.tile_lookup_delay.lock().unwrap().insert(key, delay);
        }

        /// Make every write fail with `message`
        pub fn fail_writes(&self, message: impl Into<String>) {
            *self.fail_writes.lock().unwrap() = Some(message.into());
        }

        pub fn tile_lookups(&self) -> usize {
            self.tile_lookups.load(Ordering::SeqCst)
        }

        pub fn tile_writes(&self) -> usize {
            self.tile_writes.load(Ordering::SeqCst)
        }

        pub fn file_writes(&self) -> usize {
            self.file_writes.load(Ordering::SeqCst)
        }

        pub fn tile_count(&self) -> usize {
            self.tables.lock().unwrap().tiles.len()
        }

        fn check_writable(&self) -> Result<()> {
            match self.fail_writes.lock().unwrap().as_ref() {
                Some(msg) => Err(AppError::Database(msg.clone())),
                None => Ok(()),
            }
        }
    }

    fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    #[async_trait]
    impl ResourceStore for InMemoryStore {
        async fn get_file_entry(&self, path: &str) -> Result<Option<FileEntry>> {
            Ok(self.tables.lock().unwrap().files.get(path).cloned())
        }

        async fn store_file_entry(&self, entry: &FileEntry) -> Result<FileEntry> {
            self.check_writable()?;
            self.file_writes.fetch_add(1, Ordering::SeqCst);
            let mut tables = self.tables.lock().unwrap();
            let id = match tables.files.get(&entry.path).and_then(|e| e.id) {
                Some(id) => id,
                None => tables.next_id(),
            };
            let stored = entry.clone().with_id(id);
            tables.files.insert(entry.path.clone(), stored.clone());
            Ok(stored)
        }

        async fn get_all_file_entries(&self) -> Result<Vec<FileEntry>> {
            Ok(self.tables.lock().unwrap().files.values().cloned().collect())
        }

        async fn get_file_entries_by_pattern(&self, pattern: &str) -> Result<Vec<FileEntry>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .files
                .values()
                .filter(|e| glob_match(pattern.as_bytes(), e.path.as_bytes()))
                .cloned()
                .collect())
        }

        async fn delete_file_entry(&self, file_id: RowId) -> Result<u64> {
            self.check_writable()?;
            let mut tables = self.tables.lock().unwrap();
            tables.files.retain(|_, e| e.id != Some(file_id));
            let before = tables.tiles.len();
            tables.tiles.retain(|k, _| k.file_id != file_id);
            Ok((before - tables.tiles.len()) as u64)
        }

        async fn get_tile(&self, key: &TileKey) -> Result<Option<TileEntry>> {
            self.tile_lookups.fetch_add(1, Ordering::SeqCst);
            let delay = self.tile_lookup_delay.lock().unwrap().get(key).copied();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            Ok(self.tables.lock().unwrap().tiles.get(key).cloned())
        }

        async fn get_tiles(&self, file_id: RowId, scale: i32) -> Result<Vec<TileEntry>> {
            let tables = self.tables.lock().unwrap();
            let mut tiles: Vec<TileEntry> = tables
                .tiles
                .values()
                .filter(|t| t.file_id == file_id && t.scale == scale)
                .cloned()
                .collect();
            tiles.sort_by_key(|t| (t.y, t.x));
            Ok(tiles)
        }

        async fn store_tiles(&self, tiles: &[TileEntry]) -> Result<()> {
            self.check_writable()?;
            self.tile_writes.fetch_add(1, Ordering::SeqCst);
            let mut tables = self.tables.lock().unwrap();
            for tile in tiles {
                tables.tiles.insert(tile.key(), tile.clone());
            }
            Ok(())
        }

        async fn get_min_max_scale(&self, file_id: RowId) -> Result<Option<(i32, i32)>> {
            let tables = self.tables.lock().unwrap();
            let scales = tables.tiles.keys().filter(|k| k.file_id == file_id).map(|k| k.scale);
            let (min, max) = scales.fold((None, None), |(min, max): (Option<i32>, Option<i32>), s| {
                (Some(min.map_or(s, |m| m.min(s))), Some(max.map_or(s, |m| m.max(s))))
            });
            Ok(min.zip(max))
        }

        async fn get_blob_info(&self, hash: &str) -> Result<Option<BlobInfo>> {
            Ok(self.tables.lock().unwrap().blobs.get(hash).cloned())
        }

        async fn store_blob_info(&self, blob: &BlobInfo) -> Result<()> {
            self.check_writable()?;
            self.tables
                .lock()
                .unwrap()
                .blobs
                .insert(blob.hash.clone(), blob.clone());
            Ok(())
        }

        async fn get_resource_info(&self, blob_hash: &str) -> Result<Option<ResourceInfo>> {
            Ok(self.tables.lock().unwrap().resources.get(blob_hash).cloned())
        }

        async fn store_resource_info(&self, info: &ResourceInfo) -> Result<ResourceInfo> {
            self.check_writable()?;
            let mut tables = self.tables.lock().unwrap();
            let id = tables.next_id();
            let stored = ResourceInfo {
                id: Some(id),
                ..info.clone()
            };
            tables.resources.insert(info.blob_hash.clone(), stored.clone());
            Ok(stored)
        }

        async fn get_image_info(&self, resource_id: RowId) -> Result<Option<ImageInfo>> {
            Ok(self.tables.lock().unwrap().images.get(&resource_id).cloned())
        }

        async fn store_image_info(&self, info: &ImageInfo) -> Result<ImageInfo> {
            self.check_writable()?;
            let mut tables = self.tables.lock().unwrap();
            let id = tables.next_id();
            let stored = ImageInfo {
                id: Some(id),
                ..info.clone()
            };
            tables.images.insert(info.resource_id, stored.clone());
            Ok(stored)
        }

        async fn vacuum(&self) -> Result<()> {
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_glob_match() {
            assert!(glob_match(b"/img/*.jpg", b"/img/a.jpg"));
            assert!(glob_match(b"/img/?.jpg", b"/img/b.jpg"));
            assert!(!glob_match(b"/img/*.png", b"/img/a.jpg"));
            assert!(glob_match(b"*", b""));
        }

        #[test]
        fn test_min_max_scale() {
            let store = InMemoryStore::new();
            tokio_test::block_on(async {
                assert_eq!(store.get_min_max_scale(1).await.unwrap(), None);
                let tiles = vec![
                    TileEntry::new(TileKey::new(1, 3, 0, 0), vec![1], crate::domain::TileFormat::Jpeg),
                    TileEntry::new(TileKey::new(1, 1, 0, 0), vec![2], crate::domain::TileFormat::Jpeg),
                    TileEntry::new(TileKey::new(2, 9, 0, 0), vec![3], crate::domain::TileFormat::Jpeg),
                ];
                store.store_tiles(&tiles).await.unwrap();
                assert_eq!(store.get_min_max_scale(1).await.unwrap(), Some((1, 3)));
            });
        }
    }
}
