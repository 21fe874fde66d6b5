// SQLite ResourceStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tessera_core::domain::{
    BlobInfo, FileEntry, ImageInfo, ResourceInfo, ResourceKind, RowId, TileEntry, TileFormat, TileKey,
};
use tessera_core::error::Result;
use tessera_core::port::ResourceStore;
use tracing::{debug, info};

pub struct SqliteResourceStore {
    pool: SqlitePool,
}

impl SqliteResourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn get_file_entry(&self, path: &str) -> Result<Option<FileEntry>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(FileRow::into_entry))
    }

    async fn store_file_entry(&self, entry: &FileEntry) -> Result<FileEntry> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Tiles rendered from different content are stale once the file is replaced
        let previous: Option<(i64, String)> = sqlx::query_as("SELECT id, blob_hash FROM files WHERE path = ?")
            .bind(&entry.path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if let Some((file_id, blob_hash)) = &previous {
            if *blob_hash != entry.blob_hash {
                let stale = sqlx::query("DELETE FROM tiles WHERE file_id = ?")
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                debug!(file_id = file_id, tiles = stale.rows_affected(), "Dropped stale tiles");
            }
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO files (path, size, mtime, blob_hash, handler)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mtime = excluded.mtime,
                blob_hash = excluded.blob_hash,
                handler = excluded.handler
            RETURNING id
            "#,
        )
        .bind(&entry.path)
        .bind(entry.size as i64)
        .bind(entry.mtime)
        .bind(&entry.blob_hash)
        .bind(&entry.handler)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(entry.clone().with_id(id))
    }

    async fn get_all_file_entries(&self) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileRow>("SELECT * FROM files ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(FileRow::into_entry).collect())
    }

    async fn get_file_entries_by_pattern(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path GLOB ? ORDER BY path")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(FileRow::into_entry).collect())
    }

    async fn delete_file_entry(&self, file_id: RowId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let tiles = sqlx::query("DELETE FROM tiles WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        info!(file_id = file_id, tiles = tiles, "Deleted file entry");
        Ok(tiles)
    }

    async fn get_tile(&self, key: &TileKey) -> Result<Option<TileEntry>> {
        let row = sqlx::query_as::<_, TileRow>(
            "SELECT file_id, scale, x, y, data, quality, format FROM tiles WHERE file_id = ? AND scale = ? AND x = ? AND y = ?",
        )
        .bind(key.file_id)
        .bind(key.scale)
        .bind(key.x)
        .bind(key.y)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(TileRow::into_entry).transpose()
    }

    async fn get_tiles(&self, file_id: RowId, scale: i32) -> Result<Vec<TileEntry>> {
        let rows = sqlx::query_as::<_, TileRow>(
            "SELECT file_id, scale, x, y, data, quality, format FROM tiles WHERE file_id = ? AND scale = ? ORDER BY y, x",
        )
        .bind(file_id)
        .bind(scale)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(TileRow::into_entry).collect()
    }

    async fn store_tiles(&self, tiles: &[TileEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for tile in tiles {
            sqlx::query(
                r#"
                INSERT INTO tiles (file_id, scale, x, y, data, quality, format)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(file_id, scale, x, y) DO UPDATE SET
                    data = excluded.data,
                    quality = excluded.quality,
                    format = excluded.format
                "#,
            )
            .bind(tile.file_id)
            .bind(tile.scale)
            .bind(tile.x)
            .bind(tile.y)
            .bind(&tile.data)
            .bind(i64::from(tile.quality))
            .bind(tile.format.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(count = tiles.len(), "Stored tiles");
        Ok(())
    }

    async fn get_min_max_scale(&self, file_id: RowId) -> Result<Option<(i32, i32)>> {
        let (min, max): (Option<i32>, Option<i32>) =
            sqlx::query_as("SELECT MIN(scale), MAX(scale) FROM tiles WHERE file_id = ?")
                .bind(file_id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(min.zip(max))
    }

    async fn get_blob_info(&self, hash: &str) -> Result<Option<BlobInfo>> {
        let row: Option<(String, i64)> = sqlx::query_as("SELECT hash, size FROM blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(|(hash, size)| BlobInfo::new(hash, size as u64)))
    }

    async fn store_blob_info(&self, blob: &BlobInfo) -> Result<()> {
        sqlx::query("INSERT INTO blobs (hash, size) VALUES (?, ?) ON CONFLICT(hash) DO UPDATE SET size = excluded.size")
            .bind(&blob.hash)
            .bind(blob.size as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn get_resource_info(&self, blob_hash: &str) -> Result<Option<ResourceInfo>> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE blob_hash = ?")
            .bind(blob_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(ResourceRow::into_info).transpose()
    }

    async fn store_resource_info(&self, info: &ResourceInfo) -> Result<ResourceInfo> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO resources (blob_hash, kind, handler, width, height)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(blob_hash) DO UPDATE SET
                kind = excluded.kind,
                handler = excluded.handler,
                width = excluded.width,
                height = excluded.height
            RETURNING id
            "#,
        )
        .bind(&info.blob_hash)
        .bind(info.kind.to_string())
        .bind(&info.handler)
        .bind(i64::from(info.width))
        .bind(i64::from(info.height))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut stored = info.clone();
        stored.id = Some(id);
        Ok(stored)
    }

    async fn get_image_info(&self, resource_id: RowId) -> Result<Option<ImageInfo>> {
        let row: Option<(i64, i64, i64, i64)> =
            sqlx::query_as("SELECT id, resource_id, width, height FROM images WHERE resource_id = ?")
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(row.map(|(id, resource_id, width, height)| ImageInfo {
            id: Some(id),
            resource_id,
            width: width as u32,
            height: height as u32,
        }))
    }

    async fn store_image_info(&self, info: &ImageInfo) -> Result<ImageInfo> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO images (resource_id, width, height)
            VALUES (?, ?, ?)
            ON CONFLICT(resource_id) DO UPDATE SET
                width = excluded.width,
                height = excluded.height
            RETURNING id
            "#,
        )
        .bind(info.resource_id)
        .bind(i64::from(info.width))
        .bind(i64::from(info.height))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut stored = info.clone();
        stored.id = Some(id);
        Ok(stored)
    }

    async fn vacuum(&self) -> Result<()> {
        info!("Running VACUUM to reclaim space...");
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        info!("VACUUM completed");
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct FileRow {
    id: i64,
    path: String,
    size: i64,
    mtime: i64,
    blob_hash: String,
    handler: Option<String>,
}

impl FileRow {
    fn into_entry(self) -> FileEntry {
        let mut entry = FileEntry::new(self.path, self.size as u64, self.mtime, self.blob_hash).with_id(self.id);
        entry.handler = self.handler;
        entry
    }
}

#[derive(sqlx::FromRow)]
struct TileRow {
    file_id: i64,
    scale: i32,
    x: i32,
    y: i32,
    data: Vec<u8>,
    quality: i64,
    format: i64,
}

impl TileRow {
    fn into_entry(self) -> Result<TileEntry> {
        let format = TileFormat::from_i64(self.format)?;
        let key = TileKey::new(self.file_id, self.scale, self.x, self.y);
        Ok(TileEntry::new(key, self.data, format).with_quality(self.quality.clamp(0, 100) as u8))
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: i64,
    blob_hash: String,
    kind: String,
    handler: String,
    width: i64,
    height: i64,
}

impl ResourceRow {
    fn into_info(self) -> Result<ResourceInfo> {
        Ok(ResourceInfo {
            id: Some(self.id),
            blob_hash: self.blob_hash,
            kind: ResourceKind::parse(&self.kind)?,
            handler: self.handler,
            width: self.width as u32,
            height: self.height as u32,
        })
    }
}
