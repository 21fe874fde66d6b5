// Command implementations on top of the cache pipeline

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;
use tessera_core::application::{JobOutcome, ResourceCache, StorageActor, StorageRequest, WorkerPool};
use tessera_core::domain::{FileEntry, ResourceInfo, ResourceKind, ResourceLocator, TileEntry};
use tessera_core::{CacheConfig, JobError};
use tessera_infra_sqlite::open_store;
use tessera_infra_system::{FsResourceGenerator, LegacyCache};
use tracing::{info, warn};

/// Storage actor, worker pool and cache for one run
pub struct Pipeline {
    cache: ResourceCache,
}

impl Pipeline {
    pub fn open(config: CacheConfig) -> Result<Self> {
        info!(db_path = %config.db_path, workers = config.worker_threads, "Opening cache");

        let db = config.db_path.clone();
        let storage = StorageActor::spawn(move || async move { open_store(&db).await })
            .with_context(|| format!("Cannot open cache database {}", config.db_path))?;
        let pool = WorkerPool::new(config.worker_threads)?;
        let generator = FsResourceGenerator::from_config(&config);

        let cache = ResourceCache::new(Arc::new(storage), Arc::new(pool), Arc::new(generator));
        Ok(Self { cache })
    }

    pub fn shutdown(self) {
        self.cache.pool().wait();
        self.cache.storage().stop();
        self.cache.storage().join();
    }

    fn file_entry(&self, path: &str) -> JobOutcome<FileEntry> {
        let (tx, rx) = mpsc::channel();
        self.cache.request_file_entry(path, move |outcome: JobOutcome<FileEntry>| {
            let _ = tx.send(outcome);
        });
        receive(rx)
    }

    fn resource_info(&self, file: &FileEntry) -> JobOutcome<ResourceInfo> {
        let (tx, rx) = mpsc::channel();
        self.cache.request_resource_info(
            ResourceLocator::from_path(file.path.clone()),
            file.blob(),
            move |outcome: JobOutcome<ResourceInfo>| {
                let _ = tx.send(outcome);
            },
        );
        receive(rx)
    }

    fn tiles(&self, file: &FileEntry, min_scale: i32, max_scale: i32) -> JobOutcome<Vec<TileEntry>> {
        let (tx, rx) = mpsc::channel();
        self.cache
            .request_tiles(file, min_scale, max_scale, move |outcome: JobOutcome<Vec<TileEntry>>| {
                let _ = tx.send(outcome);
            });
        receive(rx)
    }
}

fn receive<T>(rx: mpsc::Receiver<JobOutcome<T>>) -> JobOutcome<T> {
    rx.recv().unwrap_or(Err(JobError::Aborted))
}

pub fn warm(pipeline: &Pipeline, paths: &[String], scale: i32) -> Result<()> {
    let mut failed = 0usize;

    for path in paths {
        let path = std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.clone());

        match warm_one(pipeline, &path, scale) {
            Ok(tiles) => println!("{}\t{} tiles up to scale {}", path, tiles, scale),
            Err(err) => {
                failed += 1;
                warn!(path = %path, error = %err, "Failed to warm cache");
                println!("{}\tfailed: {}", path, err);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, paths.len());
    }
    Ok(())
}

fn warm_one(pipeline: &Pipeline, path: &str, scale: i32) -> Result<usize> {
    let file = pipeline.file_entry(path)?;
    let info = pipeline.resource_info(&file)?;
    if info.kind != ResourceKind::Image {
        return Ok(0);
    }

    let tiles = pipeline.tiles(&file, 0, scale)?;
    Ok(tiles.len())
}

pub fn list(pipeline: &Pipeline, pattern: Option<String>, json: bool) -> Result<()> {
    let storage = pipeline.cache.storage();
    let entries = match pattern {
        Some(pattern) => storage.call(|reply| StorageRequest::GetFileEntriesByPattern { pattern, reply })?,
        None => storage.call(|reply| StorageRequest::GetAllFileEntries { reply })?,
    };

    for entry in &entries {
        if json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        println!(
            "{}\t{}\t{}\t{}",
            entry.id.unwrap_or_default(),
            entry.size,
            entry.blob_hash,
            entry.path
        );
    }
    info!(files = entries.len(), "Listed cached files");
    Ok(())
}

pub fn forget(pipeline: &Pipeline, path: &str) -> Result<()> {
    let storage = pipeline.cache.storage();
    let path = path.to_string();
    let entry = storage.call(|reply| StorageRequest::GetFileEntry {
        path: path.clone(),
        reply,
    })?;

    match entry.and_then(|e| e.id) {
        Some(file_id) => {
            let tiles = storage.call(|reply| StorageRequest::DeleteFileEntry { file_id, reply })?;
            println!("{}\tforgotten ({} tiles)", path, tiles);
        }
        None => println!("{}\tnot cached", path),
    }
    Ok(())
}

pub fn vacuum(pipeline: &Pipeline) -> Result<()> {
    pipeline
        .cache
        .storage()
        .call(|reply| StorageRequest::Vacuum { reply })?;
    println!("vacuum complete");
    Ok(())
}

pub fn legacy(file: &str, verbose: bool) -> Result<()> {
    let cache = LegacyCache::load(file).with_context(|| format!("Cannot read legacy cache {}", file))?;

    if verbose {
        for entry in cache.entries() {
            println!(
                "{}\t{}\t{}\t{}x{}\t{}",
                entry.name_checksum, entry.content_checksum, entry.thumbnail_id, entry.width, entry.height, entry.mtime
            );
        }
    }
    println!("{} records, {} trailing bytes ignored", cache.len(), cache.trailing_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forget_and_list_on_empty_store() {
        let config = CacheConfig {
            db_path: "sqlite::memory:".to_string(),
            worker_threads: 1,
            ..CacheConfig::default()
        };
        let pipeline = Pipeline::open(config).unwrap();

        list(&pipeline, None, false).unwrap();
        list(&pipeline, Some("*.png".to_string()), true).unwrap();
        forget(&pipeline, "/nowhere.png").unwrap();
        vacuum(&pipeline).unwrap();
        pipeline.shutdown();
    }

    #[test]
    fn test_warm_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            db_path: dir.path().join("cache.db").to_string_lossy().into_owned(),
            worker_threads: 2,
            ..CacheConfig::default()
        };
        let pipeline = Pipeline::open(config).unwrap();

        let missing = dir.path().join("missing.png").to_string_lossy().into_owned();
        assert!(warm(&pipeline, &[missing], 0).is_err());
        pipeline.shutdown();
    }
}
