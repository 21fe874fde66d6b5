//! Pipeline edge cases: failures, panics, aborts and store invariants

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::application::{JobOutcome, ResourceCache, StorageActor, StorageRequest, WorkerPool};
use tessera_core::domain::{FileEntry, ResourceInfo, ResourceKind, ResourceLocator, TileEntry, TileKey};
use tessera_core::port::generator::mocks::{MockBehavior, MockGenerator};
use tessera_core::port::ResourceGenerator;
use tessera_core::JobError;
use tessera_infra_sqlite::open_store;
use tessera_infra_system::FsResourceGenerator;

const TIMEOUT: Duration = Duration::from_secs(30);

fn open_cache(db: &str, generator: Arc<dyn ResourceGenerator>) -> ResourceCache {
    let db = db.to_string();
    let storage = StorageActor::spawn(move || async move { open_store(&db).await }).unwrap();
    ResourceCache::new(Arc::new(storage), Arc::new(WorkerPool::new(2).unwrap()), generator)
}

fn file_entry(cache: &ResourceCache, path: &str) -> JobOutcome<FileEntry> {
    let (tx, rx) = mpsc::channel();
    cache.request_file_entry(path, move |outcome: JobOutcome<FileEntry>| {
        let _ = tx.send(outcome);
    });
    rx.recv_timeout(TIMEOUT).unwrap()
}

fn tile(cache: &ResourceCache, file: &FileEntry, scale: i32, x: i32, y: i32) -> JobOutcome<TileEntry> {
    let (tx, rx) = mpsc::channel();
    cache.request_tile(file, scale, x, y, move |outcome: JobOutcome<TileEntry>| {
        let _ = tx.send(outcome);
    });
    rx.recv_timeout(TIMEOUT).unwrap()
}

#[test]
fn test_generation_failure_writes_nothing() {
    let generator = Arc::new(MockGenerator::new_fail("disk on fire"));
    let cache = open_cache("sqlite::memory:", generator.clone());

    let err = file_entry(&cache, "/photos/broken.jpg").unwrap_err();
    assert!(matches!(err, JobError::Failed(ref msg) if msg.contains("disk on fire")));

    let all = cache
        .storage()
        .call(|reply| StorageRequest::GetAllFileEntries { reply })
        .unwrap();
    assert!(all.is_empty());

    // Not cached as a failure: the next request tries again
    generator.set_behavior(MockBehavior::Success);
    assert!(file_entry(&cache, "/photos/broken.jpg").is_ok());
    assert_eq!(generator.file_calls(), 2);
}

#[test]
fn test_panicking_generator_does_not_kill_pool() {
    let generator = Arc::new(MockGenerator::new_panic_inducing("decoder exploded"));
    let cache = open_cache("sqlite::memory:", generator.clone());

    for _ in 0..3 {
        let err = file_entry(&cache, "/photos/panic.jpg").unwrap_err();
        assert!(matches!(err, JobError::Panicked(ref msg) if msg.contains("decoder exploded")));
    }
    assert_eq!(cache.pool().size(), 2);

    generator.set_behavior(MockBehavior::Success);
    let file = file_entry(&cache, "/photos/panic.jpg").unwrap();
    assert!(file.id.is_some());
}

#[test]
fn test_aborted_waiter_still_gets_exactly_one_callback() {
    let generator = Arc::new(MockGenerator::new_success().with_delay(Duration::from_millis(200)));
    let cache = open_cache("sqlite::memory:", generator.clone());

    let (tx, rx) = mpsc::channel();
    let aborted_tx = tx.clone();
    let aborted = cache.request_file_entry("/photos/slow.jpg", move |outcome: JobOutcome<FileEntry>| {
        let _ = aborted_tx.send(("aborted", outcome));
    });
    let kept = cache.request_file_entry("/photos/slow.jpg", move |outcome: JobOutcome<FileEntry>| {
        let _ = tx.send(("kept", outcome));
    });
    aborted.set_aborted();

    let mut outcomes: Vec<_> = (0..2).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    outcomes.sort_by_key(|(name, _)| *name);

    assert_eq!(outcomes[0].0, "aborted");
    assert_eq!(outcomes[0].1, Err(JobError::Aborted));
    assert_eq!(outcomes[1].0, "kept");
    assert!(outcomes[1].1.is_ok());

    assert!(kept.wait_timeout(TIMEOUT));
    assert!(!kept.is_failed());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_unstored_file_and_bad_coordinates_fail_fast() {
    let generator = Arc::new(MockGenerator::new_success());
    let cache = open_cache("sqlite::memory:", generator.clone());

    let unstored = FileEntry::new("/photos/never.jpg", 1, 1, "h");
    assert!(matches!(tile(&cache, &unstored, 0, 0, 0), Err(JobError::NotFound(_))));

    let file = file_entry(&cache, "/photos/c.jpg").unwrap();
    assert!(matches!(tile(&cache, &file, 0, -1, 0), Err(JobError::Failed(_))));
    assert!(matches!(tile(&cache, &file, 2, 1, 0), Err(JobError::NotFound(_))));
    assert_eq!(generator.tile_calls(), 1);
}

#[test]
fn test_changed_content_drops_stale_tiles() {
    let generator = Arc::new(MockGenerator::new_success());
    let cache = open_cache("sqlite::memory:", generator);

    let file = file_entry(&cache, "/photos/d.jpg").unwrap();
    let file_id = file.id.unwrap();
    tile(&cache, &file, 0, 0, 0).unwrap();

    let mut changed = file.clone();
    changed.blob_hash = "hash-after-edit".to_string();
    let stored = cache
        .storage()
        .call(|reply| StorageRequest::StoreFileEntry { entry: changed, reply })
        .unwrap();
    assert_eq!(stored.id, Some(file_id));

    let key = TileKey::new(file_id, 0, 0, 0);
    let stale = cache
        .storage()
        .call(|reply| StorageRequest::GetTile { key, reply })
        .unwrap();
    assert!(stale.is_none());
}

#[test]
fn test_archive_and_corrupt_files() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("bundle.zip");
    std::fs::write(&archive, b"PK\x03\x04 not really zipped").unwrap();
    let corrupt = dir.path().join("broken.png");
    std::fs::write(&corrupt, b"this is not an image").unwrap();

    let cache = open_cache("sqlite::memory:", Arc::new(FsResourceGenerator::new(256, 80)));

    let resource = |path: &std::path::Path| -> JobOutcome<ResourceInfo> {
        let file = file_entry(&cache, path.to_str().unwrap())?;
        let (tx, rx) = mpsc::channel();
        cache.request_resource_info(
            ResourceLocator::from_path(file.path.clone()),
            file.blob(),
            move |outcome: JobOutcome<ResourceInfo>| {
                let _ = tx.send(outcome);
            },
        );
        rx.recv_timeout(TIMEOUT).unwrap()
    };

    let info = resource(&archive).unwrap();
    assert_eq!(info.kind, ResourceKind::Archive);
    assert_eq!((info.width, info.height), (0, 0));

    let err = resource(&corrupt).unwrap_err();
    assert!(matches!(err, JobError::Failed(ref msg) if msg.contains("Decode")));
}

#[test]
fn test_unopenable_database_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened as a database file
    let db = dir.path().to_string_lossy().into_owned();

    let result = StorageActor::spawn(move || async move { open_store(&db).await });
    assert!(result.is_err());
}
