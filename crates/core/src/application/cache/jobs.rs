// Generation jobs submitted by the cache pipeline on a miss

use crate::application::worker::{Job, JobHandle, JobOutcome};
use crate::domain::{BlobInfo, FileEntry, ResourceInfo, ResourceLocator, TileEntry};
use crate::error::JobError;
use crate::port::ResourceGenerator;
use std::sync::Arc;

fn ensure_live(handle: &JobHandle) -> JobOutcome<()> {
    if handle.is_aborted() {
        Err(JobError::Aborted)
    } else {
        Ok(())
    }
}

/// Stat and hash one file
pub(crate) struct FileEntryJob {
    pub generator: Arc<dyn ResourceGenerator>,
    pub path: String,
}

impl Job for FileEntryJob {
    type Output = FileEntry;

    fn run(&mut self, handle: &JobHandle) -> JobOutcome<FileEntry> {
        ensure_live(handle)?;
        Ok(self.generator.generate_file_entry(&self.path)?)
    }

    fn name(&self) -> &str {
        "file_entry"
    }
}

/// Render every tile of one scale of a file
pub(crate) struct TileGenerationJob {
    pub generator: Arc<dyn ResourceGenerator>,
    pub file: FileEntry,
    pub scale: i32,
}

impl Job for TileGenerationJob {
    type Output = Vec<TileEntry>;

    fn run(&mut self, handle: &JobHandle) -> JobOutcome<Vec<TileEntry>> {
        ensure_live(handle)?;
        let tiles = self.generator.generate_tiles(&self.file, self.scale, handle)?;
        // Generators poll the handle between tiles; a partial grid must not be stored
        ensure_live(handle)?;
        Ok(tiles)
    }

    fn name(&self) -> &str {
        "tile_generation"
    }
}

/// Describe the decoded artifact of a resource
pub(crate) struct ResourceInfoJob {
    pub generator: Arc<dyn ResourceGenerator>,
    pub locator: ResourceLocator,
    pub blob: BlobInfo,
}

impl Job for ResourceInfoJob {
    type Output = ResourceInfo;

    fn run(&mut self, handle: &JobHandle) -> JobOutcome<ResourceInfo> {
        ensure_live(handle)?;
        Ok(self.generator.generate_resource_info(&self.locator, &self.blob)?)
    }

    fn name(&self) -> &str {
        "resource_info"
    }
}
