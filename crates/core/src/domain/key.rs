// Cache Keys

use crate::domain::entry::RowId;
use serde::{Deserialize, Serialize};

/// Identity of a single tile: (file, scale, x, y)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub file_id: RowId,
    pub scale: i32,
    pub x: i32,
    pub y: i32,
}

impl TileKey {
    pub fn new(file_id: RowId, scale: i32, x: i32, y: i32) -> Self {
        Self {
            file_id,
            scale,
            x,
            y,
        }
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tile({}, {}, {}x{})", self.file_id, self.scale, self.x, self.y)
    }
}

/// Where a resource's bytes can be read from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLocator {
    pub path: String,
}

impl ResourceLocator {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl std::fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file://{}", self.path)
    }
}

/// Any key the cache pipeline can look up or generate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// FileEntry by path
    Path(String),
    /// TileEntry by coordinate
    Tile(TileKey),
    /// ResourceInfo by content hash
    ContentHash(String),
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Path(path) => write!(f, "path:{}", path),
            CacheKey::Tile(key) => write!(f, "tile:{}/{}/{}/{}", key.file_id, key.scale, key.x, key.y),
            CacheKey::ContentHash(hash) => write!(f, "hash:{}", hash),
        }
    }
}
