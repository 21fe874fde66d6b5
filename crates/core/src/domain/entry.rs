// Cache Records (persisted by the storage actor)

use crate::domain::error::DomainError;
use crate::domain::key::TileKey;
use serde::{Deserialize, Serialize};

/// Database row identifier
pub type RowId = i64;

/// Compressed pixel format of a stored tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileFormat {
    Jpeg,
    Png,
}

impl TileFormat {
    /// Integer tag stored in the `format` column (0: JPEG, 1: PNG)
    pub fn as_i64(self) -> i64 {
        match self {
            TileFormat::Jpeg => 0,
            TileFormat::Png => 1,
        }
    }

    pub fn from_i64(tag: i64) -> Result<Self, DomainError> {
        match tag {
            0 => Ok(TileFormat::Jpeg),
            1 => Ok(TileFormat::Png),
            other => Err(DomainError::InvalidTileFormat(other)),
        }
    }
}

impl std::fmt::Display for TileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileFormat::Jpeg => write!(f, "JPEG"),
            TileFormat::Png => write!(f, "PNG"),
        }
    }
}

/// Content-hash record: the same bytes seen under different paths share one blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub hash: String,
    pub size: u64,
}

impl BlobInfo {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }
}

/// File record keyed by path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Assigned by the store on first insert
    pub id: Option<RowId>,
    pub path: String,
    pub size: u64,
    /// Modification time, seconds since epoch
    pub mtime: i64,
    pub blob_hash: String,
    /// Name of the decoder that understood the file, if any
    pub handler: Option<String>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64, mtime: i64, blob_hash: impl Into<String>) -> Self {
        Self {
            id: None,
            path: path.into(),
            size,
            mtime,
            blob_hash: blob_hash.into(),
            handler: None,
        }
    }

    pub fn with_id(mut self, id: RowId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn blob(&self) -> BlobInfo {
        BlobInfo::new(self.blob_hash.clone(), self.size)
    }
}

impl std::fmt::Display for FileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "FileEntry({}, {})", id, self.path),
            None => write!(f, "FileEntry(new, {})", self.path),
        }
    }
}

/// One compressed tile of an image at a zoom scale and grid position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileEntry {
    pub file_id: RowId,
    pub scale: i32,
    pub x: i32,
    pub y: i32,
    pub data: Vec<u8>,
    pub format: TileFormat,
    /// Encoder quality the data was written with (0 when not applicable)
    pub quality: u8,
}

impl TileEntry {
    pub fn new(key: TileKey, data: Vec<u8>, format: TileFormat) -> Self {
        Self {
            file_id: key.file_id,
            scale: key.scale,
            x: key.x,
            y: key.y,
            data,
            format,
            quality: 0,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.file_id, self.scale, self.x, self.y)
    }
}

/// Kind of decoded artifact a resource turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Image,
    Archive,
}

impl ResourceKind {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "IMAGE" => Ok(ResourceKind::Image),
            "ARCHIVE" => Ok(ResourceKind::Archive),
            other => Err(DomainError::InvalidResourceKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Image => write!(f, "IMAGE"),
            ResourceKind::Archive => write!(f, "ARCHIVE"),
        }
    }
}

/// Decoded-artifact descriptor keyed by content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Option<RowId>,
    pub blob_hash: String,
    pub kind: ResourceKind,
    pub handler: String,
    pub width: u32,
    pub height: u32,
}

impl ResourceInfo {
    pub fn image(blob_hash: impl Into<String>, handler: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: None,
            blob_hash: blob_hash.into(),
            kind: ResourceKind::Image,
            handler: handler.into(),
            width,
            height,
        }
    }

    /// Archive resources have no pixel dimensions of their own
    pub fn archive(blob_hash: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: None,
            blob_hash: blob_hash.into(),
            kind: ResourceKind::Archive,
            handler: handler.into(),
            width: 0,
            height: 0,
        }
    }
}

/// Image dimensions attached to a stored resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: Option<RowId>,
    pub resource_id: RowId,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn new(resource_id: RowId, width: u32, height: u32) -> Self {
        Self {
            id: None,
            resource_id,
            width,
            height,
        }
    }
}
