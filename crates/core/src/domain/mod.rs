// Domain Layer - Cache records and keys

pub mod entry;
pub mod error;
pub mod key;

// Re-exports
pub use entry::{BlobInfo, FileEntry, ImageInfo, ResourceInfo, ResourceKind, RowId, TileEntry, TileFormat};
pub use error::DomainError;
pub use key::{CacheKey, ResourceLocator, TileKey};
