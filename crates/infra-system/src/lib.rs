// Tessera Infrastructure - System Adapters
// Implements: ResourceGenerator (filesystem + image codecs), legacy cache reader

pub mod generator;
pub mod legacy_cache;

pub use generator::FsResourceGenerator;
pub use legacy_cache::{LegacyCache, LegacyEntry};
