// Reader for the flat thumbnail cache file of older releases
//
// Layout: back-to-back 82 byte records, no header
//   [0..33)  name checksum, NUL padded
//   [33..66) content checksum, NUL padded
//   [66..82) mtime, thumbnail id, width, height as u32 little endian

use std::collections::HashMap;
use std::path::Path;
use tessera_core::error::Result;
use tracing::{debug, warn};

pub const CHECKSUM_LEN: usize = 33;
pub const RECORD_SIZE: usize = 2 * CHECKSUM_LEN + 4 * 4;

/// One record of the legacy cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEntry {
    pub name_checksum: String,
    pub content_checksum: String,
    pub mtime: u32,
    pub thumbnail_id: u32,
    pub width: u32,
    pub height: u32,
}

impl LegacyEntry {
    fn parse(record: &[u8]) -> Self {
        let word = |index: usize| {
            let start = 2 * CHECKSUM_LEN + index * 4;
            u32::from_le_bytes([record[start], record[start + 1], record[start + 2], record[start + 3]])
        };

        Self {
            name_checksum: checksum(&record[..CHECKSUM_LEN]),
            content_checksum: checksum(&record[CHECKSUM_LEN..2 * CHECKSUM_LEN]),
            mtime: word(0),
            thumbnail_id: word(1),
            width: word(2),
            height: word(3),
        }
    }
}

fn checksum(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Legacy cache loaded into memory, keyed by name checksum
#[derive(Debug, Default)]
pub struct LegacyCache {
    entries: HashMap<String, LegacyEntry>,
    trailing_bytes: usize,
}

impl LegacyCache {
    /// Read and parse a cache file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let cache = Self::from_bytes(&bytes);
        debug!(path = %path.display(), entries = cache.len(), "Loaded legacy cache");
        Ok(cache)
    }

    /// Parse every full record; a trailing partial record is skipped
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let records = bytes.chunks_exact(RECORD_SIZE);
        let trailing_bytes = records.remainder().len();

        // Later records win, like re-inserting into the map
        let entries = records
            .map(LegacyEntry::parse)
            .map(|entry| (entry.name_checksum.clone(), entry))
            .collect();

        if trailing_bytes > 0 {
            warn!(trailing_bytes = trailing_bytes, "Ignoring partial record at end of legacy cache");
        }

        Self {
            entries,
            trailing_bytes,
        }
    }

    pub fn get_entry(&self, name_checksum: &str) -> Option<&LegacyEntry> {
        self.entries.get(name_checksum)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the ignored partial record at the end of the file (0 if none)
    pub fn trailing_bytes(&self) -> usize {
        self.trailing_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = &LegacyEntry> {
        self.entries.values()
    }
}
