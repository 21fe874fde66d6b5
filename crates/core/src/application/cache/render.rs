// Tile renders in progress, one per (file, scale)

use crate::domain::{RowId, TileKey};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Tiles waiting on the render of their scale
///
/// A render produces every tile of a scale, so tile misses of the same
/// scale join the render already running instead of starting their own.
pub(crate) struct Renders {
    running: Mutex<HashMap<(RowId, i32), Vec<TileKey>>>,
}

impl Renders {
    pub(crate) fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Register `key` with the render of its scale; returns true when the
    /// caller must start that render
    pub(crate) fn join(&self, key: TileKey) -> bool {
        match self.running.lock().entry((key.file_id, key.scale)) {
            Entry::Occupied(mut keys) => {
                if !keys.get().contains(&key) {
                    keys.get_mut().push(key);
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![key]);
                true
            }
        }
    }

    /// Tiles currently waiting on the render of (`file_id`, `scale`)
    pub(crate) fn keys(&self, file_id: RowId, scale: i32) -> Vec<TileKey> {
        self.running
            .lock()
            .get(&(file_id, scale))
            .cloned()
            .unwrap_or_default()
    }

    /// End the render of (`file_id`, `scale`) and hand back every tile that joined it
    pub(crate) fn finish(&self, file_id: RowId, scale: i32) -> Vec<TileKey> {
        self.running.lock().remove(&(file_id, scale)).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.running.lock().len()
    }
}
