// Fan-in of per-scale results for a multi-scale tile request

use super::inflight::Waiter;
use crate::application::worker::JobOutcome;
use crate::domain::TileEntry;
use crate::error::JobError;
use parking_lot::Mutex;

struct BatchState {
    remaining: usize,
    tiles: Vec<TileEntry>,
    error: Option<JobError>,
    waiter: Option<Waiter<Vec<TileEntry>>>,
}

/// Collects the tiles of every scale and notifies the caller once
///
/// The first failing scale decides the outcome; the tiles of the other
/// scales are dropped.
pub(crate) struct TileBatch {
    state: Mutex<BatchState>,
}

impl TileBatch {
    pub(crate) fn new(scales: usize, waiter: Waiter<Vec<TileEntry>>) -> Self {
        Self {
            state: Mutex::new(BatchState {
                remaining: scales,
                tiles: Vec::new(),
                error: None,
                waiter: Some(waiter),
            }),
        }
    }

    /// Record the result of one scale
    pub(crate) fn add(&self, outcome: JobOutcome<Vec<TileEntry>>) {
        let done = {
            let mut state = self.state.lock();
            match outcome {
                Ok(tiles) => state.tiles.extend(tiles),
                Err(err) => {
                    if state.error.is_none() {
                        state.error = Some(err);
                    }
                }
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 {
                return;
            }

            let waiter = state.waiter.take();
            let outcome = match state.error.take() {
                Some(err) => Err(err),
                None => {
                    let mut tiles = std::mem::take(&mut state.tiles);
                    tiles.sort_by_key(|tile| (tile.scale, tile.y, tile.x));
                    Ok(tiles)
                }
            };
            waiter.map(|waiter| (waiter, outcome))
        };

        // Callback runs without the lock
        if let Some((waiter, outcome)) = done {
            waiter.notify(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::JobHandle;
    use crate::domain::{TileFormat, TileKey};
    use std::sync::Arc;

    fn tile(scale: i32, x: i32, y: i32) -> TileEntry {
        TileEntry::new(TileKey::new(1, scale, x, y), vec![scale as u8], TileFormat::Jpeg)
    }

    fn recording(sink: &Arc<Mutex<Vec<JobOutcome<Vec<TileEntry>>>>>, handle: &JobHandle) -> Waiter<Vec<TileEntry>> {
        let sink = Arc::clone(sink);
        Waiter::new(handle.clone(), Box::new(move |outcome| sink.lock().push(outcome)))
    }

    #[test]
    fn test_tiles_sorted_after_last_scale() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let handle = JobHandle::new();
        let batch = TileBatch::new(2, recording(&sink, &handle));

        batch.add(Ok(vec![tile(1, 0, 0)]));
        assert!(sink.lock().is_empty());
        batch.add(Ok(vec![tile(0, 1, 1), tile(0, 0, 1), tile(0, 1, 0)]));

        let keys: Vec<_> = sink.lock()[0]
            .as_ref()
            .unwrap()
            .iter()
            .map(|t| (t.scale, t.x, t.y))
            .collect();
        assert_eq!(keys, vec![(0, 1, 0), (0, 0, 1), (0, 1, 1), (1, 0, 0)]);
        assert!(handle.is_finished() && !handle.is_failed());
    }

    #[test]
    fn test_first_error_wins() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let handle = JobHandle::new();
        let batch = TileBatch::new(3, recording(&sink, &handle));

        batch.add(Err(JobError::Failed("decode".to_string())));
        batch.add(Ok(vec![tile(1, 0, 0)]));
        batch.add(Err(JobError::NotFound("gone".to_string())));

        assert_eq!(*sink.lock(), vec![Err(JobError::Failed("decode".to_string()))]);
        assert!(handle.is_failed());
    }
}
