// Per-key coalescing of concurrent cache requests

use crate::application::worker::{execute_guarded, JobHandle, JobOutcome, PanicGuardResult};
use crate::domain::CacheKey;
use crate::error::JobError;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Cache request callback, invoked exactly once
pub type CacheCallback<T> = Box<dyn FnOnce(JobOutcome<T>) + Send>;

/// One caller attached to an in-flight key
pub(crate) struct Waiter<T> {
    handle: JobHandle,
    callback: CacheCallback<T>,
}

impl<T> Waiter<T> {
    pub(crate) fn new(handle: JobHandle, callback: CacheCallback<T>) -> Self {
        Self { handle, callback }
    }

    /// Deliver the outcome, then move the handle to its terminal state.
    /// A waiter that aborted meanwhile receives `Aborted` instead.
    pub(crate) fn notify(self, outcome: JobOutcome<T>) {
        let outcome = if self.handle.is_aborted() {
            Err(JobError::Aborted)
        } else {
            outcome
        };

        let terminal = outcome.as_ref().err().cloned();
        let callback = self.callback;
        if let PanicGuardResult::Panicked(msg) = execute_guarded(AssertUnwindSafe(move || callback(outcome))) {
            error!(panic_msg = %msg, "Cache callback panicked, aborting");
            std::process::abort();
        }

        match terminal {
            None => self.handle.set_finished(),
            Some(JobError::Aborted) => self.handle.set_aborted(),
            Some(err) => self.handle.set_failed(err),
        }
    }
}

/// Waiters grouped by the key they asked for
///
/// The first caller for a key becomes the leader and runs the lookup; callers
/// arriving before the leader completes only attach.
pub(crate) struct InFlight<T> {
    pending: Mutex<HashMap<CacheKey, Vec<Waiter<T>>>>,
}

impl<T: Clone> InFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a waiter; returns true when the caller must start the lookup
    pub(crate) fn attach(&self, key: &CacheKey, waiter: Waiter<T>) -> bool {
        match self.pending.lock().entry(key.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(waiter);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![waiter]);
                true
            }
        }
    }

    /// True when nobody attached to `key` still wants the result
    pub(crate) fn all_aborted(&self, key: &CacheKey) -> bool {
        self.pending
            .lock()
            .get(key)
            .map_or(true, |waiters| waiters.iter().all(|w| w.handle.is_aborted()))
    }

    /// Detach every waiter of `key` and hand each the outcome; returns how many
    pub(crate) fn complete(&self, key: &CacheKey, outcome: JobOutcome<T>) -> usize {
        // Callbacks run without the lock so they may issue new requests
        let waiters = self.pending.lock().remove(key).unwrap_or_default();
        let count = waiters.len();
        for waiter in waiters {
            waiter.notify(outcome.clone());
        }
        count
    }

    /// Keys with a lookup or generation in progress
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording(sink: &Arc<Mutex<Vec<JobOutcome<u32>>>>) -> CacheCallback<u32> {
        let sink = Arc::clone(sink);
        Box::new(move |outcome| sink.lock().push(outcome))
    }

    #[test]
    fn test_first_attach_leads() {
        let inflight = InFlight::<u32>::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let key = CacheKey::Path("/a.png".to_string());

        assert!(inflight.attach(&key, Waiter::new(JobHandle::new(), recording(&sink))));
        assert!(!inflight.attach(&key, Waiter::new(JobHandle::new(), recording(&sink))));
        assert!(inflight.attach(
            &CacheKey::Path("/b.png".to_string()),
            Waiter::new(JobHandle::new(), recording(&sink))
        ));
        assert_eq!(inflight.len(), 2);
    }

    #[test]
    fn test_complete_fans_out_once() {
        let inflight = InFlight::<u32>::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let key = CacheKey::ContentHash("abc".to_string());
        let handles: Vec<_> = (0..3).map(|_| JobHandle::new()).collect();
        for handle in &handles {
            inflight.attach(&key, Waiter::new(handle.clone(), recording(&sink)));
        }

        assert_eq!(inflight.complete(&key, Ok(5)), 3);
        assert_eq!(inflight.complete(&key, Ok(6)), 0);

        assert_eq!(*sink.lock(), vec![Ok(5), Ok(5), Ok(5)]);
        assert!(handles.iter().all(|h| h.is_finished() && !h.is_failed()));
        assert_eq!(inflight.len(), 0);
    }

    #[test]
    fn test_failure_marks_every_handle_failed() {
        let inflight = InFlight::<u32>::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let key = CacheKey::Path("/broken.png".to_string());
        let handle = JobHandle::new();
        inflight.attach(&key, Waiter::new(handle.clone(), recording(&sink)));

        inflight.complete(&key, Err(JobError::Failed("truncated".to_string())));

        assert!(handle.is_failed());
        assert_eq!(handle.error(), Some(JobError::Failed("truncated".to_string())));
    }

    #[test]
    fn test_aborted_waiter_gets_aborted() {
        let inflight = InFlight::<u32>::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let key = CacheKey::Path("/a.png".to_string());
        let aborted = JobHandle::new();
        let live = JobHandle::new();
        inflight.attach(&key, Waiter::new(aborted.clone(), recording(&sink)));
        inflight.attach(&key, Waiter::new(live.clone(), recording(&sink)));

        aborted.set_aborted();
        assert!(!inflight.all_aborted(&key));
        live.set_aborted();
        assert!(inflight.all_aborted(&key));

        inflight.complete(&key, Ok(1));
        assert_eq!(*sink.lock(), vec![Err(JobError::Aborted), Err(JobError::Aborted)]);
    }
}
