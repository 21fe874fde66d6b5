// Shared completion token for a job or cache request

use crate::error::JobError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct HandleState {
    aborted: bool,
    finished: bool,
    failed: bool,
    error: Option<JobError>,
}

impl HandleState {
    fn is_terminal(&self) -> bool {
        self.aborted || self.finished || self.failed
    }
}

/// Extra abort condition of a handle, evaluated when polled
struct AbortCheck(Box<dyn Fn() -> bool + Send + Sync>);

impl std::fmt::Debug for AbortCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AbortCheck")
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<HandleState>,
    done: Condvar,
    abort_check: Option<AbortCheck>,
}

/// Completion token shared between the caller that submitted work and the
/// thread that executes it
///
/// The first terminal transition wins: after `set_aborted`, `set_finished` or
/// `set_failed` has been called once, later calls are ignored. Abort is
/// cooperative; running work notices it only by polling `is_aborted`.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

impl JobHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that also counts as aborted once `check` returns true
    ///
    /// `check` runs outside the handle's lock on every `is_aborted` poll of a
    /// handle that is not yet terminal. A positive answer latches the aborted
    /// state. Waiters blocked in `wait` only wake once some poll observed it.
    pub fn with_abort_check<F>(check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                abort_check: Some(AbortCheck(Box::new(check))),
                ..Inner::default()
            }),
        }
    }

    /// Ask for the work to be skipped or cut short
    pub fn set_aborted(&self) {
        self.transition("aborted", |s| s.aborted = true);
    }

    pub fn is_aborted(&self) -> bool {
        {
            let state = self.inner.state.lock();
            if state.is_terminal() {
                return state.aborted;
            }
        }

        match &self.inner.abort_check {
            Some(check) if (check.0)() => {
                self.set_aborted();
                self.inner.state.lock().aborted
            }
            _ => false,
        }
    }

    /// Mark the work as completed successfully
    pub fn set_finished(&self) {
        self.transition("finished", |s| s.finished = true);
    }

    /// True once the handle reached any terminal state
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().is_terminal()
    }

    /// Mark the work as failed, keeping the cause
    pub fn set_failed(&self, error: JobError) {
        self.transition("failed", move |s| {
            s.failed = true;
            s.error = Some(error);
        });
    }

    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// Failure cause, if the handle ended in the failed state
    pub fn error(&self) -> Option<JobError> {
        self.inner.state.lock().error.clone()
    }

    /// Block until the handle reaches a terminal state
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until terminal or `timeout` elapsed, returns whether terminal
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.is_terminal();
            }
        }
        true
    }

    /// Whether two handles refer to the same token
    pub fn same_as(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn transition<F>(&self, name: &str, apply: F)
    where
        F: FnOnce(&mut HandleState),
    {
        let mut state = self.inner.state.lock();
        if state.is_terminal() {
            debug!(transition = name, "JobHandle already terminal, ignoring");
            return;
        }
        apply(&mut state);
        drop(state);
        self.inner.done.notify_all();
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "JobHandle(aborted={}, finished={}, failed={})",
            state.aborted, state.finished, state.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_handle_is_pending() {
        let handle = JobHandle::new();
        assert!(!handle.is_aborted());
        assert!(!handle.is_finished());
        assert!(!handle.is_failed());
        assert!(handle.error().is_none());
    }

    #[test]
    fn test_wait_returns_after_finish_from_other_thread() {
        let handle = JobHandle::new();
        let setter = {
            let handle = handle.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                handle.set_finished();
            })
        };

        let start = Instant::now();
        handle.wait();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(45), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned too late: {:?}", elapsed);
        assert!(handle.is_finished());
        setter.join().unwrap();
    }

    #[test]
    fn test_abort_first_is_finished_not_failed() {
        let handle = JobHandle::new();
        handle.set_aborted();
        assert!(handle.is_aborted());
        assert!(handle.is_finished());
        assert!(!handle.is_failed());
    }

    #[test]
    fn test_first_terminal_setter_wins() {
        let handle = JobHandle::new();
        handle.set_aborted();
        handle.set_failed(JobError::Failed("late".to_string()));
        handle.set_finished();
        assert!(handle.is_aborted());
        assert!(!handle.is_failed());
        assert!(handle.error().is_none());

        let handle = JobHandle::new();
        handle.set_failed(JobError::Panicked("boom".to_string()));
        handle.set_aborted();
        assert!(handle.is_failed());
        assert!(!handle.is_aborted());
        assert_eq!(handle.error(), Some(JobError::Panicked("boom".to_string())));
    }

    #[test]
    fn test_failed_counts_as_finished() {
        let handle = JobHandle::new();
        handle.set_failed(JobError::Failed("decode".to_string()));
        assert!(handle.is_finished());
        handle.wait();
    }

    #[test]
    fn test_wait_timeout() {
        let handle = JobHandle::new();
        assert!(!handle.wait_timeout(Duration::from_millis(20)));
        handle.set_finished();
        assert!(handle.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_abort_check_latches() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watched = Arc::clone(&flag);
        let handle = JobHandle::with_abort_check(move || watched.load(std::sync::atomic::Ordering::SeqCst));

        assert!(!handle.is_aborted());
        assert!(!handle.is_finished());

        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(handle.is_aborted());
        assert!(handle.is_finished());
        assert!(handle.wait_timeout(Duration::from_millis(20)));

        // Latched: the condition going away does not revive the handle
        flag.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(handle.is_aborted());
    }

    #[test]
    fn test_abort_check_ignored_once_finished() {
        let handle = JobHandle::with_abort_check(|| true);
        handle.set_finished();
        assert!(!handle.is_aborted());
        assert!(!handle.is_failed());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = JobHandle::new();
        let other = handle.clone();
        other.set_aborted();
        assert!(handle.is_aborted());
        assert!(handle.same_as(&other));
        assert!(!handle.same_as(&JobHandle::new()));
    }
}
