// Worker Pool - resizable set of threads draining one shared job queue

pub mod constants;
mod handle;
mod panic_guard;

use constants::WORKER_THREAD_PREFIX;
pub use handle::JobHandle;
pub use panic_guard::{execute_guarded, PanicGuardResult};

use crate::application::queue::BlockingQueue;
use crate::error::{AppError, JobError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Outcome handed to a job's completion callback
pub type JobOutcome<T> = std::result::Result<T, JobError>;

/// Completion callback, invoked on the worker thread that ran the job
pub type JobCallback<J> = Box<dyn FnOnce(J, JobOutcome<<J as Job>::Output>) + Send>;

/// A unit of work executed exactly once by one worker thread
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    /// Do the work. Long running jobs should poll `handle.is_aborted()`
    /// at safe points and return `Err(JobError::Aborted)` when set.
    fn run(&mut self, handle: &JobHandle) -> JobOutcome<Self::Output>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

enum Dispatch {
    Run,
    Reject,
}

struct Task {
    handle: JobHandle,
    body: Box<dyn FnOnce(Dispatch, &JobHandle) + Send>,
}

impl Task {
    fn execute(self) {
        let dispatch = if self.handle.is_aborted() {
            Dispatch::Reject
        } else {
            Dispatch::Run
        };
        (self.body)(dispatch, &self.handle);
    }

    fn reject(self) {
        self.handle.set_aborted();
        (self.body)(Dispatch::Reject, &self.handle);
    }
}

enum Message {
    Run(Task),
    /// Retire whichever worker receives it
    Stop,
}

struct Shared {
    queue: BlockingQueue<Message>,
    aborted: AtomicBool,
    /// Jobs queued or running
    pending: Mutex<usize>,
    idle: Condvar,
    /// Indices of workers that left their loop and await joining
    exited: Mutex<Vec<usize>>,
    exit: Condvar,
}

impl Shared {
    fn job_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn worker_exited(&self, index: usize) {
        self.exited.lock().push(index);
        self.exit.notify_all();
    }

    fn reject_queued(&self) {
        for message in self.queue.drain() {
            if let Message::Run(task) = message {
                task.reject();
                self.job_done();
            }
        }
    }
}

#[derive(Default)]
struct Threads {
    workers: BTreeMap<usize, JoinHandle<()>>,
    next_index: usize,
    /// Workers asked to stop (or aborted) but not yet joined
    stopping: usize,
}

/// Fixed-size but resizable pool of worker threads
///
/// # Example
/// ```text
/// let pool = WorkerPool::new(4)?;
/// let handle = pool.request(job, Some(Box::new(|job, outcome| { ... })));
/// pool.wait();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Threads>,
}

impl WorkerPool {
    /// Create a pool and start `num_threads` workers
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(AppError::Config("worker pool needs at least one thread".to_string()));
        }

        let pool = Self {
            shared: Arc::new(Shared {
                queue: BlockingQueue::new(),
                aborted: AtomicBool::new(false),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                exited: Mutex::new(Vec::new()),
                exit: Condvar::new(),
            }),
            threads: Mutex::new(Threads::default()),
        };

        for _ in 0..num_threads {
            pool.start_thread()?;
        }

        info!(threads = num_threads, "Worker pool started");
        Ok(pool)
    }

    /// Add one worker
    pub fn start_thread(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(AppError::Internal("worker pool was aborted".to_string()));
        }

        let mut threads = self.threads.lock();
        let index = threads.next_index;
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(format!("{}-{}", WORKER_THREAD_PREFIX, index))
            .spawn(move || worker_loop(index, shared))?;

        threads.next_index += 1;
        threads.workers.insert(index, handle);
        Ok(())
    }

    /// Retire one worker once the jobs queued ahead of this call are taken.
    /// Returns false if no running worker was left to stop.
    pub fn stop_thread(&self) -> bool {
        let mut threads = self.threads.lock();
        if threads.workers.len() <= threads.stopping {
            return false;
        }
        if self.shared.queue.push(Message::Stop).is_err() {
            // Closed queue means the pool is aborting and every worker is on its way out
            return false;
        }
        threads.stopping += 1;
        true
    }

    /// Stop every worker after its current job; queued jobs are not run
    ///
    /// Their handles are set aborted and their callbacks receive
    /// `JobError::Aborted`.
    pub fn abort_thread(&self) {
        if self.shared.aborted.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut threads = self.threads.lock();
            threads.stopping = threads.workers.len();
        }

        self.shared.queue.close();
        self.shared.reject_queued();
        warn!("Worker pool aborted");
    }

    /// Block until every stopped or aborted worker thread has terminated
    ///
    /// Refuses (with a warning) when called on one of the pool's own workers,
    /// which could be the one holding the pending stop request.
    pub fn join_thread(&self) {
        if self.is_worker_thread() {
            warn!("join_thread called from a pool worker, not waiting");
            return;
        }

        // Workers asked to stop before this call; later stops are not awaited
        let target = self.threads.lock().stopping;

        let indices: Vec<usize> = {
            let mut exited = self.shared.exited.lock();
            while exited.len() < target {
                self.shared.exit.wait(&mut exited);
            }
            exited.drain(..).collect()
        };

        let handles: Vec<(usize, JoinHandle<()>)> = {
            let mut threads = self.threads.lock();
            threads.stopping = threads.stopping.saturating_sub(indices.len());
            indices
                .into_iter()
                .filter_map(|index| threads.workers.remove(&index).map(|h| (index, h)))
                .collect()
        };

        for (index, handle) in handles {
            if handle.join().is_err() {
                error!(worker = index, "Worker thread terminated abnormally");
            }
        }
    }

    fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.threads
            .lock()
            .workers
            .values()
            .any(|handle| handle.thread().id() == current)
    }

    /// Queue `job` and return its handle immediately
    ///
    /// The callback runs on the worker thread that executes the job, before
    /// the handle reaches its terminal state. If the pool has been aborted the
    /// job is rejected on the calling thread.
    pub fn request<J: Job>(&self, job: J, callback: Option<JobCallback<J>>) -> JobHandle {
        self.request_with_handle(JobHandle::new(), job, callback)
    }

    /// Like `request`, reusing a handle the caller created beforehand
    pub fn request_with_handle<J: Job>(
        &self,
        handle: JobHandle,
        job: J,
        callback: Option<JobCallback<J>>,
    ) -> JobHandle {
        let task = Task {
            handle: handle.clone(),
            body: Box::new(move |dispatch, handle| run_job(job, callback, dispatch, handle)),
        };

        *self.shared.pending.lock() += 1;

        if let Err(Message::Run(task)) = self.shared.queue.push(Message::Run(task)) {
            debug!("Job submitted to aborted pool, rejecting");
            task.reject();
            self.shared.job_done();
        }

        handle
    }

    /// Block until the queue is empty and every dispatched job has completed
    pub fn wait(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Number of workers not asked to stop
    pub fn size(&self) -> usize {
        let threads = self.threads.lock();
        threads.workers.len().saturating_sub(threads.stopping)
    }

    /// Jobs waiting in the queue (not yet picked up)
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let current = thread::current().id();
        let workers = std::mem::take(&mut self.threads.lock().workers);

        for _ in 0..workers.len() {
            let _ = self.shared.queue.push(Message::Stop);
        }

        for (index, handle) in workers {
            // The last reference may be dropped from inside one of our own callbacks
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(worker = index, "Worker thread terminated abnormally");
            }
        }
        debug!("Worker pool dropped");
    }
}

fn worker_loop(index: usize, shared: Arc<Shared>) {
    info!(worker = index, "Worker started");

    while !shared.aborted.load(Ordering::SeqCst) {
        let task = match shared.queue.pop() {
            Some(Message::Run(task)) => task,
            Some(Message::Stop) | None => break,
        };

        if shared.aborted.load(Ordering::SeqCst) {
            task.reject();
            shared.job_done();
            break;
        }

        task.execute();
        shared.job_done();
    }

    shared.worker_exited(index);
    info!(worker = index, "Worker stopped");
}

fn run_job<J: Job>(mut job: J, callback: Option<JobCallback<J>>, dispatch: Dispatch, handle: &JobHandle) {
    let outcome = match dispatch {
        Dispatch::Reject => Err(JobError::Aborted),
        Dispatch::Run => {
            debug!(job = job.name(), "Job started");
            match execute_guarded(AssertUnwindSafe(|| job.run(handle))) {
                PanicGuardResult::Success(outcome) => outcome,
                PanicGuardResult::Panicked(msg) => Err(JobError::Panicked(msg)),
            }
        }
    };

    let terminal = match &outcome {
        Ok(_) => None,
        Err(err) => Some(err.clone()),
    };

    if let Err(err) = &outcome {
        if *err != JobError::Aborted {
            warn!(job = job.name(), error = %err, "Job failed");
        }
    }

    if let Some(callback) = callback {
        if let PanicGuardResult::Panicked(msg) = execute_guarded(AssertUnwindSafe(|| callback(job, outcome))) {
            error!(panic_msg = %msg, "Job completion callback panicked, aborting");
            std::process::abort();
        }
    }

    match terminal {
        None => handle.set_finished(),
        Some(JobError::Aborted) => handle.set_aborted(),
        Some(err) => handle.set_failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct PushIndex {
        index: usize,
        sink: Arc<Mutex<Vec<usize>>>,
    }

    impl Job for PushIndex {
        type Output = usize;

        fn run(&mut self, _handle: &JobHandle) -> JobOutcome<usize> {
            self.sink.lock().push(self.index);
            Ok(self.index)
        }
    }

    struct Sleep(Duration);

    impl Job for Sleep {
        type Output = ();

        fn run(&mut self, _handle: &JobHandle) -> JobOutcome<()> {
            thread::sleep(self.0);
            Ok(())
        }
    }

    struct Fail;

    impl Job for Fail {
        type Output = ();

        fn run(&mut self, _handle: &JobHandle) -> JobOutcome<()> {
            Err(JobError::Failed("decode error".to_string()))
        }
    }

    struct Panic;

    impl Job for Panic {
        type Output = ();

        fn run(&mut self, _handle: &JobHandle) -> JobOutcome<()> {
            panic!("corrupt image");
        }
    }

    /// Blocks until the gate opens, so tests can hold a worker busy
    struct Gate(Arc<(Mutex<bool>, Condvar)>);

    impl Gate {
        fn new() -> (Self, Arc<(Mutex<bool>, Condvar)>) {
            let pair = Arc::new((Mutex::new(false), Condvar::new()));
            (Self(Arc::clone(&pair)), pair)
        }
    }

    fn open(pair: &Arc<(Mutex<bool>, Condvar)>) {
        *pair.0.lock() = true;
        pair.1.notify_all();
    }

    impl Job for Gate {
        type Output = ();

        fn run(&mut self, _handle: &JobHandle) -> JobOutcome<()> {
            let mut open = self.0 .0.lock();
            while !*open {
                self.0 .1.wait(&mut open);
            }
            Ok(())
        }
    }

    #[test]
    fn test_every_job_runs_exactly_once() {
        let pool = WorkerPool::new(4).unwrap();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..100)
            .map(|index| {
                pool.request(
                    PushIndex {
                        index,
                        sink: Arc::clone(&sink),
                    },
                    None,
                )
            })
            .collect();

        pool.wait();

        let mut seen = sink.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(handles.iter().all(|h| h.is_finished() && !h.is_failed()));
    }

    #[test]
    fn test_callback_receives_job_and_output() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let handle = pool.request(
            PushIndex { index: 7, sink },
            Some(Box::new(move |job: PushIndex, outcome: JobOutcome<usize>| {
                tx.send((job.index, outcome)).unwrap();
            })),
        );

        let (index, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(index, 7);
        assert_eq!(outcome, Ok(7));
        handle.wait();
        assert!(!handle.is_failed());
    }

    #[test]
    fn test_failure_is_reported_with_cause() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = pool.request(
            Fail,
            Some(Box::new(move |_job: Fail, outcome: JobOutcome<()>| {
                tx.send(outcome).unwrap();
            })),
        );
        handle.wait();

        assert!(handle.is_failed());
        assert_eq!(handle.error(), Some(JobError::Failed("decode error".to_string())));
        assert_eq!(
            rx.recv().unwrap(),
            Err(JobError::Failed("decode error".to_string()))
        );
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();

        let panicked = pool.request(Panic, None);
        panicked.wait();
        assert!(panicked.is_failed());
        assert_eq!(panicked.error(), Some(JobError::Panicked("corrupt image".to_string())));

        // Same single worker still serves jobs
        let sink = Arc::new(Mutex::new(Vec::new()));
        let next = pool.request(PushIndex { index: 1, sink: Arc::clone(&sink) }, None);
        next.wait();
        assert!(!next.is_failed());
        assert_eq!(*sink.lock(), vec![1]);
    }

    #[test]
    fn test_aborted_before_start_is_not_run() {
        let pool = WorkerPool::new(1).unwrap();
        let (gate, pair) = Gate::new();
        let blocker = pool.request(gate, None);

        let sink = Arc::new(Mutex::new(Vec::new()));
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let handle = {
            let called = Arc::clone(&called);
            let seen = Arc::clone(&seen);
            pool.request(
                PushIndex { index: 3, sink: Arc::clone(&sink) },
                Some(Box::new(move |_job: PushIndex, outcome: JobOutcome<usize>| {
                    *seen.lock() = Some(outcome);
                    called.fetch_add(1, Ordering::SeqCst);
                })),
            )
        };
        handle.set_aborted();
        open(&pair);

        pool.wait();
        assert!(blocker.is_finished());
        assert!(sink.lock().is_empty());
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(Err(JobError::Aborted)));
        assert!(handle.is_aborted() && !handle.is_failed());
    }

    #[test]
    fn test_wait_blocks_until_jobs_complete() {
        let pool = WorkerPool::new(2).unwrap();
        let start = std::time::Instant::now();
        for _ in 0..4 {
            pool.request(Sleep(Duration::from_millis(30)), None);
        }
        pool.wait();
        // 4 jobs of 30ms on 2 workers take at least two rounds
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_start_and_stop_threads() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.size(), 2);

        pool.start_thread().unwrap();
        assert_eq!(pool.size(), 3);

        assert!(pool.stop_thread());
        assert_eq!(pool.size(), 2);
        pool.join_thread();
        assert_eq!(pool.size(), 2);

        // Remaining workers still process jobs
        let handle = pool.request(Sleep(Duration::from_millis(1)), None);
        handle.wait();
        assert!(handle.is_finished());

        assert!(pool.stop_thread());
        assert!(pool.stop_thread());
        assert!(!pool.stop_thread());
        pool.join_thread();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_stop_thread_finishes_jobs_queued_before_it() {
        let pool = WorkerPool::new(1).unwrap();
        let sink = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5 {
            pool.request(PushIndex { index, sink: Arc::clone(&sink) }, None);
        }
        pool.stop_thread();
        pool.join_thread();

        assert_eq!(*sink.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_abort_rejects_queued_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let (gate, pair) = Gate::new();
        let running = pool.request(gate, None);

        // Let the single worker pick up the gate job
        while pool.queued() > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let sink = Arc::new(Mutex::new(Vec::new()));
        let queued: Vec<_> = (0..3)
            .map(|index| pool.request(PushIndex { index, sink: Arc::clone(&sink) }, None))
            .collect();

        pool.abort_thread();
        open(&pair);
        pool.join_thread();

        assert!(running.is_finished() && !running.is_aborted());
        assert!(queued.iter().all(|h| h.is_aborted()));
        assert!(sink.lock().is_empty());
        assert_eq!(pool.size(), 0);

        // Submissions after abort are rejected right away
        let late = pool.request(Sleep(Duration::ZERO), None);
        assert!(late.is_aborted());
        assert!(pool.start_thread().is_err());
        pool.wait();
    }

    #[test]
    fn test_join_from_worker_callback_returns() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let (tx, rx) = mpsc::channel();

        let inner = Arc::clone(&pool);
        pool.request(
            Sleep(Duration::from_millis(1)),
            Some(Box::new(move |_job: Sleep, _outcome: JobOutcome<()>| {
                // The stop lands behind this job, on the same worker
                inner.stop_thread();
                inner.join_thread();
                let _ = tx.send("returned");
            })),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("returned"));

        // From outside the pool the stopped worker is joined normally
        pool.join_thread();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_size_answers_while_join_waits() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        pool.request(Sleep(Duration::from_millis(200)), None);
        pool.request(Sleep(Duration::from_millis(200)), None);
        assert!(pool.stop_thread());

        let joiner = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.join_thread())
        };
        thread::sleep(Duration::from_millis(20));

        // Must not block behind the joiner
        let (tx, rx) = mpsc::channel();
        {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let _ = tx.send(pool.size());
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Ok(1));

        joiner.join().unwrap();
        pool.wait();
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(AppError::Config(_))));
    }
}
