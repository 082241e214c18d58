//! Worker pool running cancellable fetch tasks.
//!
//! Tasks never touch the device. Cancellation is cooperative: a task that is
//! cancelled before it starts skips its body, and the completion callback
//! always runs and learns whether cancellation was requested.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle of a submitted (or about to be submitted) task.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Default)]
struct PendingTasks {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingTasks {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    pending: Arc<PendingTasks>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|idx| format!("maptile-worker-{}", idx))
            .build()
            .expect("failed to create maptile worker pool");

        Self {
            pool,
            pending: Arc::new(PendingTasks::default()),
        }
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Tasks submitted and not yet completed.
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Run `body` for `task` on a worker, then `on_complete(was_cancelled)`.
    pub fn submit<B, C>(&self, task: &TaskHandle, body: B, on_complete: C)
    where
        B: FnOnce(&CancellationToken) + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let token = task.token().clone();
        let pending = Arc::clone(&self.pending);
        pending.begin();

        self.pool.spawn(move || {
            if !token.is_cancelled() {
                body(&token);
            }
            on_complete(token.is_cancelled());
            pending.finish();
        });
    }

    /// Create a task and submit it in one step.
    pub fn spawn<B, C>(&self, body: B, on_complete: C) -> TaskHandle
    where
        B: FnOnce(&CancellationToken) + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let task = TaskHandle::new();
        self.submit(&task, body, on_complete);
        task
    }

    /// Block until no task is pending or `timeout` elapses.
    ///
    /// Returns `true` if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
