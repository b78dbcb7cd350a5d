//! A fixed-size pool of worker threads, each with its own bounded job queue.
//! Grounded on `runtime/dispatch.c`: the server keeps one queue per worker
//! rather than a single shared queue, and hands off a newly dispatched
//! action to the next worker in round-robin order so a slow handler only
//! ever stalls its own queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use gracht_communication::jobqueue::{JobQueue, DEFAULT_CAPACITY};
use gracht_communication::error::QueueError;
use gracht_utils::{thread_boot, ThreadPriority};

pub const DEFAULT_WORKER_COUNT: usize = 4;

struct Worker<J> {
    queue: Arc<JobQueue<J>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs every submitted job on one of `worker_count` background threads.
/// With `worker_count <= 1` jobs run synchronously on the submitting thread
/// instead, for the single-threaded server mode.
pub struct WorkerPool<J: Send + 'static> {
    workers: Vec<Worker<J>>,
    next: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    inline: Option<Arc<dyn Fn(J) + Send + Sync>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    pub fn new(worker_count: usize, queue_capacity: usize, handler: impl Fn(J) + Send + Sync + 'static) -> Self {
        Self::with_core_ids(worker_count, queue_capacity, &[], handler, |_| {})
    }

    /// Like [`WorkerPool::new`], additionally pinning worker `i` to
    /// `core_ids[i]` via [`gracht_utils::thread_boot`] for every `i` within
    /// bounds, and running `cleanup` instead of `handler` for whatever a
    /// worker drains from its queue after shutdown has been requested —
    /// pinned from `worker_dowork`'s shutdown tail loop, which only calls
    /// `server_cleanup_message` once `WORKER_SHUTDOWN_REQUEST` is observed.
    ///
    /// Single-threaded mode (`worker_count <= 1`, matching
    /// `configuration->server_workers > 1` gating in the original) runs jobs
    /// inline on the submitting thread instead of spawning a worker.
    pub fn with_core_ids(
        worker_count: usize,
        queue_capacity: usize,
        core_ids: &[usize],
        handler: impl Fn(J) + Send + Sync + 'static,
        cleanup: impl Fn(J) + Send + Sync + 'static,
    ) -> Self {
        let handler = Arc::new(handler);
        if worker_count <= 1 {
            return Self { workers: Vec::new(), next: AtomicUsize::new(0), shutdown: Arc::new(AtomicBool::new(false)), inline: Some(handler) };
        }

        let cleanup = Arc::new(cleanup);
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = (0..worker_count)
            .map(|worker_index| {
                let queue: Arc<JobQueue<J>> = Arc::new(JobQueue::new(queue_capacity));
                let worker_queue = queue.clone();
                let worker_shutdown = shutdown.clone();
                let worker_handler = handler.clone();
                let worker_cleanup = cleanup.clone();
                let core_id = core_ids.get(worker_index).copied();
                let handle = std::thread::spawn(move || {
                    thread_boot(core_id, ThreadPriority::OSDefault);
                    while let Some(job) = worker_queue.pop_blocking(|| worker_shutdown.load(Ordering::Acquire)) {
                        if worker_shutdown.load(Ordering::Acquire) {
                            (worker_cleanup)(job);
                        } else {
                            (worker_handler)(job);
                        }
                    }
                });
                Worker { queue, handle: Some(handle) }
            })
            .collect();

        Self { workers, next: AtomicUsize::new(0), shutdown, inline: None }
    }

    pub fn with_default_capacity(worker_count: usize, handler: impl Fn(J) + Send + Sync + 'static) -> Self {
        Self::new(worker_count, DEFAULT_CAPACITY, handler)
    }

    /// Submits a job to the next worker in round-robin order, or runs it
    /// inline when the pool has no worker threads.
    pub fn submit(&self, job: J) -> Result<(), QueueError> {
        let Some(inline) = &self.inline else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            return self.workers[index].queue.push(job);
        };
        inline(job);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.queue.notify_all();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_on_worker_threads() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(2, 8, move |job: i32| {
            tx.send(job).unwrap();
        });
        for i in 0..10 {
            pool.submit(i).unwrap();
        }
        let mut received: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        received.sort();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn zero_workers_runs_inline() {
        let counter = Arc::new(Counter::new(0));
        let counter_clone = counter.clone();
        let pool: WorkerPool<()> = WorkerPool::new(0, 8, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.submit(()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.worker_count(), 0);
    }
}
