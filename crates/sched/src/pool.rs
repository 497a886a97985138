//! Fixed-size worker pool draining a shared job queue.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::trace;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads sized at construction; the pool never grows or shrinks.
pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|index| {
                let rx: Receiver<Job> = rx.clone();
                thread::Builder::new()
                    .name(format!("sched-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        trace!("scheduler worker {index} exiting");
                    })
                    .expect("failed to spawn scheduler worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // Send only fails once every worker has died, which cannot
            // happen while the receiver clones are alive.
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers drain outstanding jobs and exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // Dropping the pool joins the workers after the queue drains.
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn clamps_to_at_least_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.worker_count(), 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
