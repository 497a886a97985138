//! The scheduler: lock ordering, execution strategies, task submission.

use crate::pool::WorkerPool;
use crate::resource::{ResourceId, ResourceRegistry};
use crate::task::{AccessMode, SchedStats, StatCounters, TaskClass, TaskError, TaskHandle};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type ArcReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type ArcWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

enum ResourceGuard {
    Read(ArcReadGuard),
    Write(ArcWriteGuard),
}

/// Guards held for one task.
///
/// Locks were acquired in the global (sorted) order; drop releases them LIFO.
/// Because release rides on `Drop`, a panic mid-task cannot leak a held lock.
struct LockSet {
    guards: Vec<ResourceGuard>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Execution strategy, selected at construction.
enum Executor {
    /// Fixed worker pool; tasks run off the caller's thread.
    Pool(WorkerPool),
    /// Every task runs synchronously on the calling thread, with the same
    /// locking discipline as the pool. Lets concurrency bugs that only
    /// surface under a real pool be triaged deterministically.
    Immediate,
}

struct SchedulerInner {
    registry: ResourceRegistry,
    executor: Executor,
    stats: StatCounters,
}

/// Worker-pool wrapper that serializes access to named shared resources.
///
/// Cloning is cheap; clones share the pool, the resource registry, and the
/// statistics counters.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Pool-backed scheduler with `threads` workers (clamped to at least 1).
    pub fn pooled(threads: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: ResourceRegistry::new(),
                executor: Executor::Pool(WorkerPool::new(threads)),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Synchronous scheduler: every task executes immediately on the
    /// calling thread.
    pub fn immediate() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: ResourceRegistry::new(),
                executor: Executor::Immediate,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Run `f` with exclusive access to every resource in `resources`.
    pub fn schedule<T, F>(&self, resources: &[ResourceId], f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(resources, AccessMode::Exclusive, TaskClass::Resource, None, f)
    }

    /// Run `f` with shared (read) access to every resource in `resources`.
    ///
    /// Concurrent readers over the same set are allowed; an exclusive task on
    /// an overlapping resource blocks until readers finish, and vice versa.
    pub fn schedule_read<T, F>(&self, resources: &[ResourceId], f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(resources, AccessMode::Shared, TaskClass::Read, None, f)
    }

    /// Exclusive scheduling with a bounded try-acquire.
    ///
    /// Meant for best-effort housekeeping: if any declared lock cannot be
    /// taken within `timeout` the task completes with
    /// [`TaskError::LockTimeout`] and the cycle is skipped, never escalated.
    pub fn try_schedule<T, F>(
        &self,
        resources: &[ResourceId],
        timeout: Duration,
        f: F,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(
            resources,
            AccessMode::Exclusive,
            TaskClass::Resource,
            Some(timeout),
            f,
        )
    }

    /// Run `f` with no resource locking.
    ///
    /// `class` feeds the throughput statistics only; it has no effect on
    /// execution order.
    pub fn spawn<T, F>(&self, class: TaskClass, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(&[], AccessMode::Exclusive, class, None, f)
    }

    /// Snapshot of the per-class throughput counters.
    pub fn stats(&self) -> SchedStats {
        self.inner.stats.snapshot()
    }

    /// Number of distinct resources the registry has seen.
    pub fn resource_count(&self) -> usize {
        self.inner.registry.len()
    }

    fn submit<T, F>(
        &self,
        resources: &[ResourceId],
        mode: AccessMode,
        class: TaskClass,
        try_timeout: Option<Duration>,
        f: F,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, handle) = TaskHandle::channel();
        let inner = Arc::clone(&self.inner);
        let ids = normalize(resources);

        self.inner.stats.record_scheduled(class);

        let job = move || {
            let locks = match acquire(&inner.registry, &ids, mode, try_timeout) {
                Ok(set) => set,
                Err(err) => {
                    if let TaskError::LockTimeout(timeout) = &err {
                        warn!(
                            "skipping task: lock acquisition over {} resource(s) \
                             timed out after {timeout:?}",
                            ids.len()
                        );
                    }
                    let _ = tx.send(Err(err));
                    return;
                }
            };

            let result = catch_unwind(AssertUnwindSafe(f));
            drop(locks);

            inner.stats.record_completed(class);
            let _ = tx.send(result.map_err(|payload| TaskError::Panicked(panic_message(payload))));
        };

        match &self.inner.executor {
            Executor::Pool(pool) => pool.submit(Box::new(job)),
            Executor::Immediate => job(),
        }

        handle
    }
}

/// Sort the declared set into the global order and drop duplicates, so a
/// task naming the same resource twice does not self-deadlock.
fn normalize(resources: &[ResourceId]) -> Vec<ResourceId> {
    let mut ids = resources.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

fn acquire(
    registry: &ResourceRegistry,
    ids: &[ResourceId],
    mode: AccessMode,
    try_timeout: Option<Duration>,
) -> Result<LockSet, TaskError> {
    let mut guards = Vec::with_capacity(ids.len());
    for id in ids {
        let lock = registry.lock_for(id);
        let guard = match (mode, try_timeout) {
            (AccessMode::Shared, None) => ResourceGuard::Read(lock.read_arc()),
            (AccessMode::Exclusive, None) => ResourceGuard::Write(lock.write_arc()),
            (AccessMode::Shared, Some(timeout)) => match lock.try_read_arc_for(timeout) {
                Some(guard) => ResourceGuard::Read(guard),
                None => return Err(TaskError::LockTimeout(timeout)),
            },
            (AccessMode::Exclusive, Some(timeout)) => match lock.try_write_arc_for(timeout) {
                Some(guard) => ResourceGuard::Write(guard),
                None => return Err(TaskError::LockTimeout(timeout)),
            },
        };
        guards.push(guard);
    }
    Ok(LockSet { guards })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceTag;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn state(name: &str) -> ResourceId {
        ResourceId::new(name, ResourceTag::State)
    }

    /// Tracks how many tasks are inside their critical section at once.
    struct Concurrency {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Concurrency {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn overlapping_exclusive_tasks_never_run_concurrently() {
        let sched = Scheduler::pooled(4);
        let tracker = Concurrency::new();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                sched.schedule(&[state("connection")], move || {
                    tracker.enter();
                    thread::sleep(Duration::from_millis(2));
                    tracker.exit();
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("task failed");
        }
        assert_eq!(tracker.peak(), 1);
    }

    #[test]
    fn shared_tasks_run_concurrently() {
        let sched = Scheduler::pooled(4);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                sched.schedule_read(&[state("diagnostics")], move || {
                    // All four readers must be inside the critical section at
                    // the same time for the barrier to release.
                    barrier.wait();
                })
            })
            .collect();

        for handle in handles {
            handle
                .join_timeout(Duration::from_secs(5))
                .expect("readers did not overlap");
        }
    }

    #[test]
    fn exclusive_waits_for_readers() {
        let sched = Scheduler::pooled(4);
        let tracker = Concurrency::new();

        let reader_tracker = Arc::clone(&tracker);
        let reader = sched.schedule_read(&[state("diagnostics")], move || {
            reader_tracker.enter();
            thread::sleep(Duration::from_millis(30));
            reader_tracker.exit();
        });

        thread::sleep(Duration::from_millis(5));
        let writer_tracker = Arc::clone(&tracker);
        let writer = sched.schedule(&[state("diagnostics")], move || {
            writer_tracker.enter();
            writer_tracker.exit();
        });

        reader.join().expect("reader failed");
        writer.join().expect("writer failed");
        assert_eq!(tracker.peak(), 1);
    }

    #[test]
    fn opposite_declaration_order_does_not_deadlock() {
        let sched = Scheduler::pooled(4);

        for _ in 0..200 {
            let forward = sched.schedule(&[state("alpha"), state("beta")], || ());
            let backward = sched.schedule(&[state("beta"), state("alpha")], || ());
            forward
                .join_timeout(Duration::from_secs(5))
                .expect("forward task deadlocked");
            backward
                .join_timeout(Duration::from_secs(5))
                .expect("backward task deadlocked");
        }
    }

    #[test]
    fn duplicate_resources_do_not_self_deadlock() {
        let sched = Scheduler::pooled(2);
        let handle = sched.schedule(&[state("queue"), state("queue")], || 7);
        assert_eq!(handle.join_timeout(Duration::from_secs(5)), Ok(7));
    }

    #[test]
    fn immediate_mode_runs_on_the_calling_thread() {
        let sched = Scheduler::immediate();
        let caller = thread::current().id();
        let handle = sched.schedule(&[state("connection")], move || thread::current().id());
        assert_eq!(handle.join(), Ok(caller));
    }

    #[test]
    fn panics_propagate_through_the_handle() {
        let sched = Scheduler::pooled(2);
        let handle: TaskHandle<()> = sched.spawn(TaskClass::Plain, || panic!("boom"));
        match handle.join() {
            Err(TaskError::Panicked(message)) => assert!(message.contains("boom")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[test]
    fn try_schedule_gives_up_after_timeout() {
        let sched = Scheduler::pooled(2);

        let blocker = sched.schedule(&[state("bandwidth")], || {
            thread::sleep(Duration::from_millis(200));
        });
        // Let the blocker take its lock before contending.
        thread::sleep(Duration::from_millis(50));

        let handle = sched.try_schedule(&[state("bandwidth")], Duration::from_millis(10), || ());
        match handle.join() {
            Err(TaskError::LockTimeout(_)) => {}
            other => panic!("expected lock timeout, got {other:?}"),
        }

        blocker.join().expect("blocker failed");
    }

    #[test]
    fn unrelated_resources_run_in_parallel() {
        let sched = Scheduler::pooled(2);
        let barrier = Arc::new(Barrier::new(2));

        let left_barrier = Arc::clone(&barrier);
        let left = sched.schedule(&[state("left")], move || {
            left_barrier.wait();
        });
        let right_barrier = Arc::clone(&barrier);
        let right = sched.schedule(&[state("right")], move || {
            right_barrier.wait();
        });

        left.join_timeout(Duration::from_secs(5))
            .expect("unrelated tasks serialized");
        right
            .join_timeout(Duration::from_secs(5))
            .expect("unrelated tasks serialized");
    }

    #[test]
    fn stats_count_scheduled_and_completed() {
        let sched = Scheduler::immediate();
        sched.spawn(TaskClass::Network, || ()).join().unwrap();
        sched.spawn(TaskClass::Network, || ()).join().unwrap();
        sched
            .schedule_read(&[state("diagnostics")], || ())
            .join()
            .unwrap();

        let stats = sched.stats();
        assert_eq!(stats.scheduled(TaskClass::Network), 2);
        assert_eq!(stats.completed(TaskClass::Network), 2);
        assert_eq!(stats.scheduled(TaskClass::Read), 1);
        assert_eq!(stats.total_scheduled(), 3);
    }

    #[test]
    fn results_flow_back_through_the_handle() {
        let sched = Scheduler::pooled(2);
        let handle = sched.schedule(&[state("connection")], || 40 + 2);
        assert_eq!(handle.join(), Ok(42));
    }
}
