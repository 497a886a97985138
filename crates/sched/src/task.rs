//! Task metadata, result handles, and scheduler statistics.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// How a task touches its declared resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Mutating access; excludes every other task on overlapping resources.
    Exclusive,
    /// Read-only access; concurrent with other shared tasks, excluded by
    /// exclusive ones.
    Shared,
}

/// Classification used for throughput statistics only.
///
/// The class has no effect on scheduling order or locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Untyped fire-and-forget work.
    Plain,
    /// Work on behalf of the presentation layer.
    Ui,
    /// Work on behalf of the network layer.
    Network,
    /// Exclusive resource mutation.
    Resource,
    /// Shared resource read.
    Read,
}

impl TaskClass {
    pub(crate) const COUNT: usize = 5;

    pub(crate) fn index(self) -> usize {
        match self {
            TaskClass::Plain => 0,
            TaskClass::Ui => 1,
            TaskClass::Network => 2,
            TaskClass::Resource => 3,
            TaskClass::Read => 4,
        }
    }
}

/// Why a task failed to produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// A bounded try-acquire gave up before every declared lock was held.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),
    /// The scheduler shut down before the task completed.
    #[error("scheduler shut down before the task completed")]
    Cancelled,
    /// `join_timeout` elapsed before the task finished.
    #[error("timed out waiting for the task result")]
    JoinTimeout,
}

/// Handle to a scheduled task's eventual result.
///
/// Dropping the handle detaches the task; it still runs to completion.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Create a handle and the sender its task reports through.
    pub(crate) fn channel() -> (Sender<Result<T, TaskError>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    /// Block until the task finishes and return its result.
    ///
    /// Errors raised inside the task (panics, lock timeouts) propagate here
    /// rather than being swallowed.
    pub fn join(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Block for at most `timeout` waiting for the result.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(TaskError::JoinTimeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(TaskError::Cancelled),
        }
    }

    /// Non-blocking poll for the result.
    pub fn try_join(&self) -> Option<Result<T, TaskError>> {
        self.rx.try_recv().ok()
    }
}

/// Point-in-time snapshot of scheduler throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    scheduled: [u64; TaskClass::COUNT],
    completed: [u64; TaskClass::COUNT],
}

impl SchedStats {
    /// Tasks submitted with the given class.
    pub fn scheduled(&self, class: TaskClass) -> u64 {
        self.scheduled[class.index()]
    }

    /// Tasks of the given class whose bodies ran to completion.
    pub fn completed(&self, class: TaskClass) -> u64 {
        self.completed[class.index()]
    }

    /// Total tasks submitted across all classes.
    pub fn total_scheduled(&self) -> u64 {
        self.scheduled.iter().sum()
    }

    /// Total tasks completed across all classes.
    pub fn total_completed(&self) -> u64 {
        self.completed.iter().sum()
    }
}

/// Live counters updated by workers; snapshotted into [`SchedStats`].
#[derive(Default)]
pub(crate) struct StatCounters {
    scheduled: [AtomicU64; TaskClass::COUNT],
    completed: [AtomicU64; TaskClass::COUNT],
}

impl StatCounters {
    pub fn record_scheduled(&self, class: TaskClass) {
        self.scheduled[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, class: TaskClass) {
        self.completed[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedStats {
        let mut stats = SchedStats::default();
        for i in 0..TaskClass::COUNT {
            stats.scheduled[i] = self.scheduled[i].load(Ordering::Relaxed);
            stats.completed[i] = self.completed[i].load(Ordering::Relaxed);
        }
        stats
    }
}
