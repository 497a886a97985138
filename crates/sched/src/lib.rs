#![warn(missing_docs)]
//! Resource-scoped task scheduling.
//!
//! Tasks declare the named, typed resources they touch; the scheduler
//! serializes conflicting access (exclusive vs. shared) while unrelated work
//! runs in parallel on a fixed worker pool. Declared resource sets are sorted
//! into a single global order before any lock is taken, so overlapping sets
//! can never deadlock.

mod pool;
mod resource;
mod scheduler;
mod task;

pub use resource::{ResourceId, ResourceTag};
pub use scheduler::Scheduler;
pub use task::{AccessMode, SchedStats, TaskClass, TaskError, TaskHandle};
