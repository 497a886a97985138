//! Named, typed resource identifiers and the lock registry behind them.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind tag distinguishing resources that happen to share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceTag {
    /// Connection and session state.
    State,
    /// Configuration tables.
    Config,
    /// Work or packet queues.
    Queue,
    /// Statistics and diagnostics aggregates.
    Stats,
    /// Raw I/O primitives.
    Io,
}

/// Identifier for a logical shared resource.
///
/// Equality and ordering are defined over the (name, tag) pair. The derived
/// `Ord` compares the name first, then the tag, which is the global order the
/// scheduler acquires locks in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    name: String,
    tag: ResourceTag,
}

impl ResourceId {
    /// Create an identifier for the resource called `name` of kind `tag`.
    pub fn new(name: impl Into<String>, tag: ResourceTag) -> Self {
        Self {
            name: name.into(),
            tag,
        }
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource kind tag.
    pub fn tag(&self) -> ResourceTag {
        self.tag
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.name, self.tag)
    }
}

/// Lazily populated registry mapping resource ids to reader/writer locks.
///
/// Entries are created on first use and live for the registry's lifetime.
/// The map itself is guarded by a mutex; the per-resource locks are handed
/// out as `Arc`s so guards can outlive the registry borrow.
pub(crate) struct ResourceRegistry {
    locks: Mutex<HashMap<ResourceId, Arc<RwLock<()>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the lock backing `id`, creating it on first use.
    pub fn lock_for(&self, id: &ResourceId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Number of resources seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
