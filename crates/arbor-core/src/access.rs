//! # Access Instrumentation
//!
//! Pluggable interception of field reads and writes. An instrumentation is
//! installed on a node with `Model::instrument`; if it propagates to
//! children it also covers every descendant, so one observation session on
//! a root sees the whole subtree. Several instrumentations may be active at
//! once and each is invoked separately.

use crate::event::EventEnvelope;
use crate::state::Snapshot;
use crate::{FieldPath, NodeId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Kind of field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessKind {
    /// A field read.
    Read,
    /// A field write.
    Write,
}

/// One intercepted field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// The accessed node.
    pub node: NodeId,
    /// The accessed field.
    pub path: FieldPath,
    /// Read or write.
    pub kind: AccessKind,
}

/// Callback run once the accessed field has settled.
///
/// Read callbacks run right after the read with the value that was read;
/// write callbacks run at the transaction boundary with the post-write
/// value.
pub type AccessCallback = Box<dyn FnOnce(&Snapshot) + Send>;

/// Read/write interception hooks.
pub trait AccessInstrumentation: Send + Sync {
    /// Whether this instrumentation also covers descendants of the node it
    /// was installed on.
    fn propagates_to_children(&self) -> bool {
        false
    }

    /// Called before a field read.
    fn will_read(&self, _access: &Access) -> Option<AccessCallback> {
        None
    }

    /// Called before a field write.
    fn will_write(&self, _access: &Access) -> Option<AccessCallback> {
        None
    }

    /// Called for every event sent by a covered node.
    fn did_send(&self, _envelope: &EventEnvelope) {}
}

// =============================================================================
// OBSERVATION SESSION
// =============================================================================

/// Observation session: tracks the fields read through it and calls
/// `on_change` once per transaction when any tracked field is written.
///
/// This is the contract a view layer needs to re-render on change.
pub struct Observation {
    tracked: Mutex<BTreeSet<(NodeId, FieldPath)>>,
    scheduled: Arc<Mutex<bool>>,
    on_change: Arc<dyn Fn() + Send + Sync>,
}

impl Observation {
    /// Create a session calling `on_change` after tracked writes.
    pub fn new(on_change: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            tracked: Mutex::new(BTreeSet::new()),
            scheduled: Arc::new(Mutex::new(false)),
            on_change: Arc::new(on_change),
        })
    }

    /// Fields read so far.
    #[must_use]
    pub fn tracked(&self) -> Vec<(NodeId, FieldPath)> {
        self.tracked.lock().iter().copied().collect()
    }

    /// Forget every tracked field, e.g. before a fresh render pass.
    pub fn reset(&self) {
        self.tracked.lock().clear();
    }
}

impl AccessInstrumentation for Observation {
    fn propagates_to_children(&self) -> bool {
        true
    }

    fn will_read(&self, access: &Access) -> Option<AccessCallback> {
        self.tracked.lock().insert((access.node, access.path));
        None
    }

    fn will_write(&self, access: &Access) -> Option<AccessCallback> {
        if !self.tracked.lock().contains(&(access.node, access.path)) {
            return None;
        }
        {
            let mut scheduled = self.scheduled.lock();
            if *scheduled {
                return None;
            }
            *scheduled = true;
        }
        let scheduled = Arc::clone(&self.scheduled);
        let on_change = Arc::clone(&self.on_change);
        Some(Box::new(move |_snapshot: &Snapshot| {
            *scheduled.lock() = false;
            on_change();
        }))
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("tracked", &self.tracked.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NAME: FieldPath = FieldPath::new(0, "name");
    const AGE: FieldPath = FieldPath::new(1, "age");

    fn access(path: FieldPath, kind: AccessKind) -> Access {
        Access {
            node: NodeId(1),
            path,
            kind,
        }
    }

    #[test]
    fn observation_ignores_untracked_writes() {
        let observation = Observation::new(|| {});
        assert!(observation.will_write(&access(NAME, AccessKind::Write)).is_none());
    }

    #[test]
    fn observation_coalesces_until_callback_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observation = Observation::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        observation.will_read(&access(NAME, AccessKind::Read));
        observation.will_read(&access(AGE, AccessKind::Read));
        assert_eq!(observation.tracked().len(), 2);

        let first = observation.will_write(&access(NAME, AccessKind::Write));
        let second = observation.will_write(&access(AGE, AccessKind::Write));
        assert!(first.is_some());
        assert!(second.is_none());

        let snapshot = Snapshot::new(NodeId(1), Box::new(Marker));
        if let Some(callback) = first {
            callback(&snapshot);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observation.will_write(&access(AGE, AccessKind::Write)).is_some());

        observation.reset();
        assert!(observation.tracked().is_empty());
    }

    #[derive(Clone)]
    struct Marker;

    impl crate::State for Marker {}
}
