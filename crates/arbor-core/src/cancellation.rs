//! # Cancellation Registry
//!
//! One registry per store, shared by every node anchored in it. Each unit
//! of cancellable work is registered with its owning node, a label and
//! optional grouping keys.
//!
//! The registry never runs callbacks itself. Cancelling removes the entries
//! and hands them back as `Cancellable` values, which the caller fires once
//! the graph borrow is released. Removal before firing is what guarantees
//! every unit receives exactly one cancellation callback.

use crate::{CancelId, CancelKey, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Callback invoked when a unit of work is cancelled.
pub type CancelFn = Box<dyn FnOnce() + Send>;

/// A registered unit of cancellable work, removed from its registry.
pub struct Cancellable {
    id: CancelId,
    owner: NodeId,
    label: String,
    keys: BTreeSet<CancelKey>,
    cancel: CancelFn,
}

impl Cancellable {
    /// The registration handle.
    #[must_use]
    pub fn id(&self) -> CancelId {
        self.id
    }

    /// Human-readable label given at registration.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Invoke the cancellation callback.
    pub fn fire(self) {
        tracing::debug!(
            event = "cancel",
            id = self.id.0,
            owner = %self.owner,
            label = %self.label,
            "cancelling registered work"
        );
        (self.cancel)();
    }

    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            owner: self.owner,
            label: self.label.clone(),
            keys: self.keys.iter().cloned().collect(),
        }
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("label", &self.label)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Description of a registered unit, for enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// The registration handle.
    pub id: CancelId,
    /// The node owning the work.
    pub owner: NodeId,
    /// Human-readable label.
    pub label: String,
    /// Grouping keys, sorted.
    pub keys: Vec<CancelKey>,
}

/// Keyed registry of cancellable work.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: BTreeMap<CancelId, Cancellable>,
    ambient: Vec<CancelKey>,
    next_id: u64,
}

impl CancellationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit of work.
    ///
    /// The unit is tagged with `keys` plus every key of the currently open
    /// ambient scopes.
    pub fn register(
        &mut self,
        owner: NodeId,
        label: impl Into<String>,
        keys: impl IntoIterator<Item = CancelKey>,
        cancel: CancelFn,
    ) -> CancelId {
        self.next_id = self.next_id.saturating_add(1);
        let id = CancelId(self.next_id);

        let mut tags: BTreeSet<CancelKey> = keys.into_iter().collect();
        tags.extend(self.ambient.iter().cloned());

        self.entries.insert(
            id,
            Cancellable {
                id,
                owner,
                label: label.into(),
                keys: tags,
                cancel,
            },
        );
        id
    }

    /// Tag an existing registration with an additional key.
    pub fn tag(&mut self, id: CancelId, key: CancelKey) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.keys.insert(key);
                true
            }
            None => false,
        }
    }

    /// Open an ambient scope: later registrations get `key` until the scope
    /// is closed.
    pub fn push_scope(&mut self, key: CancelKey) {
        self.ambient.push(key);
    }

    /// Close the innermost ambient scope.
    pub fn pop_scope(&mut self) -> Option<CancelKey> {
        self.ambient.pop()
    }

    /// Remove one registration for cancellation.
    pub fn cancel(&mut self, id: CancelId) -> Option<Cancellable> {
        self.entries.remove(&id)
    }

    /// Remove every registration tagged with `key`.
    pub fn cancel_all_for_key(&mut self, key: &CancelKey) -> Vec<Cancellable> {
        self.drain_where(|entry| entry.keys.contains(key))
    }

    /// Remove every registration owned by `owner`.
    pub fn cancel_owner(&mut self, owner: NodeId) -> Vec<Cancellable> {
        self.drain_where(|entry| entry.owner == owner)
    }

    /// Remove every registration.
    pub fn cancel_all(&mut self) -> Vec<Cancellable> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Drop a registration whose work completed on its own.
    pub fn complete(&mut self, id: CancelId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Enumerate every registration in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<TaskInfo> {
        self.entries.values().map(Cancellable::info).collect()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain_where(&mut self, predicate: impl Fn(&Cancellable) -> bool) -> Vec<Cancellable> {
        let ids: Vec<CancelId> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("entries", &self.entries.len())
            .field("ambient", &self.ambient)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> CancelFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as CancelFn
            }
        };
        (count, make)
    }

    #[test]
    fn cancel_by_key_leaves_others() {
        let (count, make) = counter();
        let mut registry = CancellationRegistry::new();
        let key = CancelKey::new("k");

        registry.register(NodeId(1), "a", [key.clone()], make());
        registry.register(NodeId(1), "b", [key.clone()], make());
        let other = registry.register(NodeId(1), "c", [CancelKey::new("other")], make());

        let removed = registry.cancel_all_for_key(&key);
        assert_eq!(removed.len(), 2);
        removed.into_iter().for_each(Cancellable::fire);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].id, other);
    }

    #[test]
    fn ambient_scope_tags_registrations() {
        let (_, make) = counter();
        let mut registry = CancellationRegistry::new();

        registry.push_scope(CancelKey::new("screen"));
        let inside = registry.register(NodeId(1), "inside", [], make());
        assert_eq!(registry.pop_scope(), Some(CancelKey::new("screen")));
        let outside = registry.register(NodeId(1), "outside", [], make());

        let removed = registry.cancel_all_for_key(&CancelKey::new("screen"));
        assert_eq!(removed.iter().map(Cancellable::id).collect::<Vec<_>>(), vec![inside]);
        assert!(registry.cancel(outside).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn late_tagging_is_honored() {
        let (_, make) = counter();
        let mut registry = CancellationRegistry::new();
        let id = registry.register(NodeId(1), "late", [], make());

        assert!(registry.tag(id, CancelKey::new("late")));
        assert!(!registry.tag(CancelId(999), CancelKey::new("late")));
        assert_eq!(registry.cancel_all_for_key(&CancelKey::new("late")).len(), 1);
    }

    #[test]
    fn cancel_owner_and_all() {
        let (count, make) = counter();
        let mut registry = CancellationRegistry::new();
        registry.register(NodeId(1), "one", [], make());
        registry.register(NodeId(2), "two", [], make());
        registry.register(NodeId(2), "three", [], make());

        let owned = registry.cancel_owner(NodeId(2));
        assert_eq!(owned.len(), 2);
        let rest = registry.cancel_all();
        assert_eq!(rest.len(), 1);
        assert!(registry.cancel_all().is_empty());

        owned.into_iter().chain(rest).for_each(Cancellable::fire);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn completion_does_not_fire() {
        let (count, make) = counter();
        let mut registry = CancellationRegistry::new();
        let id = registry.register(NodeId(1), "done", [], make());

        assert!(registry.complete(id));
        assert!(!registry.complete(id));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
