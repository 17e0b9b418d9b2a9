//! # Store
//!
//! A store owns one graph arena and everything registered against it:
//! subscriptions, event handlers, cancellables, dependency overrides.
//!
//! ## Locking
//!
//! The arena sits behind a reentrant lock wrapping a `RefCell`. A thread
//! holding the lock may re-enter it from inside user callbacks, but the
//! `RefCell` borrow is only ever held for a structural operation that runs
//! no user code. Activation hooks, field transforms, subscribers, handlers
//! and cancellation callbacks all run with the lock held and the borrow
//! released.
//!
//! ## Transactions
//!
//! Every mutation runs inside a transaction. Nested transactions only bump
//! a depth counter; the outermost one drains the deferred queue until it
//! is empty, including callbacks queued by other deferred callbacks.

use crate::cancellation::TaskInfo;
use crate::config::{ReactivationPolicy, RuntimeConfig};
use crate::graph::{Deferred, Graph, Teardown};
use crate::issue::{IssueSink, RuntimeIssue, TracingSink};
use crate::model::Model;
use crate::state::{Detached, State, activate_erased};
use crate::{ArborError, CancelId, CancelKey, NodeId};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// SHARED STATE
// =============================================================================

/// State shared by every handle onto one store.
pub(crate) struct Shared {
    lock: ReentrantMutex<RefCell<Graph>>,
    config: RuntimeConfig,
    sink: Arc<dyn IssueSink>,
}

impl Shared {
    fn new(config: RuntimeConfig, sink: Arc<dyn IssueSink>) -> Arc<Self> {
        Arc::new_cyclic(|store| Self {
            lock: ReentrantMutex::new(RefCell::new(Graph::new(store.clone(), &config))),
            config,
            sink,
        })
    }

    /// Run a structural operation on the arena. `f` must not call back
    /// into user code.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        let guard = self.lock.lock();
        let mut graph = guard.borrow_mut();
        f(&mut graph)
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn report(&self, issue: RuntimeIssue) {
        self.sink.report(issue);
    }

    /// Run `body` as one transaction.
    pub(crate) fn transaction<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        let depth = self.with_graph(|graph| {
            graph.transaction_depth += 1;
            graph.transaction_depth
        });

        let result = body();

        if depth == 1 {
            while let Some(callback) = self.with_graph(Graph::next_deferred) {
                callback();
            }
        }
        self.with_graph(|graph| graph.transaction_depth -= 1);
        result
    }

    /// Run `body` with `key` tagging every registration it makes. The lock
    /// is held throughout, so registrations from other threads wait and
    /// stay untagged.
    pub(crate) fn cancel_scope<R>(&self, key: CancelKey, body: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        self.with_graph(|graph| graph.cancellations.push_scope(key));
        let result = body();
        self.with_graph(|graph| graph.cancellations.pop_scope());
        result
    }

    pub(crate) fn defer(&self, callback: Deferred) {
        self.with_graph(|graph| graph.defer(callback));
    }

    /// Activate a node, then its children and dependency nodes, parent
    /// first. Already-active nodes are skipped.
    pub(crate) fn activate(&self, id: NodeId) {
        let Some((identity, activate)) = self.with_graph(|graph| graph.begin_activation(id)) else {
            return;
        };
        tracing::trace!(event = "activate", node = %id, "running activation");
        activate(&identity);
        for child in self.with_graph(|graph| graph.activation_children(id)) {
            self.activate(child);
        }
    }

    /// Activate nodes attached by a write to `writer`, honoring the
    /// configured reactivation policy.
    pub(crate) fn activate_attached(self: &Arc<Self>, writer: NodeId, inserted: Vec<NodeId>) {
        if inserted.is_empty() {
            return;
        }
        let immediate = match self.config.reactivation {
            ReactivationPolicy::Always => true,
            ReactivationPolicy::WhenPropagating => {
                self.with_graph(|graph| graph.is_propagating(writer))
            }
            ReactivationPolicy::Deferred => false,
        };
        if immediate {
            inserted.into_iter().for_each(|node| self.activate(node));
            return;
        }
        let store = Arc::downgrade(self);
        self.defer(Box::new(move || {
            if let Some(shared) = store.upgrade() {
                inserted.into_iter().for_each(|node| shared.activate(node));
            }
        }));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let graph = self.lock.get_mut().get_mut();
        let mut teardown = Teardown::default();
        for root in graph.roots() {
            teardown.extend(graph.remove_root(root));
        }
        let leftovers = graph.cancellations.cancel_all();
        teardown.fire();
        leftovers.into_iter().for_each(|cancellable| cancellable.fire());
    }
}

// =============================================================================
// STORE HANDLE
// =============================================================================

/// Handle onto a graph store. Clones share the same store.
///
/// Every root anchored in one store shares its single lock, so work on
/// two roots of the same store is serialized. Subtrees that must proceed
/// in parallel belong in separate stores.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(RuntimeConfig::default(), Arc::new(TracingSink))
    }
}

impl Store {
    /// Create a store reporting issues to `sink`.
    #[must_use]
    pub fn new(config: RuntimeConfig, sink: Arc<dyn IssueSink>) -> Self {
        Self {
            shared: Shared::new(config, sink),
        }
    }

    /// Create a store logging issues through `tracing`.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    /// Create a store configured from the environment.
    pub fn from_env() -> Result<Self, ArborError> {
        Ok(Self::with_config(RuntimeConfig::from_env()?))
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Anchor a freestanding value as a new root and activate it.
    ///
    /// Returns `None`, reporting an issue, if the value or one of its
    /// pending children is already attached, frozen or destructed.
    pub fn anchor<M: State>(&self, detached: Detached<M>) -> Option<Model<M>> {
        let (identity, mut value) = detached.into_parts();
        let checked = self.shared.with_graph(|graph| {
            graph
                .validate_identity(&identity)
                .and_then(|()| graph.validate_children(&mut value))
        });
        if let Err(issue) = checked {
            self.shared.report(issue);
            return None;
        }

        let id = identity.id();
        self.shared.transaction(|| {
            let inserted = self.shared.with_graph(|graph| {
                graph.insert_root(Arc::clone(&identity), Box::new(value), activate_erased::<M>)
            });
            tracing::debug!(event = "anchor", node = %id, nodes = inserted.len(), "root anchored");
            inserted.into_iter().for_each(|node| self.shared.activate(node));
        });
        Some(Model::from_identity(identity))
    }

    /// Typed handle onto a live node, if it exists and holds an `M`.
    #[must_use]
    pub fn model<M: State>(&self, id: NodeId) -> Option<Model<M>> {
        self.shared.with_graph(|graph| {
            let matches = graph.value(id)?.as_any().is::<M>();
            matches.then(|| graph.identity(id)).flatten()
        })
        .map(Model::from_identity)
    }

    /// Detach a root. Its subtree is torn down unless other parents keep
    /// parts of it alive.
    pub fn detach_root(&self, id: NodeId) -> bool {
        if !self.shared.with_graph(|graph| graph.is_root(id)) {
            return false;
        }
        self.shared.transaction(|| {
            let teardown = self.shared.with_graph(|graph| graph.remove_root(id));
            tracing::debug!(event = "detach", node = %id, removed = teardown.removed().len(), "root detached");
            teardown.fire();
        });
        true
    }

    /// Tear down every root and cancel every remaining registration.
    pub fn teardown(&self) {
        self.shared.transaction(|| {
            let (teardown, leftovers) = self.shared.with_graph(|graph| {
                let mut teardown = Teardown::default();
                for root in graph.roots() {
                    teardown.extend(graph.remove_root(root));
                }
                (teardown, graph.cancellations.cancel_all())
            });
            teardown.fire();
            leftovers.into_iter().for_each(|cancellable| cancellable.fire());
        });
    }

    /// Run `body` as one transaction: subscribers fire once at the end.
    pub fn transaction<R>(&self, body: impl FnOnce() -> R) -> R {
        self.shared.transaction(body)
    }

    /// Identifiers of every root.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeId> {
        self.shared.with_graph(|graph| graph.roots())
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shared.with_graph(|graph| graph.len())
    }

    /// Check whether `id` is live in this store.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.shared.with_graph(|graph| graph.contains(id))
    }

    /// Every registered cancellable, in registration order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.with_graph(|graph| graph.cancellations.list())
    }

    /// Cancel one registration.
    pub fn cancel(&self, id: CancelId) -> bool {
        match self.shared.with_graph(|graph| graph.cancellations.cancel(id)) {
            Some(cancellable) => {
                cancellable.fire();
                true
            }
            None => false,
        }
    }

    /// Cancel every registration tagged with `key`, store-wide. Returns how
    /// many were cancelled.
    pub fn cancel_all_for_key(&self, key: &CancelKey) -> usize {
        let removed = self
            .shared
            .with_graph(|graph| graph.cancellations.cancel_all_for_key(key));
        let count = removed.len();
        removed.into_iter().for_each(|cancellable| cancellable.fire());
        count
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        self.shared.config()
    }

    /// Report an issue to the store's sink.
    pub fn report(&self, issue: RuntimeIssue) {
        self.shared.report(issue);
    }

    /// Check whether two handles refer to the same store.
    #[must_use]
    pub fn same_store(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("nodes", &self.node_count())
            .field("config", self.config())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::CollectingSink;
    use crate::state::{Child, ChildSlot, Field};
    use crate::{EdgePath, FieldPath, Lifetime};
    use parking_lot::Mutex;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Leaf {
        value: i64,
    }

    impl State for Leaf {}

    #[derive(Clone, Debug)]
    struct Root {
        leaf: Child<Leaf>,
    }

    impl State for Root {
        fn children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
            vec![(EdgePath::field(LEAF.path()), &mut self.leaf as &mut dyn ChildSlot)]
        }
    }

    const LEAF: Field<Root, Child<Leaf>> =
        Field::new(FieldPath::new(0, "leaf"), |r| &r.leaf, |r| &mut r.leaf);

    fn root() -> Detached<Root> {
        Detached::new(Root {
            leaf: Child::new(Detached::new(Leaf::default())),
        })
    }

    #[test]
    fn anchor_activates_whole_subtree() {
        let store = Store::default();
        let model = store.anchor(root()).expect("anchored");
        let leaf = model.child(&LEAF).expect("leaf");

        assert_eq!(model.lifetime(), Lifetime::Active);
        assert_eq!(leaf.lifetime(), Lifetime::Active);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.roots(), vec![model.id()]);
        assert!(store.model::<Leaf>(leaf.id()).is_some());
        assert!(store.model::<Root>(leaf.id()).is_none());
    }

    #[test]
    fn anchoring_twice_is_reported() {
        let sink = Arc::new(CollectingSink::new());
        let store = Store::new(RuntimeConfig::default(), sink.clone());
        let value = root();
        let copy = value.clone();

        assert!(store.anchor(value).is_some());
        assert!(store.anchor(copy).is_none());
        assert!(matches!(
            sink.issues().as_slice(),
            [RuntimeIssue::IdentityReuse { .. }]
        ));
    }

    #[test]
    fn detach_root_destructs_subtree() {
        let store = Store::default();
        let model = store.anchor(root()).expect("anchored");
        let leaf = model.child(&LEAF).expect("leaf");

        assert!(store.detach_root(model.id()));
        assert!(!store.detach_root(model.id()));
        assert_eq!(store.node_count(), 0);
        assert_eq!(leaf.lifetime(), Lifetime::Destructed);
    }

    #[test]
    fn teardown_fires_every_cancellable_once() {
        let store = Store::default();
        let model = store.anchor(root()).expect("anchored");
        let fired = Arc::new(Mutex::new(0));
        for label in ["a", "b"] {
            let fired = Arc::clone(&fired);
            model.register_cancellable(label, [], move || *fired.lock() += 1);
        }

        store.teardown();
        store.teardown();
        assert_eq!(*fired.lock(), 2);
        assert!(store.tasks().is_empty());
    }

    #[test]
    fn dropping_the_store_cancels_leftovers() {
        let fired = Arc::new(Mutex::new(false));
        {
            let store = Store::default();
            let model = store.anchor(root()).expect("anchored");
            let fired = Arc::clone(&fired);
            model.register_cancellable("pending", [], move || *fired.lock() = true);
        }
        assert!(*fired.lock());
    }
}
