//! # Graph Arena
//!
//! Structural storage for every node anchored in one store.
//!
//! Nodes live in a `BTreeMap` arena keyed by `NodeId`; edges are explicit
//! `(EdgePath, child)` keys with per-parent reference counts on the child
//! side. Nothing in this module runs user code: operations that would
//! trigger callbacks return them (`Teardown`, `Deferred`) so the store can
//! invoke them once the graph borrow is released.

use crate::access::AccessInstrumentation;
use crate::cancellation::{Cancellable, CancellationRegistry};
use crate::config::RuntimeConfig;
use crate::dependency::{DependencyId, DependencyOverride};
use crate::event::EventHandler;
use crate::issue::RuntimeIssue;
use crate::primitives::MAX_PATH_COUNT;
use crate::state::{ActivateFn, ErasedState, Identity, Snapshot};
use crate::store::Shared;
use crate::{EdgeKey, EventScope, FieldPath, NodeId, SubscriptionId};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

/// Callback queued until the transaction boundary.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// Subscriber callback.
pub(crate) type Notify = Arc<dyn Fn() + Send + Sync>;

struct Subscription {
    paths: BTreeSet<FieldPath>,
    callback: Notify,
}

struct Instrument {
    hooks: Arc<dyn AccessInstrumentation>,
    propagates: bool,
}

// =============================================================================
// SLOT
// =============================================================================

/// One node in the arena.
pub(crate) struct Slot {
    identity: Arc<Identity>,
    stable: Box<dyn ErasedState>,
    activate: ActivateFn,
    activated: bool,
    /// Parent -> number of edges from that parent.
    parents: BTreeMap<NodeId, usize>,
    children: BTreeSet<EdgeKey>,
    dependencies: BTreeMap<DependencyId, NodeId>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    handlers: BTreeMap<SubscriptionId, EventHandler>,
    deactivation: Vec<Deferred>,
    instruments: Vec<Instrument>,
    overrides: Option<DependencyOverride>,
    resolved: BTreeMap<DependencyId, Arc<dyn Any + Send + Sync>>,
    modifications: u64,
}

impl Slot {
    fn new(identity: Arc<Identity>, stable: Box<dyn ErasedState>, activate: ActivateFn) -> Self {
        Self {
            identity,
            stable,
            activate,
            activated: false,
            parents: BTreeMap::new(),
            children: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            handlers: BTreeMap::new(),
            deactivation: Vec::new(),
            instruments: Vec::new(),
            overrides: None,
            resolved: BTreeMap::new(),
            modifications: 0,
        }
    }

    fn child_ids(&self) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        self.children
            .iter()
            .map(|key| key.child)
            .filter(|child| seen.insert(*child))
            .collect()
    }
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Resources released by one destructed node.
pub(crate) struct NodeTeardown {
    node: NodeId,
    cancellations: Vec<Cancellable>,
    callbacks: Vec<Deferred>,
}

/// Resources released by a teardown pass, children before parents.
#[derive(Default)]
pub(crate) struct Teardown {
    nodes: Vec<NodeTeardown>,
}

impl Teardown {
    /// Nodes destructed by this pass, children first.
    pub(crate) fn removed(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.node).collect()
    }

    pub(crate) fn extend(&mut self, other: Teardown) {
        self.nodes.extend(other.nodes);
    }

    /// Fire every cancellation and deactivation callback exactly once.
    pub(crate) fn fire(self) {
        for node in self.nodes {
            for cancellable in node.cancellations {
                cancellable.fire();
            }
            for callback in node.callbacks {
                callback();
            }
        }
    }
}

/// Outcome of committing a write.
pub(crate) struct Commit {
    pub(crate) inserted: Vec<NodeId>,
    pub(crate) teardown: Teardown,
}

// =============================================================================
// GRAPH
// =============================================================================

/// Arena of every node anchored in one store.
pub(crate) struct Graph {
    store: Weak<Shared>,
    slots: BTreeMap<NodeId, Slot>,
    roots: BTreeSet<NodeId>,
    next_handle: u64,
    pub(crate) transaction_depth: usize,
    deferred: VecDeque<Deferred>,
    pending: BTreeSet<(NodeId, SubscriptionId)>,
    subtree_counts: BTreeMap<NodeId, u64>,
    resolving: BTreeSet<(NodeId, DependencyId)>,
    pub(crate) cancellations: CancellationRegistry,
    retain_last_seen: bool,
    max_depth: usize,
}

impl Graph {
    pub(crate) fn new(store: Weak<Shared>, config: &RuntimeConfig) -> Self {
        Self {
            store,
            slots: BTreeMap::new(),
            roots: BTreeSet::new(),
            next_handle: 0,
            transaction_depth: 0,
            deferred: VecDeque::new(),
            pending: BTreeSet::new(),
            subtree_counts: BTreeMap::new(),
            resolving: BTreeSet::new(),
            cancellations: CancellationRegistry::new(),
            retain_last_seen: config.retain_last_seen,
            max_depth: config.max_traversal_depth,
        }
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn roots(&self) -> Vec<NodeId> {
        self.roots.iter().copied().collect()
    }

    pub(crate) fn is_root(&self, id: NodeId) -> bool {
        self.roots.contains(&id)
    }

    pub(crate) fn identity(&self, id: NodeId) -> Option<Arc<Identity>> {
        self.slots.get(&id).map(|slot| Arc::clone(&slot.identity))
    }

    pub(crate) fn value(&self, id: NodeId) -> Option<&dyn ErasedState> {
        self.slots.get(&id).map(|slot| slot.stable.as_ref())
    }

    pub(crate) fn snapshot(&self, id: NodeId) -> Option<Snapshot> {
        self.slots
            .get(&id)
            .map(|slot| Snapshot::new(id, slot.stable.clone_state()))
    }

    fn next_handle(&mut self) -> SubscriptionId {
        self.next_handle = self.next_handle.saturating_add(1);
        SubscriptionId(self.next_handle)
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Check that a freestanding identity may be attached here.
    pub(crate) fn validate_identity(&self, identity: &Identity) -> Result<(), RuntimeIssue> {
        let lifetime = identity.lifetime();
        if lifetime == crate::Lifetime::Initial {
            Ok(())
        } else if lifetime.is_stale() {
            Err(RuntimeIssue::StaleWrite {
                node: identity.id(),
                lifetime,
            })
        } else {
            Err(RuntimeIssue::IdentityReuse {
                node: identity.id(),
            })
        }
    }

    /// Check every child slot of a value before it is committed.
    ///
    /// Pending children must be `Initial` and distinct; live children must
    /// already belong to this store.
    pub(crate) fn validate_children(&self, value: &mut dyn ErasedState) -> Result<(), RuntimeIssue> {
        let mut seen = BTreeSet::new();
        self.validate_into(value, &mut seen)
    }

    fn validate_into(
        &self,
        value: &mut dyn ErasedState,
        seen: &mut BTreeSet<NodeId>,
    ) -> Result<(), RuntimeIssue> {
        for (_, slot) in value.erased_children() {
            let identity = slot.identity();
            match slot.pending_mut() {
                Some(pending) => {
                    self.validate_identity(&identity)?;
                    if !seen.insert(identity.id()) {
                        return Err(RuntimeIssue::IdentityReuse {
                            node: identity.id(),
                        });
                    }
                    self.validate_into(pending, seen)?;
                }
                None => {
                    let local = identity.belongs_to(&self.store) && self.contains(identity.id());
                    if !local {
                        let lifetime = identity.lifetime();
                        return Err(if lifetime.is_stale() {
                            RuntimeIssue::StaleWrite {
                                node: identity.id(),
                                lifetime,
                            }
                        } else {
                            RuntimeIssue::IdentityReuse {
                                node: identity.id(),
                            }
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // INSERTION & EDGES
    // =========================================================================

    /// Insert a validated value as a new root. Returns inserted nodes in
    /// parent-before-child order.
    pub(crate) fn insert_root(
        &mut self,
        identity: Arc<Identity>,
        value: Box<dyn ErasedState>,
        activate: ActivateFn,
    ) -> Vec<NodeId> {
        let id = identity.id();
        let mut inserted = Vec::new();
        let mut orphans = Vec::new();
        self.roots.insert(id);
        self.insert_subtree(identity, value, activate, &mut inserted, &mut orphans);
        inserted
    }

    /// Insert a validated value as a dependency child of `host`.
    pub(crate) fn insert_dependency(
        &mut self,
        host: NodeId,
        dependency: DependencyId,
        identity: Arc<Identity>,
        value: Box<dyn ErasedState>,
        activate: ActivateFn,
    ) -> Vec<NodeId> {
        let id = identity.id();
        let mut inserted = Vec::new();
        let mut orphans = Vec::new();
        self.insert_subtree(identity, value, activate, &mut inserted, &mut orphans);
        self.add_dependency_edge(host, dependency, id);
        inserted
    }

    fn insert_subtree(
        &mut self,
        identity: Arc<Identity>,
        value: Box<dyn ErasedState>,
        activate: ActivateFn,
        inserted: &mut Vec<NodeId>,
        orphans: &mut Vec<NodeId>,
    ) {
        let id = identity.id();
        identity.anchor(self.store.clone());
        self.slots.insert(id, Slot::new(identity, value, activate));
        inserted.push(id);
        tracing::debug!(event = "attach", node = %id, "node anchored");
        self.reconcile_edges(id, inserted, orphans);
    }

    /// Bring a node's edge set in line with the child slots of its stable
    /// value, attaching pending children along the way.
    fn reconcile_edges(&mut self, id: NodeId, inserted: &mut Vec<NodeId>, orphans: &mut Vec<NodeId>) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };

        let mut desired = BTreeSet::new();
        let mut pending = Vec::new();
        for (path, child) in slot.stable.erased_children() {
            let identity = child.identity();
            if let Some((value, activate)) = child.take_pending() {
                pending.push((Arc::clone(&identity), value, activate));
            }
            desired.insert(EdgeKey {
                path,
                child: identity.id(),
            });
        }
        let current = slot.children.clone();

        for (identity, value, activate) in pending {
            self.insert_subtree(identity, value, activate, inserted, orphans);
        }
        for key in desired.difference(&current) {
            self.add_edge(id, *key);
        }
        for key in current.difference(&desired) {
            if let Some(orphan) = self.remove_edge(id, *key) {
                orphans.push(orphan);
            }
        }
    }

    fn add_edge(&mut self, parent: NodeId, key: EdgeKey) {
        let added = self
            .slots
            .get_mut(&parent)
            .is_some_and(|slot| slot.children.insert(key));
        if added && let Some(child) = self.slots.get_mut(&key.child) {
            *child.parents.entry(parent).or_insert(0) += 1;
        }
        self.subtree_counts.clear();
    }

    /// Remove one edge. Returns the child if it lost its last parent.
    fn remove_edge(&mut self, parent: NodeId, key: EdgeKey) -> Option<NodeId> {
        let removed = self
            .slots
            .get_mut(&parent)
            .is_some_and(|slot| slot.children.remove(&key));
        self.subtree_counts.clear();
        if !removed {
            return None;
        }
        self.release_parent_edge(parent, key.child)
    }

    fn add_dependency_edge(&mut self, owner: NodeId, dependency: DependencyId, target: NodeId) {
        let added = self
            .slots
            .get_mut(&owner)
            .is_some_and(|slot| slot.dependencies.insert(dependency, target).is_none());
        if added && let Some(child) = self.slots.get_mut(&target) {
            *child.parents.entry(owner).or_insert(0) += 1;
        }
        self.subtree_counts.clear();
    }

    /// Share an existing dependency node with `owner`.
    pub(crate) fn share_dependency(&mut self, owner: NodeId, dependency: DependencyId, target: NodeId) {
        if owner != target {
            self.add_dependency_edge(owner, dependency, target);
        }
    }

    fn release_parent_edge(&mut self, parent: NodeId, child: NodeId) -> Option<NodeId> {
        let slot = self.slots.get_mut(&child)?;
        if let Some(count) = slot.parents.get_mut(&parent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slot.parents.remove(&parent);
            }
        }
        (slot.parents.is_empty() && !self.roots.contains(&child)).then_some(child)
    }

    /// Replace a node's stable value with a validated write copy.
    pub(crate) fn commit(&mut self, id: NodeId, value: Box<dyn ErasedState>, path: FieldPath) -> Commit {
        let mut inserted = Vec::new();
        let mut orphans = Vec::new();
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.stable = value;
            slot.modifications = slot.modifications.saturating_add(1);
        }
        self.reconcile_edges(id, &mut inserted, &mut orphans);
        self.invalidate_counts(id);
        self.mark_written(id, path);
        let teardown = self.teardown(orphans);
        Commit { inserted, teardown }
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Destruct every orphan and whatever it alone kept alive.
    pub(crate) fn teardown(&mut self, orphans: Vec<NodeId>) -> Teardown {
        let mut teardown = Teardown::default();
        for orphan in orphans {
            self.collect_removal(orphan, &mut teardown);
        }
        teardown
    }

    /// Detach a root; its subtree is destructed unless shared elsewhere.
    pub(crate) fn remove_root(&mut self, id: NodeId) -> Teardown {
        if !self.roots.remove(&id) {
            return Teardown::default();
        }
        let orphaned = self
            .slots
            .get(&id)
            .is_some_and(|slot| slot.parents.is_empty());
        self.teardown(if orphaned { vec![id] } else { Vec::new() })
    }

    fn collect_removal(&mut self, id: NodeId, out: &mut Teardown) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        let Slot {
            identity,
            stable,
            children,
            dependencies,
            deactivation,
            ..
        } = slot;

        // Destructed before anything else runs: callbacks see a settled node.
        identity.destruct(self.retain_last_seen.then_some(stable));
        self.pending.retain(|(node, _)| *node != id);
        self.resolving.retain(|(node, _)| *node != id);
        self.subtree_counts.clear();

        for key in children {
            if let Some(orphan) = self.release_all_edges(id, key.child) {
                self.collect_removal(orphan, out);
            }
        }
        for target in dependencies.into_values() {
            if let Some(orphan) = self.release_all_edges(id, target) {
                self.collect_removal(orphan, out);
            }
        }

        out.nodes.push(NodeTeardown {
            node: id,
            cancellations: self.cancellations.cancel_owner(id),
            callbacks: deactivation,
        });
        tracing::debug!(event = "teardown", node = %id, "node destructed");
    }

    fn release_all_edges(&mut self, parent: NodeId, child: NodeId) -> Option<NodeId> {
        let slot = self.slots.get_mut(&child)?;
        slot.parents.remove(&parent);
        (slot.parents.is_empty() && !self.roots.contains(&child)).then_some(child)
    }

    // =========================================================================
    // TRAVERSAL
    // =========================================================================

    pub(crate) fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.slots
            .get(&id)
            .map(|slot| slot.parents.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.slots
            .get(&id)
            .map(Slot::child_ids)
            .unwrap_or_default()
    }

    pub(crate) fn dependency_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.slots
            .get(&id)
            .map(|slot| slot.dependencies.values().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn dependency(&self, id: NodeId, dependency: DependencyId) -> Option<NodeId> {
        self.slots
            .get(&id)
            .and_then(|slot| slot.dependencies.get(&dependency).copied())
    }

    /// Every ancestor, nearest first.
    pub(crate) fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        self.breadth_first(id, |node| self.parents(node))
    }

    /// Every descendant, nearest first. Dependency nodes count as
    /// descendants when `include_dependencies` is set.
    pub(crate) fn descendants(&self, id: NodeId, include_dependencies: bool) -> Vec<NodeId> {
        self.breadth_first(id, |node| {
            let mut next = self.children(node);
            if include_dependencies {
                next.extend(self.dependency_nodes(node));
            }
            next
        })
    }

    fn breadth_first(&self, start: NodeId, next: impl Fn(NodeId) -> Vec<NodeId>) -> Vec<NodeId> {
        let mut visited = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();
        while let Some(node) = queue.pop_front() {
            for neighbor in next(node) {
                if visited.insert(neighbor) {
                    order.push(neighbor);
                    queue.push_back(neighbor);
                }
            }
        }
        order
    }

    /// Every root-to-node path, bounded by the configured depth.
    pub(crate) fn paths(&self, id: NodeId) -> Vec<Vec<NodeId>> {
        let mut paths = Vec::new();
        if self.contains(id) {
            let mut suffix = vec![id];
            self.walk_up(&mut suffix, &mut paths);
        }
        paths
    }

    fn walk_up(&self, suffix: &mut Vec<NodeId>, paths: &mut Vec<Vec<NodeId>>) {
        if paths.len() >= MAX_PATH_COUNT || suffix.len() > self.max_depth {
            return;
        }
        let Some(&node) = suffix.last() else {
            return;
        };
        let parents = self.parents(node);
        if parents.is_empty() {
            paths.push(suffix.iter().rev().copied().collect());
            return;
        }
        for parent in parents {
            if suffix.contains(&parent) {
                continue;
            }
            suffix.push(parent);
            self.walk_up(suffix, paths);
            suffix.pop();
        }
    }

    /// Nodes an event reaches, each at most once, self first, then
    /// outward, then inward.
    pub(crate) fn event_targets(&self, origin: NodeId, scope: EventScope) -> Vec<NodeId> {
        let mut visited = BTreeSet::new();
        let mut targets = Vec::new();
        let mut visit = |nodes: Vec<NodeId>| {
            for node in nodes {
                if visited.insert(node) {
                    targets.push(node);
                }
            }
        };

        if scope.contains(EventScope::SELF) {
            visit(vec![origin]);
        }
        if scope.contains(EventScope::ANCESTORS) {
            visit(self.ancestors(origin));
        } else if scope.contains(EventScope::PARENTS) {
            visit(self.parents(origin));
        }
        if scope.contains(EventScope::DESCENDANTS) {
            visit(self.descendants(origin, false));
        } else if scope.contains(EventScope::CHILDREN) {
            visit(self.children(origin));
        }
        if scope.contains(EventScope::DEPENDENCIES) {
            visit(self.dependency_nodes(origin));
        }
        targets
    }

    // =========================================================================
    // ACTIVATION
    // =========================================================================

    /// Mark a node active if it is not yet and every parent is active.
    /// Returns its activation entry point when it should run.
    pub(crate) fn begin_activation(&mut self, id: NodeId) -> Option<(Arc<Identity>, ActivateFn)> {
        let ready = {
            let slot = self.slots.get(&id)?;
            !slot.activated
                && slot
                    .parents
                    .keys()
                    .all(|parent| self.slots.get(parent).is_some_and(|p| p.activated))
        };
        if !ready {
            return None;
        }
        let slot = self.slots.get_mut(&id)?;
        slot.activated = true;
        slot.identity.set_lifetime(crate::Lifetime::Active);
        Some((Arc::clone(&slot.identity), slot.activate))
    }

    /// Children and dependency nodes, in activation order.
    pub(crate) fn activation_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut next = self.children(id);
        next.extend(self.dependency_nodes(id));
        next
    }

    pub(crate) fn on_deactivate(&mut self, id: NodeId, callback: Deferred) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.deactivation.push(callback);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // INSTRUMENTATION
    // =========================================================================

    pub(crate) fn install(
        &mut self,
        id: NodeId,
        hooks: Arc<dyn AccessInstrumentation>,
        propagates: bool,
    ) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.instruments.push(Instrument { hooks, propagates });
                true
            }
            None => false,
        }
    }

    /// Instrumentations covering `id`: its own plus propagating ones
    /// installed on ancestors.
    pub(crate) fn instruments_for(&self, id: NodeId) -> Vec<Arc<dyn AccessInstrumentation>> {
        let mut found: Vec<Arc<dyn AccessInstrumentation>> = Vec::new();
        let mut push = |hooks: &Arc<dyn AccessInstrumentation>| {
            if !found.iter().any(|known| Arc::ptr_eq(known, hooks)) {
                found.push(Arc::clone(hooks));
            }
        };

        if let Some(slot) = self.slots.get(&id) {
            slot.instruments.iter().for_each(|i| push(&i.hooks));
        }
        for ancestor in self.ancestors(id) {
            if let Some(slot) = self.slots.get(&ancestor) {
                slot.instruments
                    .iter()
                    .filter(|i| i.propagates)
                    .for_each(|i| push(&i.hooks));
            }
        }
        found
    }

    /// Whether a child-propagating instrumentation covers `id`.
    pub(crate) fn is_propagating(&self, id: NodeId) -> bool {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter_map(|node| self.slots.get(&node))
            .any(|slot| slot.instruments.iter().any(|i| i.propagates))
    }

    // =========================================================================
    // SUBSCRIPTIONS & EVENTS
    // =========================================================================

    pub(crate) fn subscribe(
        &mut self,
        id: NodeId,
        paths: BTreeSet<FieldPath>,
        callback: Notify,
    ) -> Option<SubscriptionId> {
        if !self.contains(id) {
            return None;
        }
        let handle = self.next_handle();
        let slot = self.slots.get_mut(&id)?;
        slot.subscriptions
            .insert(handle, Subscription { paths, callback });
        Some(handle)
    }

    pub(crate) fn unsubscribe(&mut self, id: NodeId, handle: SubscriptionId) -> bool {
        self.pending.remove(&(id, handle));
        self.slots.get_mut(&id).is_some_and(|slot| {
            slot.subscriptions.remove(&handle).is_some() || slot.handlers.remove(&handle).is_some()
        })
    }

    pub(crate) fn add_handler(&mut self, id: NodeId, handler: EventHandler) -> Option<SubscriptionId> {
        if !self.contains(id) {
            return None;
        }
        let handle = self.next_handle();
        let slot = self.slots.get_mut(&id)?;
        slot.handlers.insert(handle, handler);
        Some(handle)
    }

    pub(crate) fn handlers_for(&self, targets: &[NodeId]) -> Vec<EventHandler> {
        targets
            .iter()
            .filter_map(|node| self.slots.get(node))
            .flat_map(|slot| slot.handlers.values().cloned())
            .collect()
    }

    fn mark_written(&mut self, id: NodeId, path: FieldPath) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        let hits: Vec<SubscriptionId> = slot
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.paths.contains(&path))
            .map(|(handle, _)| *handle)
            .collect();
        self.pending.extend(hits.into_iter().map(|handle| (id, handle)));
    }

    // =========================================================================
    // DEFERRED QUEUE
    // =========================================================================

    pub(crate) fn defer(&mut self, callback: Deferred) {
        self.deferred.push_back(callback);
    }

    /// Next callback to run at the transaction boundary. Queued callbacks
    /// run first; each pending subscription then fires once.
    pub(crate) fn next_deferred(&mut self) -> Option<Deferred> {
        if let Some(callback) = self.deferred.pop_front() {
            return Some(callback);
        }
        while let Some((node, handle)) = self.pending.pop_first() {
            let callback = self
                .slots
                .get(&node)
                .and_then(|slot| slot.subscriptions.get(&handle))
                .map(|sub| Arc::clone(&sub.callback));
            if let Some(callback) = callback {
                return Some(Box::new(move || callback()));
            }
        }
        None
    }

    // =========================================================================
    // DEPENDENCIES
    // =========================================================================

    pub(crate) fn set_override(&mut self, id: NodeId, apply: DependencyOverride) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        slot.overrides = Some(apply);
        for node in std::iter::once(id).chain(self.descendants(id, true)) {
            if let Some(slot) = self.slots.get_mut(&node) {
                slot.resolved.clear();
            }
        }
        true
    }

    /// Override scopes from `id` outward, nearest first.
    pub(crate) fn override_scopes(&self, id: NodeId) -> Vec<(NodeId, DependencyOverride)> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter_map(|node| {
                self.slots
                    .get(&node)
                    .and_then(|slot| slot.overrides.clone())
                    .map(|apply| (node, apply))
            })
            .collect()
    }

    /// The nearest root above (or at) `id`.
    pub(crate) fn root_of(&self, id: NodeId) -> NodeId {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|node| self.roots.contains(node))
            .unwrap_or(id)
    }

    pub(crate) fn cached(&self, id: NodeId, dependency: DependencyId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.slots
            .get(&id)
            .and_then(|slot| slot.resolved.get(&dependency).cloned())
    }

    pub(crate) fn cache(&mut self, id: NodeId, dependency: DependencyId, value: Arc<dyn Any + Send + Sync>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.resolved.insert(dependency, value);
        }
    }

    /// Enter resolution of `dependency` on `id`; `false` if already inside.
    pub(crate) fn begin_resolution(&mut self, id: NodeId, dependency: DependencyId) -> bool {
        self.resolving.insert((id, dependency))
    }

    pub(crate) fn end_resolution(&mut self, id: NodeId, dependency: DependencyId) {
        self.resolving.remove(&(id, dependency));
    }

    // =========================================================================
    // MODIFICATION COUNTERS
    // =========================================================================

    pub(crate) fn modification_count(&self, id: NodeId) -> u64 {
        self.slots.get(&id).map_or(0, |slot| slot.modifications)
    }

    /// Writes to `id` and everything below it. Cached until the next write
    /// or structural change underneath.
    pub(crate) fn subtree_modification_count(&mut self, id: NodeId) -> u64 {
        if let Some(count) = self.subtree_counts.get(&id) {
            return *count;
        }
        let count = std::iter::once(id)
            .chain(self.descendants(id, true))
            .map(|node| self.modification_count(node))
            .fold(0u64, u64::saturating_add);
        self.subtree_counts.insert(id, count);
        count
    }

    fn invalidate_counts(&mut self, id: NodeId) {
        self.subtree_counts.remove(&id);
        for ancestor in self.ancestors(id) {
            self.subtree_counts.remove(&ancestor);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Child, ChildSlot, Detached, State};
    use crate::{EdgePath, Lifetime};

    #[derive(Clone, Default)]
    struct Leaf;

    impl State for Leaf {}

    #[derive(Clone)]
    struct Branch {
        items: Vec<Child<Leaf>>,
    }

    const ITEMS: FieldPath = FieldPath::new(0, "items");

    impl State for Branch {
        fn children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
            self.items
                .iter_mut()
                .enumerate()
                .map(|(i, child)| (EdgePath::element(ITEMS, i as u64), child as &mut dyn ChildSlot))
                .collect()
        }
    }

    fn noop(_: &Arc<Identity>) {}

    fn graph() -> Graph {
        Graph::new(Weak::new(), &RuntimeConfig::default())
    }

    fn anchor(graph: &mut Graph, value: Branch) -> (NodeId, Vec<NodeId>) {
        let (identity, value) = Detached::new(value).into_parts();
        let id = identity.id();
        let inserted = graph.insert_root(identity, Box::new(value), noop);
        (id, inserted)
    }

    #[test]
    fn insert_root_attaches_pending_children() {
        let mut graph = graph();
        let leaf = Detached::new(Leaf);
        let leaf_id = leaf.id();
        let (root, inserted) = anchor(
            &mut graph,
            Branch {
                items: vec![Child::new(leaf)],
            },
        );

        assert_eq!(inserted, vec![root, leaf_id]);
        assert_eq!(graph.children(root), vec![leaf_id]);
        assert_eq!(graph.parents(leaf_id), vec![root]);
        assert_eq!(graph.paths(leaf_id), vec![vec![root, leaf_id]]);
    }

    #[test]
    fn activation_is_parent_first_and_idempotent() {
        let mut graph = graph();
        let leaf = Detached::new(Leaf);
        let leaf_id = leaf.id();
        let (root, _) = anchor(
            &mut graph,
            Branch {
                items: vec![Child::new(leaf)],
            },
        );

        assert!(graph.begin_activation(leaf_id).is_none());
        assert!(graph.begin_activation(root).is_some());
        assert!(graph.begin_activation(root).is_none());
        let (identity, _) = graph.begin_activation(leaf_id).expect("leaf");
        assert_eq!(identity.lifetime(), Lifetime::Active);
    }

    #[test]
    fn removing_last_edge_destructs_children_first() {
        let mut graph = graph();
        let leaf = Detached::new(Leaf);
        let leaf_id = leaf.id();
        let (root, _) = anchor(
            &mut graph,
            Branch {
                items: vec![Child::new(leaf)],
            },
        );

        let teardown = graph.remove_root(root);
        assert_eq!(teardown.removed(), vec![leaf_id, root]);
        assert_eq!(graph.len(), 0);
    }

    #[test]
    fn validation_rejects_duplicate_pending_children() {
        let graph = graph();
        let leaf = Detached::new(Leaf);
        let mut value = Branch {
            items: vec![Child::new(leaf.clone()), Child::new(leaf)],
        };

        let result = graph.validate_children(&mut value);
        assert!(matches!(result, Err(RuntimeIssue::IdentityReuse { .. })));
    }

    #[test]
    fn event_targets_are_coalesced() {
        let mut graph = graph();
        let (root, _) = anchor(
            &mut graph,
            Branch {
                items: vec![Child::new(Detached::new(Leaf))],
            },
        );
        let leaf = graph.children(root)[0];

        let targets = graph.event_targets(leaf, EventScope::SELF | EventScope::PARENTS | EventScope::ANCESTORS);
        assert_eq!(targets, vec![leaf, root]);
        assert_eq!(graph.event_targets(root, EventScope::CHILDREN), vec![leaf]);
        assert!(graph.event_targets(root, EventScope::empty()).is_empty());
    }
}
