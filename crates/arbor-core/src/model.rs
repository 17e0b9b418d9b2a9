//! # Model Handles
//!
//! `Model<M>` is the typed handle through which a live node is read,
//! written, observed and torn down. Handles are cheap to clone and hold
//! only the node's identity; the arena itself is reached through the store
//! the identity is anchored in.
//!
//! ## Write Protocol
//!
//! A field write never mutates the stable value in place:
//! 1. Collect write hooks from every covering instrumentation
//! 2. Copy the stable value and run the transform on the copy
//! 3. Validate the copy's child slots
//! 4. Commit: swap the copy in, reconcile edges, tear down orphans
//! 5. Activate attached subtrees per the reactivation policy
//! 6. Queue write callbacks and subscriber notifications
//!
//! All of it runs inside one transaction.

use crate::access::{Access, AccessCallback, AccessInstrumentation, AccessKind};
use crate::dependency::{DependencyId, DependencyKey, Dependencies, apply_scopes};
use crate::event::{EventEnvelope, typed_handler};
use crate::issue::{IssueSink, RuntimeIssue, TracingSink};
use crate::state::{Child, Detached, Field, Identity, State, TypeMarker, activate_erased};
use crate::store::{Shared, Store};
use crate::{CancelId, CancelKey, EventScope, FieldPath, Lifetime, NodeId, SubscriptionId};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle onto a node of type `M`.
pub struct Model<M: State> {
    identity: Arc<Identity>,
    _marker: TypeMarker<M>,
}

impl<M: State> Model<M> {
    pub(crate) fn from_identity(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            _marker: PhantomData,
        }
    }

    /// The node's identifier.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    /// The node's current lifetime.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.identity.lifetime()
    }

    /// The store this node was anchored in, while that store exists.
    #[must_use]
    pub fn store(&self) -> Option<Store> {
        self.identity.store().map(Store::from_shared)
    }

    fn report(&self, issue: RuntimeIssue) {
        match self.identity.store() {
            Some(shared) => shared.report(issue),
            None => TracingSink.report(issue),
        }
    }

    fn report_stale(&self) {
        self.report(RuntimeIssue::StaleWrite {
            node: self.id(),
            lifetime: self.lifetime(),
        });
    }

    /// The owning store if the node is live; reports otherwise.
    fn live(&self) -> Option<Arc<Shared>> {
        match self.identity.store() {
            Some(shared) if self.lifetime().is_live() => Some(shared),
            _ => {
                self.report(RuntimeIssue::UnanchoredAccess { node: self.id() });
                None
            }
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Read one field.
    ///
    /// A destructed node still answers from its last-seen snapshot when
    /// the store keeps one; otherwise the read is reported and yields
    /// `None`.
    pub fn read<V: Clone>(&self, field: &Field<M, V>) -> Option<V> {
        let shared = match self.identity.store() {
            Some(shared) if self.lifetime().is_live() => shared,
            _ => return self.read_last_seen(field),
        };
        let id = self.id();
        let access = Access {
            node: id,
            path: field.path(),
            kind: AccessKind::Read,
        };

        let instruments = shared.with_graph(|graph| graph.instruments_for(id));
        let callbacks: Vec<AccessCallback> = instruments
            .iter()
            .filter_map(|hooks| hooks.will_read(&access))
            .collect();

        let (value, snapshot) = shared.with_graph(|graph| {
            let value = graph
                .value(id)?
                .as_any()
                .downcast_ref::<M>()
                .map(|typed| field.get(typed).clone())?;
            let snapshot = if callbacks.is_empty() {
                None
            } else {
                graph.snapshot(id)
            };
            Some((value, snapshot))
        })?;

        if let Some(snapshot) = snapshot {
            callbacks.into_iter().for_each(|callback| callback(&snapshot));
        }
        Some(value)
    }

    fn read_last_seen<V: Clone>(&self, field: &Field<M, V>) -> Option<V> {
        let seen = self
            .identity
            .last_seen(|value| {
                value
                    .as_any()
                    .downcast_ref::<M>()
                    .map(|typed| field.get(typed).clone())
            })
            .flatten();
        if seen.is_none() {
            self.report(RuntimeIssue::UnanchoredAccess { node: self.id() });
        }
        seen
    }

    /// Read one field, falling back to its default.
    pub fn get<V: Clone + Default>(&self, field: &Field<M, V>) -> V {
        self.read(field).unwrap_or_default()
    }

    /// Copy of the whole value, bypassing instrumentation.
    #[must_use]
    pub fn value(&self) -> Option<M> {
        match self.identity.store() {
            Some(shared) if self.lifetime().is_live() => shared.with_graph(|graph| {
                graph
                    .value(self.id())
                    .and_then(|value| value.as_any().downcast_ref::<M>())
                    .cloned()
            }),
            _ => self
                .identity
                .last_seen(|value| value.as_any().downcast_ref::<M>().cloned())
                .flatten(),
        }
    }

    /// Handle onto the child held in `field`.
    pub fn child<C: State>(&self, field: &Field<M, Child<C>>) -> Option<Model<C>> {
        self.read(field).map(|child| child.model())
    }

    /// Handles onto every child held in a collection field.
    pub fn children_in<C: State>(&self, field: &Field<M, Vec<Child<C>>>) -> Vec<Model<C>> {
        self.read(field)
            .map(|children| children.iter().map(Child::model).collect())
            .unwrap_or_default()
    }

    /// Immutable detached snapshot of the node.
    ///
    /// The copy keeps the node's id but is frozen: `Detached::update` on it
    /// is rejected and it cannot be anchored.
    #[must_use]
    pub fn frozen_copy(&self) -> Option<Detached<M>> {
        self.value().map(|value| Detached::frozen(self.id(), value))
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Write one field through `transform`.
    ///
    /// Returns `false`, reporting an issue, when the node is not live or
    /// the new value would attach an already-attached, frozen or
    /// destructed child. A rejected write leaves the node untouched.
    pub fn write<V>(&self, field: &Field<M, V>, transform: impl FnOnce(&mut V)) -> bool {
        let id = self.id();
        let lifetime = self.lifetime();
        let shared = match self.identity.store() {
            Some(shared) if lifetime.is_live() => shared,
            _ => {
                self.report(if lifetime.is_stale() {
                    RuntimeIssue::StaleWrite { node: id, lifetime }
                } else {
                    RuntimeIssue::UnanchoredAccess { node: id }
                });
                return false;
            }
        };
        let access = Access {
            node: id,
            path: field.path(),
            kind: AccessKind::Write,
        };

        shared.transaction(|| {
            let stored = || shared.with_graph(|graph| graph.value(id).map(|v| v.clone_state()));
            let Some(mut copy) = stored() else {
                self.report_stale();
                return false;
            };
            let before = shared.with_graph(|graph| graph.modification_count(id));
            let Some(typed) = copy.as_any_mut().downcast_mut::<M>() else {
                return false;
            };
            transform(field.get_mut(typed));

            if !self.lifetime().is_live() {
                self.report_stale();
                return false;
            }
            // A write nested in `transform` already committed: keep it and
            // carry over only this field.
            if shared.with_graph(|graph| graph.modification_count(id)) != before {
                let Some(mut fresh) = stored() else {
                    self.report_stale();
                    return false;
                };
                let (Some(latest), Some(written)) = (
                    fresh.as_any_mut().downcast_mut::<M>(),
                    copy.as_any_mut().downcast_mut::<M>(),
                ) else {
                    return false;
                };
                std::mem::swap(field.get_mut(latest), field.get_mut(written));
                copy = fresh;
            }

            if let Err(issue) = shared.with_graph(|graph| graph.validate_children(copy.as_mut())) {
                shared.report(issue);
                return false;
            }

            let instruments = shared.with_graph(|graph| graph.instruments_for(id));
            let callbacks: Vec<AccessCallback> = instruments
                .iter()
                .filter_map(|hooks| hooks.will_write(&access))
                .collect();

            let commit = shared.with_graph(|graph| graph.commit(id, copy, field.path()));
            tracing::trace!(
                event = "write",
                node = %id,
                field = %field.path(),
                attached = commit.inserted.len(),
                "field written"
            );
            commit.teardown.fire();
            shared.activate_attached(id, commit.inserted);

            if !callbacks.is_empty()
                && let Some(snapshot) = shared.with_graph(|graph| graph.snapshot(id))
            {
                shared.defer(Box::new(move || {
                    callbacks.into_iter().for_each(|callback| callback(&snapshot));
                }));
            }
            true
        })
    }

    /// Replace one field.
    pub fn set<V>(&self, field: &Field<M, V>, value: V) -> bool {
        self.write(field, |slot| *slot = value)
    }

    /// Run `body` as one transaction: subscribers fire once at the end.
    pub fn transaction<R>(&self, body: impl FnOnce() -> R) -> R {
        match self.identity.store() {
            Some(shared) => shared.transaction(body),
            None => body(),
        }
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Call `callback` once per transaction in which any of `paths` is
    /// written.
    pub fn subscribe(
        &self,
        paths: impl IntoIterator<Item = FieldPath>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Option<SubscriptionId> {
        let shared = self.live()?;
        let paths: BTreeSet<FieldPath> = paths.into_iter().collect();
        shared.with_graph(|graph| graph.subscribe(self.id(), paths, Arc::new(callback)))
    }

    /// Remove a subscription or event handler.
    pub fn unsubscribe(&self, handle: SubscriptionId) -> bool {
        self.identity
            .store()
            .is_some_and(|shared| shared.with_graph(|graph| graph.unsubscribe(self.id(), handle)))
    }

    /// Install an instrumentation on this node.
    pub fn instrument(&self, hooks: Arc<dyn AccessInstrumentation>) -> bool {
        let Some(shared) = self.live() else {
            return false;
        };
        let propagates = hooks.propagates_to_children();
        shared.with_graph(|graph| graph.install(self.id(), hooks, propagates))
    }

    /// Handle events of type `E` reaching this node.
    pub fn on_event<E: Any + Send + Sync>(
        &self,
        handler: impl Fn(&E, NodeId) + Send + Sync + 'static,
    ) -> Option<SubscriptionId> {
        let shared = self.live()?;
        let handler = typed_handler(handler);
        shared.with_graph(|graph| graph.add_handler(self.id(), handler))
    }

    /// Send an event in the directions named by `scope`. Returns the number
    /// of nodes it reached.
    pub fn send_event<E: Any + Send + Sync>(&self, payload: E, scope: EventScope) -> usize {
        let Some(shared) = self.live() else {
            return 0;
        };
        let id = self.id();
        let envelope = EventEnvelope::new(payload, id, scope);
        tracing::trace!(event = "send", node = %id, payload = envelope.type_name(), "event sent");

        shared.transaction(|| {
            let instruments = shared.with_graph(|graph| graph.instruments_for(id));
            instruments.iter().for_each(|hooks| hooks.did_send(&envelope));

            let targets = shared.with_graph(|graph| graph.event_targets(id, scope));
            let handlers = shared.with_graph(|graph| graph.handlers_for(&targets));
            handlers.iter().for_each(|handler| handler(&envelope));
            targets.len()
        })
    }

    /// Run `callback` once when this node is torn down.
    pub fn on_deactivate(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        let Some(shared) = self.live() else {
            return false;
        };
        shared.with_graph(|graph| graph.on_deactivate(self.id(), Box::new(callback)))
    }

    // =========================================================================
    // DEPENDENCIES
    // =========================================================================

    /// Install an override scope on this node, covering its subtree.
    /// Replaces any scope installed before.
    pub fn with_dependencies(&self, apply: impl Fn(&mut Dependencies) + Send + Sync + 'static) -> bool {
        let Some(shared) = self.live() else {
            return false;
        };
        shared.with_graph(|graph| graph.set_override(self.id(), Arc::new(apply)))
    }

    /// Resolve dependency `K` for this node. Cached per node until an
    /// override scope above it changes.
    pub fn dependency<K: DependencyKey>(&self) -> Option<K::Value> {
        let shared = self.live()?;
        let id = self.id();
        let key = DependencyId::of::<K>();

        let cached = shared.with_graph(|graph| graph.cached(id, key));
        if let Some(value) = cached.and_then(|value| value.downcast_ref::<K::Value>().cloned()) {
            return Some(value);
        }

        let (value, _) = self.resolve::<K>(&shared, key)?;
        shared.with_graph(|graph| graph.cache(id, key, Arc::new(value.clone())));
        Some(value)
    }

    /// Resolve a node-valued dependency, attaching it on first use.
    ///
    /// The node is hosted by the scope that set `K`, or by the root when
    /// only the default applies, and shared by every requester below that
    /// host.
    pub fn dependency_model<K, D>(&self) -> Option<Model<D>>
    where
        K: DependencyKey<Value = Detached<D>>,
        D: State,
    {
        let shared = self.live()?;
        let id = self.id();
        let key = DependencyId::of::<K>();

        if let Some(node) = shared.with_graph(|graph| graph.dependency(id, key)) {
            return shared.with_graph(|graph| graph.identity(node)).map(Model::from_identity);
        }

        let (template, scope) = self.resolve::<K>(&shared, key)?;
        let host = scope.unwrap_or_else(|| shared.with_graph(|graph| graph.root_of(id)));

        let node = match shared.with_graph(|graph| graph.dependency(host, key)) {
            Some(node) => node,
            None => {
                let (identity, mut value) = template.duplicate().into_parts();
                if let Err(issue) = shared.with_graph(|graph| graph.validate_children(&mut value)) {
                    shared.report(issue);
                    return None;
                }
                let node = identity.id();
                shared.transaction(|| {
                    let inserted = shared.with_graph(|graph| {
                        graph.insert_dependency(host, key, identity, Box::new(value), activate_erased::<D>)
                    });
                    tracing::debug!(
                        event = "dependency",
                        node = %node,
                        host = %host,
                        key = key.name(),
                        "dependency node attached"
                    );
                    inserted.into_iter().for_each(|child| shared.activate(child));
                });
                node
            }
        };

        shared.with_graph(|graph| {
            graph.share_dependency(id, key, node);
            graph.identity(node)
        })
        .map(Model::from_identity)
    }

    /// Apply override scopes for `K`, guarding against re-entrant
    /// resolution. Returns the value and the scope that set it.
    fn resolve<K: DependencyKey>(
        &self,
        shared: &Shared,
        key: DependencyId,
    ) -> Option<(K::Value, Option<NodeId>)> {
        let id = self.id();
        if !shared.with_graph(|graph| graph.begin_resolution(id, key)) {
            shared.report(RuntimeIssue::RecursiveDependency {
                node: id,
                key: key.name(),
            });
            return None;
        }
        let scopes = shared.with_graph(|graph| graph.override_scopes(id));
        let dependencies = apply_scopes(&scopes);
        let value = dependencies.resolve::<K>();
        shared.with_graph(|graph| graph.end_resolution(id, key));
        Some((value, dependencies.scope_of(key)))
    }

    // =========================================================================
    // CANCELLATION
    // =========================================================================

    /// Register cancellable work owned by this node. It is cancelled when
    /// the node is torn down, by key, or by id.
    pub fn register_cancellable(
        &self,
        label: impl Into<String>,
        keys: impl IntoIterator<Item = CancelKey>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Option<CancelId> {
        let shared = self.live()?;
        let id = self.id();
        let label = label.into();
        let keys: Vec<CancelKey> = keys.into_iter().collect();
        shared.with_graph(|graph| {
            graph.contains(id).then(|| {
                graph
                    .cancellations
                    .register(id, label, keys, Box::new(cancel))
            })
        })
    }

    /// Add a grouping key to an existing registration.
    pub fn tag_cancellable(&self, id: CancelId, key: CancelKey) -> bool {
        self.identity
            .store()
            .is_some_and(|shared| shared.with_graph(|graph| graph.cancellations.tag(id, key)))
    }

    /// Cancel one registration.
    pub fn cancel(&self, id: CancelId) -> bool {
        self.store().is_some_and(|store| store.cancel(id))
    }

    /// Cancel every registration tagged with `key`, store-wide.
    pub fn cancel_all_for_key(&self, key: &CancelKey) -> usize {
        self.store().map_or(0, |store| store.cancel_all_for_key(key))
    }

    /// Run `body` with `key` applied to every registration it makes.
    pub fn with_cancel_key<R>(&self, key: CancelKey, body: impl FnOnce() -> R) -> R {
        match self.identity.store() {
            Some(shared) => shared.cancel_scope(key, body),
            None => body(),
        }
    }

    pub(crate) fn complete(&self, id: CancelId) {
        if let Some(shared) = self.identity.store() {
            shared.with_graph(|graph| graph.cancellations.complete(id));
        }
    }

    // =========================================================================
    // TRAVERSAL
    // =========================================================================

    fn query<R: Default>(&self, f: impl FnOnce(&mut crate::graph::Graph, NodeId) -> R) -> R {
        let id = self.id();
        self.identity
            .store()
            .map(|shared| shared.with_graph(|graph| f(graph, id)))
            .unwrap_or_default()
    }

    /// Direct parents, including nodes depending on this one.
    #[must_use]
    pub fn parents(&self) -> Vec<NodeId> {
        self.query(|graph, id| graph.parents(id))
    }

    /// Direct structural children.
    #[must_use]
    pub fn children(&self) -> Vec<NodeId> {
        self.query(|graph, id| graph.children(id))
    }

    /// Dependency nodes this node resolved.
    #[must_use]
    pub fn dependencies(&self) -> Vec<NodeId> {
        self.query(|graph, id| graph.dependency_nodes(id))
    }

    /// Every ancestor, nearest first.
    #[must_use]
    pub fn ancestors(&self) -> Vec<NodeId> {
        self.query(|graph, id| graph.ancestors(id))
    }

    /// Every descendant, dependency nodes included, nearest first.
    #[must_use]
    pub fn descendants(&self) -> Vec<NodeId> {
        self.query(|graph, id| graph.descendants(id, true))
    }

    /// Every root-to-node path.
    #[must_use]
    pub fn paths(&self) -> Vec<Vec<NodeId>> {
        self.query(|graph, id| graph.paths(id))
    }

    /// Writes committed to this node.
    #[must_use]
    pub fn modification_count(&self) -> u64 {
        self.query(|graph, id| graph.modification_count(id))
    }

    /// Writes committed to this node and everything below it.
    #[must_use]
    pub fn subtree_modification_count(&self) -> u64 {
        self.query(|graph, id| graph.subtree_modification_count(id))
    }
}

impl<M: State> Clone for Model<M> {
    fn clone(&self) -> Self {
        Self::from_identity(Arc::clone(&self.identity))
    }
}

impl<M: State> PartialEq for Model<M> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.identity, &other.identity)
    }
}

impl<M: State> Eq for Model<M> {}

impl<M: State> fmt::Debug for Model<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id())
            .field("type", &std::any::type_name::<M>())
            .field("lifetime", &self.lifetime())
            .finish()
    }
}
