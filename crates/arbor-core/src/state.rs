//! # Node State
//!
//! Value-side types of the runtime:
//! - `State`: implemented by every node type, enumerates child slots
//! - `Field`: typed accessor pairing a `FieldPath` with get/get_mut
//! - `Detached`: a freestanding node value carrying its identity
//! - `Child`: a field slot holding a pending or live child node
//! - `Snapshot`: type-erased point-in-time copy of a node value
//!
//! Identity is shared by every copy of a value through an `Arc<Identity>`,
//! so a copy can tell whether "its" node has since been anchored elsewhere.

use crate::issue::{IssueSink, RuntimeIssue, TracingSink};
use crate::model::Model;
use crate::store::Shared;
use crate::{EdgePath, FieldPath, Lifetime, NodeId};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

// =============================================================================
// STATE TRAIT
// =============================================================================

/// A unit of application state managed as a graph node.
///
/// Implementations list every child slot with its edge path. Types without
/// nested nodes keep the default.
pub trait State: Clone + Send + Sync + 'static {
    /// Child slots of this value, in declaration order.
    fn children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
        Vec::new()
    }

    /// Activation logic, run once when the node becomes active.
    fn activate(_model: &Model<Self>) {}
}

/// Type-erased node value stored in the graph arena.
#[doc(hidden)]
pub trait ErasedState: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_state(&self) -> Box<dyn ErasedState>;
    fn erased_children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)>;
    fn type_name(&self) -> &'static str;
}

impl<T: State> ErasedState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_state(&self) -> Box<dyn ErasedState> {
        Box::new(self.clone())
    }

    fn erased_children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
        State::children(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Activation entry point of a node type, monomorphized per `State` impl.
#[doc(hidden)]
pub type ActivateFn = fn(&Arc<Identity>);

pub(crate) fn activate_erased<M: State>(identity: &Arc<Identity>) {
    M::activate(&Model::from_identity(Arc::clone(identity)));
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Shared identity of every copy of one node value.
#[doc(hidden)]
pub struct Identity {
    id: NodeId,
    state: Mutex<IdentityState>,
}

struct IdentityState {
    lifetime: Lifetime,
    store: Weak<Shared>,
    last_seen: Option<Box<dyn ErasedState>>,
}

impl Identity {
    pub(crate) fn new(id: NodeId, lifetime: Lifetime) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(IdentityState {
                lifetime,
                store: Weak::new(),
                last_seen: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn lifetime(&self) -> Lifetime {
        self.state.lock().lifetime
    }

    pub(crate) fn set_lifetime(&self, lifetime: Lifetime) {
        self.state.lock().lifetime = lifetime;
    }

    pub(crate) fn anchor(&self, store: Weak<Shared>) {
        let mut state = self.state.lock();
        state.lifetime = Lifetime::Anchored;
        state.store = store;
    }

    /// Mark destructed, optionally keeping the final value for late reads.
    /// The store link is kept so late misuse still reaches its sink.
    pub(crate) fn destruct(&self, last_seen: Option<Box<dyn ErasedState>>) {
        let mut state = self.state.lock();
        state.lifetime = Lifetime::Destructed;
        state.last_seen = last_seen;
    }

    pub(crate) fn store(&self) -> Option<Arc<Shared>> {
        self.state.lock().store.upgrade()
    }

    pub(crate) fn belongs_to(&self, store: &Weak<Shared>) -> bool {
        Weak::ptr_eq(&self.state.lock().store, store)
    }

    pub(crate) fn last_seen<R>(&self, f: impl FnOnce(&dyn ErasedState) -> R) -> Option<R> {
        self.state.lock().last_seen.as_deref().map(f)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("lifetime", &self.lifetime())
            .finish()
    }
}

// =============================================================================
// FIELD ACCESSOR
// =============================================================================

/// Typed accessor for one field of node type `M`.
///
/// This is what a code-generation layer emits per declared field:
///
/// ```
/// use arbor_core::{Field, FieldPath, State};
///
/// #[derive(Clone, Default)]
/// struct Counter { count: i64 }
/// impl State for Counter {}
///
/// const COUNT: Field<Counter, i64> =
///     Field::new(FieldPath::new(0, "count"), |c| &c.count, |c| &mut c.count);
/// assert_eq!(COUNT.path().name, "count");
/// ```
pub struct Field<M, V> {
    path: FieldPath,
    get: fn(&M) -> &V,
    get_mut: fn(&mut M) -> &mut V,
}

impl<M, V> Field<M, V> {
    /// Create a field accessor.
    #[must_use]
    pub const fn new(path: FieldPath, get: fn(&M) -> &V, get_mut: fn(&mut M) -> &mut V) -> Self {
        Self { path, get, get_mut }
    }

    /// The field's path token.
    #[must_use]
    pub const fn path(&self) -> FieldPath {
        self.path
    }

    /// Borrow the field from a value.
    pub fn get<'a>(&self, value: &'a M) -> &'a V {
        (self.get)(value)
    }

    /// Mutably borrow the field from a value.
    pub fn get_mut<'a>(&self, value: &'a mut M) -> &'a mut V {
        (self.get_mut)(value)
    }
}

impl<M, V> Clone for Field<M, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, V> Copy for Field<M, V> {}

impl<M, V> fmt::Debug for Field<M, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.path).finish()
    }
}

// =============================================================================
// DETACHED VALUE
// =============================================================================

/// A freestanding node value together with its identity.
///
/// Copies share the identity. Once any copy is anchored, the others become
/// stale: `update` on them is reported as unanchored access.
#[derive(Clone)]
pub struct Detached<M: State> {
    identity: Arc<Identity>,
    value: M,
}

impl<M: State> Detached<M> {
    /// Wrap a value as a new, `Initial` node.
    #[must_use]
    pub fn new(value: M) -> Self {
        Self {
            identity: Identity::new(NodeId::generate(), Lifetime::Initial),
            value,
        }
    }

    pub(crate) fn frozen(id: NodeId, value: M) -> Self {
        Self {
            identity: Identity::new(id, Lifetime::FrozenCopy),
            value,
        }
    }

    /// The node's identifier.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    /// The node's lifetime, shared by every copy.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.identity.lifetime()
    }

    /// Borrow the value.
    #[must_use]
    pub fn value(&self) -> &M {
        &self.value
    }

    /// Mutate the value while it is still freestanding.
    ///
    /// This is the one safe path for writing a node outside a graph.
    /// Returns `false` and reports an issue if the node is frozen or has
    /// been anchored through another copy.
    pub fn update(&mut self, f: impl FnOnce(&mut M)) -> bool {
        match self.lifetime() {
            Lifetime::Initial => {
                f(&mut self.value);
                true
            }
            lifetime if lifetime.is_stale() => {
                TracingSink.report(RuntimeIssue::StaleWrite {
                    node: self.id(),
                    lifetime,
                });
                false
            }
            _ => {
                TracingSink.report(RuntimeIssue::UnanchoredAccess { node: self.id() });
                false
            }
        }
    }

    /// Copy the value under a fresh identity.
    ///
    /// Nested pending children keep their identities, so duplicating a
    /// value with nested children and attaching both copies is rejected.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::new(self.value.clone())
    }

    /// Consume the value, returning it without its identity.
    #[must_use]
    pub fn into_value(self) -> M {
        self.value
    }

    pub(crate) fn into_parts(self) -> (Arc<Identity>, M) {
        (self.identity, self.value)
    }
}

impl<M: State + fmt::Debug> fmt::Debug for Detached<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detached")
            .field("id", &self.id())
            .field("value", &self.value)
            .finish()
    }
}

// =============================================================================
// CHILD SLOT
// =============================================================================

/// A field slot that can hold a child node.
#[doc(hidden)]
pub trait ChildSlot: Send + Sync {
    fn identity(&self) -> Arc<Identity>;
    fn pending_mut(&mut self) -> Option<&mut dyn ErasedState>;
    fn take_pending(&mut self) -> Option<(Box<dyn ErasedState>, ActivateFn)>;
}

/// A child node held in a parent's field.
///
/// Built from a `Detached` value it is pending until the parent's write
/// attaches it; read back from a live parent it refers to the live child.
pub struct Child<C: State> {
    identity: Arc<Identity>,
    pending: Option<Box<C>>,
}

impl<C: State> Child<C> {
    /// Wrap a freestanding value for assignment into a field.
    #[must_use]
    pub fn new(detached: Detached<C>) -> Self {
        let (identity, value) = detached.into_parts();
        Self {
            identity,
            pending: Some(Box::new(value)),
        }
    }

    /// Identifier of the child node.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    /// Lifetime of the child node.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.identity.lifetime()
    }

    /// Whether the child is still waiting to be attached.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Handle to the live child node.
    #[must_use]
    pub fn model(&self) -> Model<C> {
        Model::from_identity(Arc::clone(&self.identity))
    }
}

impl<C: State> From<Detached<C>> for Child<C> {
    fn from(detached: Detached<C>) -> Self {
        Self::new(detached)
    }
}

impl<C: State> Clone for Child<C> {
    fn clone(&self) -> Self {
        Self {
            identity: Arc::clone(&self.identity),
            pending: self.pending.clone(),
        }
    }
}

impl<C: State> PartialEq for Child<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<C: State> Eq for Child<C> {}

impl<C: State> fmt::Debug for Child<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("id", &self.id())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl<C: State> ChildSlot for Child<C> {
    fn identity(&self) -> Arc<Identity> {
        Arc::clone(&self.identity)
    }

    fn pending_mut(&mut self) -> Option<&mut dyn ErasedState> {
        self.pending
            .as_deref_mut()
            .map(|value| value as &mut dyn ErasedState)
    }

    fn take_pending(&mut self) -> Option<(Box<dyn ErasedState>, ActivateFn)> {
        self.pending.take().map(|value| {
            let erased: Box<dyn ErasedState> = value;
            (erased, activate_erased::<C> as ActivateFn)
        })
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Point-in-time copy of a node value, handed to instrumentation.
pub struct Snapshot {
    node: NodeId,
    value: Box<dyn ErasedState>,
}

impl Snapshot {
    pub(crate) fn new(node: NodeId, value: Box<dyn ErasedState>) -> Self {
        Self { node, value }
    }

    /// The node the snapshot was taken from.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Borrow the value as its concrete type.
    #[must_use]
    pub fn downcast_ref<M: State>(&self) -> Option<&M> {
        self.value.as_any().downcast_ref::<M>()
    }

    /// Type name of the captured value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            value: self.value.clone_state(),
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("node", &self.node)
            .field("type", &self.type_name())
            .finish()
    }
}

// Marker keeping `Model` generic over the value type without owning it.
pub(crate) type TypeMarker<M> = PhantomData<fn() -> M>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Leaf {
        value: i64,
    }

    impl State for Leaf {}

    #[derive(Clone, Debug)]
    struct Pair {
        left: Child<Leaf>,
    }

    impl State for Pair {
        fn children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
            vec![(EdgePath::field(FieldPath::new(0, "left")), &mut self.left as &mut dyn ChildSlot)]
        }
    }

    const VALUE: Field<Leaf, i64> =
        Field::new(FieldPath::new(0, "value"), |l| &l.value, |l| &mut l.value);

    #[test]
    fn copies_share_identity() {
        let detached = Detached::new(Leaf { value: 1 });
        let copy = detached.clone();
        assert_eq!(detached.id(), copy.id());
        assert_eq!(copy.lifetime(), Lifetime::Initial);
    }

    #[test]
    fn duplicate_gets_fresh_identity() {
        let detached = Detached::new(Leaf { value: 1 });
        let twin = detached.duplicate();
        assert_ne!(detached.id(), twin.id());
        assert_eq!(twin.value(), detached.value());
    }

    #[test]
    fn update_is_the_freestanding_write_path() {
        let mut detached = Detached::new(Leaf::default());
        assert!(detached.update(|leaf| leaf.value = 5));
        assert_eq!(detached.value().value, 5);

        let mut frozen = Detached::frozen(NodeId::generate(), Leaf::default());
        assert!(!frozen.update(|leaf| leaf.value = 9));
        assert_eq!(frozen.value().value, 0);
    }

    #[test]
    fn field_accessors_project() {
        let mut leaf = Leaf { value: 3 };
        *VALUE.get_mut(&mut leaf) += 1;
        assert_eq!(*VALUE.get(&leaf), 4);
        assert_eq!(VALUE.path().index, 0);
    }

    #[test]
    fn pending_child_is_taken_once() {
        let leaf = Detached::new(Leaf { value: 2 });
        let id = leaf.id();
        let mut pair = Pair {
            left: Child::new(leaf),
        };

        let mut slots = pair.children();
        assert_eq!(slots.len(), 1);
        let (_, slot) = &mut slots[0];
        assert_eq!(slot.identity().id(), id);
        assert!(slot.pending_mut().is_some());
        assert!(slot.take_pending().is_some());
        assert!(slot.take_pending().is_none());
    }

    #[test]
    fn snapshot_downcasts() {
        let snapshot = Snapshot::new(NodeId(4), Box::new(Leaf { value: 8 }));
        assert_eq!(snapshot.downcast_ref::<Leaf>(), Some(&Leaf { value: 8 }));
        assert!(snapshot.downcast_ref::<Pair>().is_none());
        assert_eq!(snapshot.clone().node(), NodeId(4));
    }
}
