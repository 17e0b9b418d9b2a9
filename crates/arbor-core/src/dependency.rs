//! # Dependencies
//!
//! Cross-cutting values injected into nodes. A dependency is declared by a
//! key type implementing `DependencyKey`; its default applies unless an
//! ancestor installed an override scope with `Model::with_dependencies`.
//!
//! Resolution walks from the requester outward through its ancestors and
//! applies override scopes farthest-first, so the nearest override wins.
//! `Dependencies` remembers which scope set each key: node-valued
//! dependencies are instantiated once per scope and shared by every
//! requester underneath it.

use crate::NodeId;
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Declares a dependency and its default value.
///
/// ```
/// use arbor_core::DependencyKey;
///
/// struct ApiBase;
/// impl DependencyKey for ApiBase {
///     type Value = String;
///     fn default_value() -> String {
///         "https://example.invalid".to_string()
///     }
/// }
/// ```
pub trait DependencyKey: 'static {
    /// The injected value. Node-valued dependencies use `Detached<D>`.
    type Value: Clone + Send + Sync + 'static;

    /// Value used when no override scope sets this key.
    fn default_value() -> Self::Value;
}

/// Identity of a dependency key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyId {
    type_id: TypeId,
    name: &'static str,
}

impl DependencyId {
    /// Identity of key type `K`.
    #[must_use]
    pub fn of<K: DependencyKey>() -> Self {
        Self {
            type_id: TypeId::of::<K>(),
            name: std::any::type_name::<K>(),
        }
    }

    /// Type name of the key, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A set of dependency values being assembled for one resolution.
#[derive(Clone, Default)]
pub struct Dependencies {
    values: BTreeMap<DependencyId, Arc<dyn Any + Send + Sync>>,
    set_by: BTreeMap<DependencyId, NodeId>,
    scope: Option<NodeId>,
}

impl Dependencies {
    /// Create an empty set; every key resolves to its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override key `K`.
    pub fn set<K: DependencyKey>(&mut self, value: K::Value) {
        let id = DependencyId::of::<K>();
        self.values.insert(id, Arc::new(value));
        if let Some(scope) = self.scope {
            self.set_by.insert(id, scope);
        }
    }

    /// Overridden value of key `K`, if any scope set it.
    #[must_use]
    pub fn get<K: DependencyKey>(&self) -> Option<K::Value> {
        self.values
            .get(&DependencyId::of::<K>())
            .and_then(|value| value.downcast_ref::<K::Value>())
            .cloned()
    }

    /// Check whether any scope overrode key `K`.
    #[must_use]
    pub fn contains<K: DependencyKey>(&self) -> bool {
        self.values.contains_key(&DependencyId::of::<K>())
    }

    /// Resolve key `K`: the override if present, otherwise the default.
    #[must_use]
    pub fn resolve<K: DependencyKey>(&self) -> K::Value {
        self.get::<K>().unwrap_or_else(K::default_value)
    }

    pub(crate) fn enter_scope(&mut self, node: NodeId) {
        self.scope = Some(node);
    }

    pub(crate) fn scope_of(&self, id: DependencyId) -> Option<NodeId> {
        self.set_by.get(&id).copied()
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field(
                "keys",
                &self.values.keys().map(DependencyId::name).collect::<Vec<_>>(),
            )
            .field("set_by", &self.set_by)
            .finish()
    }
}

/// Dependency-mutation function carried by an override scope.
pub(crate) type DependencyOverride = Arc<dyn Fn(&mut Dependencies) + Send + Sync>;

/// Apply override scopes, given nearest-first, so that the nearest wins.
pub(crate) fn apply_scopes(scopes: &[(NodeId, DependencyOverride)]) -> Dependencies {
    let mut dependencies = Dependencies::new();
    for (node, apply) in scopes.iter().rev() {
        dependencies.enter_scope(*node);
        apply(&mut dependencies);
    }
    dependencies
}

// =============================================================================
// TESTS
// =============================================================================
