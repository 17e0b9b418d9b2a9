//! # Core Type Definitions
//!
//! This module contains the identifiers and small value types shared by
//! every part of the Arbor runtime:
//! - Node identity (`NodeId`) and lifetime (`Lifetime`)
//! - Field and edge addressing (`FieldPath`, `EdgePath`, `EdgeKey`)
//! - Event routing (`EventScope`)
//! - Registration handles (`SubscriptionId`, `CancelId`, `CancelKey`)
//! - Error types (`ArborError`)
//!
//! ## Ordering Guarantees
//!
//! All identifiers implement `Ord` so graph tables can use `BTreeMap` and
//! `BTreeSet`, which keeps traversal and notification order deterministic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

// =============================================================================
// NODE IDENTITY
// =============================================================================

static NEXT_NODE_ID: Mutex<u64> = parking_lot::const_mutex(1);

/// Process-unique identifier of a node.
///
/// The identifier travels with every copy of a node's value, so two copies
/// that represent "the same" node always compare equal by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Generate a fresh identifier.
    ///
    /// The counter is lock-protected and wraps back to 1 instead of
    /// overflowing; 0 is never handed out.
    pub fn generate() -> Self {
        let mut next = NEXT_NODE_ID.lock();
        let id = *next;
        *next = next.checked_add(1).unwrap_or(1);
        Self(id)
    }

    /// Get the raw identifier value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

// =============================================================================
// LIFETIME
// =============================================================================

/// Lifetime state of a node.
///
/// The live states are totally ordered: `Initial < Anchored < Active <
/// Destructed`. `LastSeen` marks a snapshot of a destructed node kept for
/// straggler reads, `FrozenCopy` an immutable detached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lifetime {
    /// Freshly constructed, not yet part of any graph.
    Initial,
    /// Attached to a store, activation pending.
    Anchored,
    /// Attached and activated.
    Active,
    /// Detached from every parent and torn down.
    Destructed,
    /// Post-destruction snapshot tolerating late reads.
    LastSeen,
    /// Immutable detached snapshot of a live node.
    FrozenCopy,
}

impl Lifetime {
    /// Whether the node is currently part of a graph.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Anchored | Self::Active)
    }

    /// Whether writes against a node in this state are stale.
    #[must_use]
    pub const fn is_stale(self) -> bool {
        matches!(self, Self::Destructed | Self::LastSeen | Self::FrozenCopy)
    }
}

// =============================================================================
// FIELD & EDGE ADDRESSING
// =============================================================================

/// Addressable field of a node type.
///
/// The index is the field's position in the type's declaration, the name is
/// carried for diagnostics. Subscriber tables are keyed by this token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FieldPath {
    /// Position of the field within its node type.
    pub index: u16,
    /// Field name, for logs and test failures.
    pub name: &'static str,
}

impl FieldPath {
    /// Create a new field path.
    #[must_use]
    pub const fn new(index: u16, name: &'static str) -> Self {
        Self { index, name }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Location of a child within its parent: a field plus an optional
/// element index for collection fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgePath {
    /// The field holding the child.
    pub field: FieldPath,
    /// Element index when the field holds several children.
    pub element: Option<u64>,
}

impl EdgePath {
    /// Edge path for a field holding a single child.
    #[must_use]
    pub const fn field(field: FieldPath) -> Self {
        Self {
            field,
            element: None,
        }
    }

    /// Edge path for one element of a collection field.
    #[must_use]
    pub const fn element(field: FieldPath, element: u64) -> Self {
        Self {
            field,
            element: Some(element),
        }
    }
}

/// Key of a parent-to-child edge.
///
/// The same child moved to a different path keeps its identity; a
/// different child at the same path is a different edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeKey {
    /// Where the child sits in the parent.
    pub path: EdgePath,
    /// Identity of the child.
    pub child: NodeId,
}

// =============================================================================
// EVENT SCOPE
// =============================================================================

/// Directional scope of a sent event. Flags combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventScope(u8);

impl EventScope {
    /// The sending node itself.
    pub const SELF: Self = Self(1);
    /// Direct parents of the sender.
    pub const PARENTS: Self = Self(1 << 1);
    /// Every ancestor of the sender.
    pub const ANCESTORS: Self = Self(1 << 2);
    /// Direct children of the sender.
    pub const CHILDREN: Self = Self(1 << 3);
    /// Every descendant of the sender.
    pub const DESCENDANTS: Self = Self(1 << 4);
    /// Dependency nodes resolved by the sender.
    pub const DEPENDENCIES: Self = Self(1 << 5);

    /// Empty scope; an event sent with it reaches nobody.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Check whether every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventScope {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// =============================================================================
// REGISTRATION HANDLES
// =============================================================================

/// Handle of a field subscription or event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Handle of a cancellable registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CancelId(pub u64);

/// Grouping key for cancellable registrations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CancelKey(pub String);

impl CancelKey {
    /// Create a new cancellation key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CancelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors returned by the fallible edges of the runtime.
///
/// Misuse of the graph itself is not an error value; it is reported to the
/// store's `IssueSink` (see `issue`). This type covers configuration and
/// telemetry setup only.
#[derive(Debug, Error)]
pub enum ArborError {
    /// A configuration value could not be parsed.
    #[error("Invalid configuration value for {key}: {value:?}")]
    InvalidConfig {
        /// The offending key or environment variable.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A configuration document could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// An I/O error occurred while reading configuration.
    #[error("I/O error: {0}")]
    IoError(String),

    /// The tracing subscriber could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn generated_ids_are_unique() {
        let ids: BTreeSet<NodeId> = (0..1000).map(|_| NodeId::generate()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(!ids.contains(&NodeId(0)));
    }

    #[test]
    fn lifetime_ordering() {
        assert!(Lifetime::Initial < Lifetime::Anchored);
        assert!(Lifetime::Anchored < Lifetime::Active);
        assert!(Lifetime::Active < Lifetime::Destructed);
        assert!(Lifetime::Active.is_live());
        assert!(!Lifetime::Initial.is_live());
        assert!(Lifetime::FrozenCopy.is_stale());
        assert!(!Lifetime::Anchored.is_stale());
    }

    #[test]
    fn event_scope_flags_combine() {
        let scope = EventScope::SELF | EventScope::ANCESTORS;
        assert!(scope.contains(EventScope::SELF));
        assert!(scope.contains(EventScope::ANCESTORS));
        assert!(!scope.contains(EventScope::CHILDREN));
        assert!(EventScope::empty().is_empty());
    }

    #[test]
    fn edge_keys_distinguish_path_and_child() {
        let field = FieldPath::new(0, "items");
        let a = EdgeKey {
            path: EdgePath::element(field, 0),
            child: NodeId(7),
        };
        let moved = EdgeKey {
            path: EdgePath::element(field, 1),
            child: NodeId(7),
        };
        assert_ne!(a, moved);
        assert_eq!(a.child, moved.child);
    }
}
