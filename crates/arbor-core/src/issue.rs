//! # Issue Reporting
//!
//! Programmer misuse of the graph is never thrown. The offending operation
//! becomes a no-op returning a harmless default, and the condition is
//! handed to the store's `IssueSink`.

use crate::{Lifetime, NodeId};
use parking_lot::Mutex;
use thiserror::Error;

/// A non-fatal misuse signal raised by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeIssue {
    /// A node in a frozen or destructed state was mutated.
    #[error("Stale write to {node} in lifetime {lifetime:?}")]
    StaleWrite {
        /// The node that was written.
        node: NodeId,
        /// Its lifetime at the time of the write.
        lifetime: Lifetime,
    },

    /// A value already attached elsewhere was attached again, or a
    /// non-initial node was re-anchored.
    #[error("Identity reuse: {node} is already attached")]
    IdentityReuse {
        /// The node whose identity was reused.
        node: NodeId,
    },

    /// Dependency resolution re-entered itself on the same node.
    #[error("Recursive dependency: {node} re-entered resolution of {key}")]
    RecursiveDependency {
        /// The requesting node.
        node: NodeId,
        /// Type name of the dependency key.
        key: &'static str,
    },

    /// A node was accessed while not part of any live graph.
    #[error("Unanchored access to {node}")]
    UnanchoredAccess {
        /// The node that was accessed.
        node: NodeId,
    },

    /// A test finished with unasserted effects.
    #[error("Exhaustiveness violation: {0}")]
    Exhaustiveness(String),
}

/// Destination for runtime issues.
///
/// Sinks must be `Send + Sync`: issues are reported from whichever thread
/// performed the offending operation.
pub trait IssueSink: Send + Sync {
    /// Record one issue.
    fn report(&self, issue: RuntimeIssue);
}

/// Default sink: logs every issue through `tracing` at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl IssueSink for TracingSink {
    fn report(&self, issue: RuntimeIssue) {
        tracing::warn!(event = "runtime_issue", issue = %issue, "Arbor runtime issue");
    }
}

/// Sink that keeps every reported issue, for tests and harnesses.
#[derive(Debug, Default)]
pub struct CollectingSink {
    issues: Mutex<Vec<RuntimeIssue>>,
}

impl CollectingSink {
    /// Create an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every issue reported so far.
    #[must_use]
    pub fn issues(&self) -> Vec<RuntimeIssue> {
        self.issues.lock().clone()
    }

    /// Remove and return every issue reported so far.
    pub fn take(&self) -> Vec<RuntimeIssue> {
        std::mem::take(&mut *self.issues.lock())
    }

    /// Check whether nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.lock().is_empty()
    }
}

impl IssueSink for CollectingSink {
    fn report(&self, issue: RuntimeIssue) {
        tracing::debug!(event = "runtime_issue", issue = %issue, "collected");
        self.issues.lock().push(issue);
    }
}
