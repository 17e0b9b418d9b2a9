//! # arbor-test
//!
//! Exhaustive test store for arbor-core state graphs.
//!
//! A `TestStore` anchors a root under a recording instrumentation that
//! covers the whole subtree. Tests drive the root through its `Model`,
//! then account for every effect:
//! - root writes through `assert_state`, which advances an expected value
//!   and compares it with the live one
//! - writes below the root through `expect_write`
//! - sent events through `receive`
//! - running tasks through `cancel_tasks`
//!
//! `finish` fails if anything is left over or the runtime reported misuse.

// =============================================================================
// MODULES
// =============================================================================

mod recorder;

pub use recorder::WriteRecord;

use arbor_core::{
    CollectingSink, Detached, FieldPath, IssueSink, Model, NodeId, RuntimeConfig, RuntimeIssue,
    Snapshot, State, Store,
};
use recorder::Recorder;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// FAILURES
// =============================================================================

/// Why a test store assertion failed.
#[derive(Debug, Error)]
pub enum TestFailure {
    /// The root value could not be anchored.
    #[error("Root could not be anchored: {0:?}")]
    Anchor(Vec<RuntimeIssue>),

    /// The root node is no longer live.
    #[error("Root node is gone")]
    RootGone,

    /// The live root value differs from the expected one.
    #[error("State mismatch:\n expected: {expected}\n   actual: {actual}")]
    StateMismatch {
        /// Debug rendering of the expected value.
        expected: String,
        /// Debug rendering of the live value.
        actual: String,
    },

    /// No recorded write matched.
    #[error("Expected a write to {node}.{path}, none recorded")]
    MissingWrite {
        /// The node that should have been written.
        node: NodeId,
        /// The field that should have been written.
        path: &'static str,
    },

    /// No event was recorded.
    #[error("Expected an event of type {expected}, none recorded")]
    MissingEvent {
        /// The expected payload type.
        expected: &'static str,
    },

    /// The oldest recorded event has a different payload type.
    #[error("Expected an event of type {expected}, received {actual}")]
    UnexpectedEvent {
        /// The expected payload type.
        expected: &'static str,
        /// The recorded payload type.
        actual: &'static str,
    },

    /// The oldest recorded event failed the predicate.
    #[error("Event of type {type_name} from {origin} did not match")]
    EventMismatch {
        /// The payload type.
        type_name: &'static str,
        /// The sending node.
        origin: NodeId,
    },

    /// Effects were left unasserted.
    #[error("Unconsumed effects: writes {writes:?}, events {events:?}, tasks {tasks:?}")]
    Unconsumed {
        /// Unasserted writes, as `node.field`.
        writes: Vec<String>,
        /// Unreceived events, as `type from node`.
        events: Vec<String>,
        /// Labels of tasks still registered.
        tasks: Vec<String>,
    },

    /// The runtime reported misuse during the test.
    #[error("Runtime issues: {0:?}")]
    Issues(Vec<RuntimeIssue>),
}

// =============================================================================
// TEST STORE
// =============================================================================

/// Exhaustive test store around one root of type `M`.
pub struct TestStore<M: State + PartialEq + fmt::Debug> {
    store: Store,
    root: Model<M>,
    expected: M,
    recorder: Arc<Recorder>,
    sink: Arc<CollectingSink>,
    finished: bool,
}

impl<M: State + PartialEq + fmt::Debug> TestStore<M> {
    /// Anchor `initial` as the root of a fresh store.
    pub fn new(initial: M) -> Result<Self, TestFailure> {
        Self::with_config(initial, RuntimeConfig::default())
    }

    /// Anchor `initial` in a store with the given configuration.
    pub fn with_config(initial: M, config: RuntimeConfig) -> Result<Self, TestFailure> {
        let sink = Arc::new(CollectingSink::new());
        let store = Store::new(config, sink.clone());
        let expected = initial.clone();
        let root = store
            .anchor(Detached::new(initial))
            .ok_or_else(|| TestFailure::Anchor(sink.take()))?;

        let recorder = Arc::new(Recorder::default());
        root.instrument(recorder.clone());
        tracing::debug!(event = "test_store", root = %root.id(), "test store ready");

        Ok(Self {
            store,
            root,
            expected,
            recorder,
            sink,
            finished: false,
        })
    }

    /// The root handle.
    #[must_use]
    pub fn root(&self) -> &Model<M> {
        &self.root
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Advance the expected root value and compare it with the live one.
    /// Consumes every recorded write on the root.
    pub fn assert_state(&mut self, update: impl FnOnce(&mut M)) -> Result<(), TestFailure> {
        update(&mut self.expected);
        let actual = self.root.value().ok_or(TestFailure::RootGone)?;
        self.recorder.drain_writes_for(self.root.id());
        if actual == self.expected {
            Ok(())
        } else {
            Err(TestFailure::StateMismatch {
                expected: format!("{:?}", self.expected),
                actual: format!("{actual:?}"),
            })
        }
    }

    /// Consume the oldest recorded write to `path` on `node`.
    pub fn expect_write(&mut self, node: NodeId, path: FieldPath) -> Result<Snapshot, TestFailure> {
        self.recorder
            .take_write(node, path)
            .map(|write| write.snapshot)
            .ok_or(TestFailure::MissingWrite {
                node,
                path: path.name,
            })
    }

    /// Consume the oldest recorded event, which must carry an `E`
    /// satisfying `predicate`. Returns the sending node.
    pub fn receive<E: Any>(&mut self, predicate: impl FnOnce(&E) -> bool) -> Result<NodeId, TestFailure> {
        let expected = std::any::type_name::<E>();
        let envelope = self
            .recorder
            .take_event()
            .ok_or(TestFailure::MissingEvent { expected })?;
        let Some(payload) = envelope.payload::<E>() else {
            return Err(TestFailure::UnexpectedEvent {
                expected,
                actual: envelope.type_name(),
            });
        };
        if predicate(payload) {
            Ok(envelope.origin())
        } else {
            Err(TestFailure::EventMismatch {
                type_name: envelope.type_name(),
                origin: envelope.origin(),
            })
        }
    }

    /// Discard every recorded write. Returns how many were dropped.
    pub fn skip_writes(&mut self) -> usize {
        self.recorder.clear_writes()
    }

    /// Discard every recorded event. Returns how many were dropped.
    pub fn skip_events(&mut self) -> usize {
        self.recorder.clear_events()
    }

    /// Cancel every registered task. Returns how many were cancelled.
    pub fn cancel_tasks(&mut self) -> usize {
        self.store
            .tasks()
            .into_iter()
            .filter(|task| self.store.cancel(task.id))
            .count()
    }

    /// Finish the test: fails if any effect is unconsumed or the runtime
    /// reported misuse. Tears the store down either way.
    pub fn finish(mut self) -> Result<(), TestFailure> {
        self.finished = true;
        let result = self.check();
        self.store.teardown();
        result
    }

    fn check(&self) -> Result<(), TestFailure> {
        let writes = self.recorder.pending_writes();
        let events = self.recorder.pending_events();
        let tasks: Vec<String> = self.store.tasks().into_iter().map(|task| task.label).collect();

        if !(writes.is_empty() && events.is_empty() && tasks.is_empty()) {
            let failure = TestFailure::Unconsumed {
                writes,
                events,
                tasks,
            };
            self.sink
                .report(RuntimeIssue::Exhaustiveness(failure.to_string()));
            return Err(failure);
        }

        let issues = self.sink.take();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(TestFailure::Issues(issues))
        }
    }
}

impl<M: State + PartialEq + fmt::Debug> Drop for TestStore<M> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(failure) = self.check() {
            tracing::warn!(event = "test_store_unfinished", error = %failure, "test store dropped unfinished");
        }
        self.store.teardown();
    }
}

impl<M: State + PartialEq + fmt::Debug> fmt::Debug for TestStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStore")
            .field("root", &self.root)
            .field("expected", &self.expected)
            .field("finished", &self.finished)
            .finish()
    }
}
