//! # arbor-core
//!
//! Reactive state-graph runtime.
//!
//! Application state is a graph of typed nodes. Every node value carries a
//! stable identity; once anchored in a `Store`, nodes are read and written
//! through `Model` handles, and every change flows through one runtime
//! that can observe it, coalesce notifications, route events and tear
//! down owned work.
//!
//! ## Core Guarantees
//!
//! - Identity is stable across copies and writes
//! - A value is attached at most once; violations are reported, not thrown
//! - Activation runs parent before child, teardown child before parent
//! - Subscribers fire once per transaction
//! - Every cancellable receives exactly one cancellation callback
//!
//! ## Concurrency
//!
//! A store is `Send + Sync`. Its arena sits behind a reentrant lock, so
//! user callbacks may call back into the store on the same thread.

// =============================================================================
// MODULES
// =============================================================================

pub mod access;
pub mod cancellation;
pub mod config;
pub mod dependency;
pub mod event;
mod graph;
pub mod issue;
pub mod model;
pub mod primitives;
pub mod state;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ArborError, CancelId, CancelKey, EdgeKey, EdgePath, EventScope, FieldPath, Lifetime, NodeId,
    SubscriptionId,
};

// =============================================================================
// RE-EXPORTS: Runtime
// =============================================================================

pub use access::{Access, AccessCallback, AccessInstrumentation, AccessKind, Observation};
pub use cancellation::{CancelFn, Cancellable, CancellationRegistry, TaskInfo};
pub use config::{ReactivationPolicy, RuntimeConfig};
pub use dependency::{Dependencies, DependencyId, DependencyKey};
pub use event::EventEnvelope;
pub use issue::{CollectingSink, IssueSink, RuntimeIssue, TracingSink};
pub use model::Model;
pub use state::{Child, Detached, Field, Snapshot, State};
pub use store::Store;
pub use tasks::Cancelled;
pub use telemetry::{LogFormat, init_tracing, init_tracing_with};

#[doc(hidden)]
pub use state::{ChildSlot, ErasedState, Identity};
