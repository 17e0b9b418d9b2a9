//! # Events
//!
//! Events travel through the graph from a sending node in the directions
//! named by an `EventScope`. Each reachable node is visited at most once
//! per send, even when several paths lead to it.

use crate::{EventScope, NodeId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A sent event: payload, originating node and scope.
#[derive(Clone)]
pub struct EventEnvelope {
    payload: Arc<dyn Any + Send + Sync>,
    origin: NodeId,
    scope: EventScope,
    type_name: &'static str,
}

impl EventEnvelope {
    /// Wrap a payload sent from `origin`.
    pub fn new<E: Any + Send + Sync>(payload: E, origin: NodeId, scope: EventScope) -> Self {
        Self {
            payload: Arc::new(payload),
            origin,
            scope,
            type_name: std::any::type_name::<E>(),
        }
    }

    /// The node that sent the event.
    #[must_use]
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Directions the event was sent in.
    #[must_use]
    pub fn scope(&self) -> EventScope {
        self.scope
    }

    /// Payload as `E`, if it is one.
    #[must_use]
    pub fn payload<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    /// Type name of the payload.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("type", &self.type_name)
            .field("origin", &self.origin)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Registered event handler.
pub(crate) type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Wrap a typed handler so it only sees payloads of type `E`.
pub(crate) fn typed_handler<E: Any>(
    handler: impl Fn(&E, NodeId) + Send + Sync + 'static,
) -> EventHandler {
    Arc::new(move |envelope: &EventEnvelope| {
        if let Some(payload) = envelope.payload::<E>() {
            handler(payload, envelope.origin());
        }
    })
}
