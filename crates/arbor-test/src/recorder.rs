//! Recording instrumentation: every committed write and every sent event
//! in the covered subtree lands in a queue until a test consumes it.

use arbor_core::{
    Access, AccessCallback, AccessInstrumentation, EventEnvelope, FieldPath, NodeId, Snapshot,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One committed write with its post-write value.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// The written node.
    pub node: NodeId,
    /// The written field.
    pub path: FieldPath,
    /// Point-in-time copy of the node after the write.
    pub snapshot: Snapshot,
}

impl WriteRecord {
    fn describe(&self) -> String {
        format!("{}.{}", self.node, self.path)
    }
}

#[derive(Default)]
pub(crate) struct Recorder {
    writes: Arc<Mutex<VecDeque<WriteRecord>>>,
    events: Mutex<VecDeque<EventEnvelope>>,
}

impl Recorder {
    /// Remove every recorded write on `node`.
    pub(crate) fn drain_writes_for(&self, node: NodeId) -> usize {
        let mut writes = self.writes.lock();
        let before = writes.len();
        writes.retain(|write| write.node != node);
        before - writes.len()
    }

    /// Remove the oldest write matching `node` and `path`.
    pub(crate) fn take_write(&self, node: NodeId, path: FieldPath) -> Option<WriteRecord> {
        let mut writes = self.writes.lock();
        let index = writes
            .iter()
            .position(|write| write.node == node && write.path == path)?;
        writes.remove(index)
    }

    pub(crate) fn take_event(&self) -> Option<EventEnvelope> {
        self.events.lock().pop_front()
    }

    pub(crate) fn clear_writes(&self) -> usize {
        let mut writes = self.writes.lock();
        let count = writes.len();
        writes.clear();
        count
    }

    pub(crate) fn clear_events(&self) -> usize {
        let mut events = self.events.lock();
        let count = events.len();
        events.clear();
        count
    }

    pub(crate) fn pending_writes(&self) -> Vec<String> {
        self.writes.lock().iter().map(WriteRecord::describe).collect()
    }

    pub(crate) fn pending_events(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| format!("{} from {}", event.type_name(), event.origin()))
            .collect()
    }
}

impl AccessInstrumentation for Recorder {
    fn propagates_to_children(&self) -> bool {
        true
    }

    fn will_write(&self, access: &Access) -> Option<AccessCallback> {
        let writes = Arc::clone(&self.writes);
        let (node, path) = (access.node, access.path);
        Some(Box::new(move |snapshot: &Snapshot| {
            writes.lock().push_back(WriteRecord {
                node,
                path,
                snapshot: snapshot.clone(),
            });
        }))
    }

    fn did_send(&self, envelope: &EventEnvelope) {
        self.events.lock().push_back(envelope.clone());
    }
}
