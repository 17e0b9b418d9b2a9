//! # Async Tasks
//!
//! Tasks spawned on the ambient tokio runtime, owned by a node. Each task
//! is registered as a cancellable whose callback aborts it, so node
//! teardown, key cancellation and store teardown all stop it. A task that
//! finishes on its own removes its registration.

use crate::model::Model;
use crate::state::State;
use crate::CancelId;
use std::future::Future;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Cancellation marker. Task bodies may return it to stop early; it never
/// reaches the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task cancelled")]
pub struct Cancelled;

impl<M: State> Model<M> {
    /// Spawn `future` as a task owned by this node.
    ///
    /// Returns `None` if the node is not live or no tokio runtime is
    /// running on this thread.
    pub fn spawn_task<F>(&self, label: impl Into<String>, future: F) -> Option<CancelId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(event = "spawn_failed", node = %self.id(), label = %label, error = %err, "no tokio runtime");
                return None;
            }
        };

        let (registered, registration) = oneshot::channel::<CancelId>();
        let owner = self.clone();
        let task = handle.spawn(async move {
            future.await;
            if let Ok(id) = registration.await {
                owner.complete(id);
            }
        });

        let abort = task.abort_handle();
        let Some(id) = self.register_cancellable(label.clone(), [], move || abort.abort()) else {
            task.abort();
            return None;
        };
        tracing::debug!(event = "spawn", node = %self.id(), id = id.0, label = %label, "task spawned");
        // The task only waits on this to deregister itself.
        let _ = registered.send(id);
        Some(id)
    }

    /// Spawn a fallible task. Errors go to `on_error`, except `Cancelled`,
    /// which is swallowed.
    pub fn spawn_task_with_handler<F, E>(
        &self,
        label: impl Into<String>,
        future: F,
        on_error: impl FnOnce(E) + Send + 'static,
    ) -> Option<CancelId>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let label = label.into();
        let node = self.id();
        let task_label = label.clone();
        self.spawn_task(label, async move {
            if let Err(err) = future.await {
                if (&err as &(dyn std::error::Error + 'static)).is::<Cancelled>() {
                    tracing::debug!(event = "task_cancelled", node = %node, label = %task_label, "task stopped");
                } else {
                    on_error(err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::{CancelKey, Detached};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Worker;

    impl State for Worker {}

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn spawn_without_runtime_is_refused() {
        let store = Store::default();
        let model = store.anchor(Detached::new(Worker)).expect("anchored");
        assert!(model.spawn_task("idle", async {}).is_none());
        assert!(store.tasks().is_empty());
    }

    #[tokio::test]
    async fn finished_tasks_deregister() {
        let store = Store::default();
        let model = store.anchor(Detached::new(Worker)).expect("anchored");
        let (done, finished) = oneshot::channel();

        let id = model
            .spawn_task("quick", async move {
                let _ = done.send(());
            })
            .expect("spawned");
        assert_eq!(store.tasks()[0].id, id);

        finished.await.expect("task ran");
        for _ in 0..50 {
            if store.tasks().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.tasks().is_empty());
    }

    #[tokio::test]
    async fn cancelled_by_key() {
        let store = Store::default();
        let model = store.anchor(Detached::new(Worker)).expect("anchored");
        let key = CancelKey::new("refresh");

        model.with_cancel_key(key.clone(), || {
            model.spawn_task("forever", std::future::pending::<()>());
        });
        assert_eq!(store.tasks()[0].keys, vec![key.clone()]);
        assert_eq!(model.cancel_all_for_key(&key), 1);
        assert!(store.tasks().is_empty());
    }

    #[tokio::test]
    async fn cancelled_marker_is_swallowed() {
        let store = Store::default();
        let model = store.anchor(Detached::new(Worker)).expect("anchored");
        let errors = Arc::new(Mutex::new(Vec::new()));

        let (quiet_done, quiet) = oneshot::channel();
        let sink = Arc::clone(&errors);
        model.spawn_task_with_handler(
            "quiet",
            async move {
                let _ = quiet_done.send(());
                Err(Cancelled)
            },
            move |err: Cancelled| sink.lock().push(err.to_string()),
        );

        let (loud_done, loud) = oneshot::channel();
        let sink = Arc::clone(&errors);
        model.spawn_task_with_handler(
            "loud",
            async move {
                let _ = loud_done.send(());
                Err(Boom)
            },
            move |err: Boom| sink.lock().push(err.to_string()),
        );

        quiet.await.expect("quiet ran");
        loud.await.expect("loud ran");
        for _ in 0..50 {
            if !errors.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*errors.lock(), vec!["boom".to_string()]);
    }
}
