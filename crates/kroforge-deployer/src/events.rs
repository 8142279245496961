//! Background streaming of cluster events for deployed resources.

use futures::StreamExt;
use kroforge_core::cluster::ClusterClient;
use kroforge_core::deployment::DeploymentEvent;
use kroforge_core::resource::ObjectRef;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STOP_GRACE: Duration = Duration::from_secs(1);

/// Streams cluster events about watched objects into a progress channel.
///
/// Every watch runs in its own task. [`EventMonitor::stop`] cancels them all
/// and waits until each has dropped its stream, which closes the underlying
/// connection. Dropping the monitor without stopping it aborts the tasks.
pub struct EventMonitor {
    client: Arc<dyn ClusterClient>,
    sink: mpsc::UnboundedSender<DeploymentEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventMonitor {
    pub fn new(client: Arc<dyn ClusterClient>, sink: mpsc::UnboundedSender<DeploymentEvent>) -> Self {
        Self {
            client,
            sink,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start streaming events about `target`, tagged with `resource_id`.
    ///
    /// Ignored once the monitor has been stopped.
    pub fn watch(&self, resource_id: impl Into<String>, target: ObjectRef) {
        let resource_id = resource_id.into();
        if self.cancel.is_cancelled() {
            debug!(resource = %resource_id, "Event monitor stopped, not watching");
            return;
        }

        let client = self.client.clone();
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = client.watch_events(&target) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(resource = %resource_id, object = %target, error = %e, "Failed to watch events");
                    return;
                }
            };
            debug!(resource = %resource_id, object = %target, "Watching events");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            let event = DeploymentEvent::ClusterEvent {
                                resource_id: resource_id.clone(),
                                event,
                            };
                            if sink.send(event).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(resource = %resource_id, error = %e, "Event stream error");
                        }
                        None => break,
                    },
                }
            }

            drop(stream);
            debug!(resource = %resource_id, "Event watch closed");
        });

        self.lock_tasks().push(handle);
    }

    /// Number of watches that have not finished.
    pub fn active(&self) -> usize {
        self.lock_tasks().iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop every watch and wait for each to release its stream.
    ///
    /// A watch that does not exit within a short grace period is aborted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for mut task in tasks {
            let joined = match tokio::time::timeout(STOP_GRACE, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Event watch did not stop in time, aborting");
                    task.abort();
                    task.await
                }
            };
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "Event watch panicked");
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}
