use std::sync::Arc;
use std::time::Duration;

use keel_core::{Error, Result};
use keel_graph::NodeId;
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_change::ClusterChange;

/// Takes a slot from the shared cap on in-flight cluster calls, if there is one.
pub(crate) async fn acquire(permits: &Option<Arc<Semaphore>>) -> Result<Option<OwnedSemaphorePermit>> {
    match permits {
        Some(p) => p.clone().acquire_owned().await.map(Some).map_err(|e| Error::Internal(e.to_string())),
        None => Ok(None),
    }
}

/// Applied changes whose convergence has not been confirmed yet.
pub struct WaitingChanges {
    pending: Vec<NodeId>,
    started: Option<Instant>,
    timeout: Duration,
    check_interval: Duration,
    permits: Option<Arc<Semaphore>>,
}

impl WaitingChanges {
    pub fn new(timeout: Duration, check_interval: Duration) -> Self {
        Self { pending: Vec::new(), started: None, timeout, check_interval, permits: None }
    }

    /// Each poll holds one of `permits` while it talks to the cluster.
    pub fn with_permits(mut self, permits: Option<Arc<Semaphore>>) -> Self {
        self.permits = permits;
        self
    }

    pub fn track(&mut self, ids: impl IntoIterator<Item = NodeId>) { self.pending.extend(ids); }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn len(&self) -> usize { self.pending.len() }

    /// Polls every pending change each pass until at least one is done.
    /// The deadline counts from the first call; a failed change aborts.
    pub async fn wait_for_any(&mut self, changes: &[Arc<ClusterChange>], cancel: &CancellationToken) -> Result<Vec<NodeId>> {
        let deadline = *self.started.get_or_insert_with(Instant::now) + self.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                counter!("keel_wait_timeout_total", 1u64);
                warn!(pending = self.pending.len(), timeout_secs = self.timeout.as_secs(), "timed out waiting");
                return Err(Error::Timeout(self.timeout));
            }

            let checks = self.pending.iter().map(|&id| {
                let cc = changes[id].clone();
                let permits = self.permits.clone();
                async move {
                    let out = match acquire(&permits).await {
                        Ok(_permit) => cc.is_done_applying().await,
                        Err(e) => Err(e),
                    };
                    (id, out)
                }
            });
            let results = futures::future::join_all(checks).await;
            counter!("keel_wait_pass_total", 1u64);

            let mut done = Vec::new();
            for (id, result) in results {
                let cc = &changes[id];
                let state = result.map_err(|e| e.in_change(cc.description(), "waiting on"))?;
                match (state.done, state.successful) {
                    (true, true) => {
                        info!(change = %cc.description(), message = %state.message, "done waiting");
                        done.push(id);
                    }
                    (true, false) => return Err(Error::ConvergenceFailed { desc: cc.description(), message: state.message }),
                    _ => debug!(change = %cc.description(), message = %state.message, "ongoing"),
                }
            }
            if !done.is_empty() {
                self.pending.retain(|id| !done.contains(id));
                return Ok(done);
            }

            let wake = (Instant::now() + self.check_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
