//! The apply loop: applies unblocked changes batch by batch, then waits for
//! them to converge before unblocking their dependents.

use std::sync::Arc;

use keel_core::{Error, Result};
use keel_graph::{BlockedChanges, ChangeGraph, NodeId};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_change::{ChangeContext, ClusterChange};
use crate::opts::ReconcileOpts;
use crate::waiting::{acquire, WaitingChanges};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Changes that called the cluster.
    pub applied: usize,
    pub noop: usize,
    pub batches: usize,
}

pub struct ClusterChangeSet {
    graph: ChangeGraph,
    changes: Vec<Arc<ClusterChange>>,
    opts: ReconcileOpts,
    cancel: CancellationToken,
    /// Caps in-flight cluster calls across applies and polls.
    permits: Option<Arc<Semaphore>>,
}

impl ClusterChangeSet {
    pub fn new(graph: ChangeGraph, ctx: ChangeContext, opts: ReconcileOpts) -> Result<Self> {
        let changes = graph
            .nodes()
            .iter()
            .map(|n| ClusterChange::new(n.change.clone(), ctx.clone()).map(Arc::new).map_err(|e| e.in_change(n.change.description(), "preparing")))
            .collect::<Result<Vec<_>>>()?;
        let permits = (opts.concurrency > 0).then(|| Arc::new(Semaphore::new(opts.concurrency)));
        Ok(Self { graph, changes, opts, cancel: CancellationToken::new(), permits })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling stops waiting at the next poll; in-flight applies finish.
    pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }

    pub fn graph(&self) -> &ChangeGraph { &self.graph }

    pub fn cluster_change(&self, id: NodeId) -> &ClusterChange { &self.changes[id] }

    pub async fn apply(&self) -> Result<ApplyReport> {
        let mut blocked = BlockedChanges::new(&self.graph);
        let mut applied: FxHashSet<NodeId> = FxHashSet::default();
        let mut waiting = WaitingChanges::new(self.opts.wait_timeout, self.opts.wait_check_interval).with_permits(self.permits.clone());
        let mut report = ApplyReport::default();

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let batch: Vec<NodeId> = blocked.unblocked().into_iter().filter(|id| !applied.contains(id)).collect();
            if batch.is_empty() {
                if waiting.is_empty() {
                    if applied.len() == self.graph.len() {
                        info!(applied = report.applied, noop = report.noop, batches = report.batches, "all changes applied");
                        return Ok(report);
                    }
                    let stuck: Vec<String> = blocked.blocked().into_iter().map(|id| blocked.why_blocked(id)).collect();
                    return Err(Error::Internal(format!(
                        "expected all changes to be applied, {} of {} applied; blocked: {}",
                        applied.len(),
                        self.graph.len(),
                        stuck.join("; ")
                    )));
                }
                for id in waiting.wait_for_any(&self.changes, &self.cancel).await? {
                    blocked.unblock(id);
                }
                continue;
            }

            report.batches += 1;
            for &id in &batch {
                if self.changes[id].apply_op().is_noop() {
                    report.noop += 1;
                } else {
                    report.applied += 1;
                }
            }
            info!(batch = report.batches, size = batch.len(), "applying batch");
            self.apply_batch(&batch).await?;
            applied.extend(batch.iter().copied());
            waiting.track(batch);
        }
    }

    /// Applies every change of the batch concurrently and waits for all of
    /// them; the first failure is returned once the batch has drained.
    async fn apply_batch(&self, batch: &[NodeId]) -> Result<()> {
        let mut set = JoinSet::new();
        for &id in batch {
            let cc = self.changes[id].clone();
            let permits = self.permits.clone();
            set.spawn(async move {
                if cc.apply_op().is_noop() {
                    return Ok(());
                }
                let _permit = acquire(&permits).await?;
                let t0 = tokio::time::Instant::now();
                debug!(change = %cc.description(), op = %cc.apply_op(), "apply start");
                let out = cc.apply().await;
                histogram!("keel_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                match out {
                    Ok(_) => {
                        counter!("keel_apply_ok", 1u64);
                        info!(change = %cc.description(), op = %cc.apply_op(), "applied");
                        Ok(())
                    }
                    Err(e) => {
                        counter!("keel_apply_err", 1u64);
                        warn!(change = %cc.description(), op = %cc.apply_op(), error = %e, "apply failed");
                        Err(e.in_change(cc.description(), cc.apply_op().to_string()))
                    }
                }
            });
        }
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let out = joined.unwrap_or_else(|e| Err(Error::Internal(format!("apply task failed: {}", e))));
            if let Err(e) = out {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
