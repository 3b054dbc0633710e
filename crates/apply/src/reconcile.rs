use std::fmt;
use std::sync::Arc;

use keel_config::Conf;
use keel_core::{Resource, Result};
use keel_diff::{Change, ChangeFactory, ChangeOp, ChangeSetOpts, VersionedChangeSet};
use keel_graph::ChangeGraph;
use keel_kubehub::{ClusterGateway, IdentifiedResources, ListOpts};
use keel_wait::ConvergencePredicates;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::cluster_change::ChangeContext;
use crate::cluster_change_set::{ApplyReport, ClusterChangeSet};
use crate::labels::LabeledResources;
use crate::opts::ReconcileOpts;
use crate::retry::{RetryingGateway, RETRY_BACKOFF};

/// Counts of changes per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub add: usize,
    pub delete: usize,
    pub update: usize,
    pub keep: usize,
    pub ignored: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op: {} add, {} delete, {} update, {} keep, {} ignored", self.add, self.delete, self.update, self.keep, self.ignored)
    }
}

/// Ordered changes ready to be applied.
pub struct Plan {
    graph: ChangeGraph,
    factory: ChangeFactory,
}

impl Plan {
    pub fn graph(&self) -> &ChangeGraph { &self.graph }

    pub fn changes(&self) -> impl Iterator<Item = &Change> { self.graph.nodes().iter().map(|n| &n.change) }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for c in self.changes() {
            if c.is_ignored() {
                s.ignored += 1;
                continue;
            }
            match c.op() {
                ChangeOp::Add => s.add += 1,
                ChangeOp::Delete => s.delete += 1,
                ChangeOp::Update => s.update += 1,
                ChangeOp::Keep => s.keep += 1,
            }
        }
        s
    }

    /// True when applying would not call the cluster.
    pub fn is_empty(&self) -> bool {
        let s = self.summary();
        s.add + s.delete + s.update == 0
    }
}

/// Plans and applies a desired resource set against the cluster.
pub struct Reconciler {
    gateway: Arc<dyn ClusterGateway>,
    conf: Conf,
    opts: ReconcileOpts,
}

impl Reconciler {
    /// Wraps `gateway` so created objects carry the identity annotation and
    /// retryable call failures are retried up to `opts.apply_retries` times.
    pub fn new(gateway: Arc<dyn ClusterGateway>, conf: Conf, opts: ReconcileOpts) -> Self {
        let identified: Arc<dyn ClusterGateway> = Arc::new(IdentifiedResources::new(gateway));
        let gateway = Arc::new(RetryingGateway::new(identified, opts.apply_retries, RETRY_BACKOFF));
        Self { gateway, conf, opts }
    }

    pub fn conf(&self) -> &Conf { &self.conf }
    pub fn opts(&self) -> &ReconcileOpts { &self.opts }

    fn change_set_opts(&self) -> ChangeSetOpts { ChangeSetOpts { against_last_applied: self.opts.against_last_applied } }

    /// Live resources matching `selector`; ones not created by the engine come back transient.
    pub async fn fetch_existing(&self, selector: &str) -> Result<Vec<Resource>> { self.gateway.list(selector, &ListOpts::default()).await }

    pub fn plan(&self, existing: Vec<Resource>, desired: Vec<Resource>) -> Result<Plan> {
        let desired = LabeledResources::new(&self.conf, self.opts.app_label.as_deref()).prepare(desired)?;
        let factory = ChangeFactory::from_conf(&self.conf);
        let changes = VersionedChangeSet::new(existing, desired, self.conf.template_rules(), self.change_set_opts(), &factory).calculate()?;
        let graph = ChangeGraph::from_conf(changes, &self.conf)?;
        Ok(Plan { graph, factory })
    }

    pub fn change_set(&self, plan: Plan) -> Result<ClusterChangeSet> {
        let ctx = ChangeContext {
            gateway: self.gateway.clone(),
            factory: plan.factory,
            predicates: ConvergencePredicates::from_conf(&self.conf).with_ignore_failing_api_services(self.opts.ignore_failing_api_services),
            change_set_opts: self.change_set_opts(),
            default_update_strategy: self.opts.default_update_strategy,
            deletion_timeout: self.opts.wait_timeout,
        };
        ClusterChangeSet::new(plan.graph, ctx, self.opts.clone())
    }

    pub async fn apply(&self, plan: Plan) -> Result<ApplyReport> { self.change_set(plan)?.apply().await }

    /// Lists what the app previously applied, plans against it and applies.
    pub async fn reconcile(&self, desired: Vec<Resource>) -> Result<ApplyReport> {
        let run = uuid::Uuid::new_v4();
        async move {
            let selector = LabeledResources::new(&self.conf, self.opts.app_label.as_deref()).app_selector();
            let existing = match selector {
                Some(sel) => self.fetch_existing(&sel).await?,
                None => Vec::new(),
            };
            let plan = self.plan(existing, desired)?;
            info!(summary = %plan.summary(), "planned");
            self.apply(plan).await
        }
        .instrument(info_span!("reconcile", run = %run))
        .await
    }
}
