//! Applying and waiting on a single change.

use std::sync::Arc;
use std::time::Duration;

use keel_core::annotations::{AssociationLabel, APP_LABEL, ORPHANED};
use keel_core::{Error, Resource, Result, UniqueResourceKey};
use keel_diff::{Change, ChangeFactory, ChangeOp, ChangeSet, ChangeSetOpts};
use keel_kubehub::{ClusterGateway, ListOpts, PatchType};
use keel_wait::{aggregate, wait_for_associated, ConvergencePredicates, DoneApplyState};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::strategy::{ApplyOp, CreateStrategy, DeleteStrategy, UpdateStrategy, WaitOp};

const RECALC_ATTEMPTS: usize = 10;
const RECORD_APPLIED_ATTEMPTS: u32 = 5;
const RECORD_APPLIED_BACKOFF: Duration = Duration::from_millis(200);
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a change needs to talk to the cluster.
#[derive(Clone)]
pub struct ChangeContext {
    pub gateway: Arc<dyn ClusterGateway>,
    pub factory: ChangeFactory,
    pub predicates: ConvergencePredicates,
    pub change_set_opts: ChangeSetOpts,
    pub default_update_strategy: UpdateStrategy,
    /// Upper bound on waiting for a deleted object to disappear.
    pub deletion_timeout: Duration,
}

pub struct ClusterChange {
    change: Change,
    apply_op: ApplyOp,
    wait_op: WaitOp,
    ctx: ChangeContext,
}

impl ClusterChange {
    pub fn new(change: Change, ctx: ChangeContext) -> Result<Self> {
        let apply_op = ApplyOp::for_change(&change, ctx.default_update_strategy)?;
        let wait_op = WaitOp::for_change(&change, apply_op);
        Ok(Self { change, apply_op, wait_op, ctx })
    }

    pub fn change(&self) -> &Change { &self.change }
    pub fn apply_op(&self) -> ApplyOp { self.apply_op }
    pub fn wait_op(&self) -> WaitOp { self.wait_op }
    pub fn description(&self) -> String { self.change.description() }

    fn gw(&self) -> &dyn ClusterGateway { self.ctx.gateway.as_ref() }

    /// Authored desired form, free of server fields so it can be created.
    fn creatable(&self) -> Result<Resource> {
        let mut res = self.change.applied().cloned().ok_or_else(|| Error::Internal(format!("{} has no desired resource", self.description())))?;
        res.strip_server_fields();
        Ok(res)
    }

    fn existing(&self) -> Result<&Resource> {
        self.change.existing().ok_or_else(|| Error::Internal(format!("{} has no live resource", self.description())))
    }

    /// Performs the change. Returns the server's copy for creates and updates.
    pub async fn apply(&self) -> Result<Option<Resource>> {
        match self.apply_op {
            ApplyOp::Noop | ApplyOp::Exists | ApplyOp::AwaitDeletion => Ok(None),
            ApplyOp::Create(strategy) => {
                let created = self.create(strategy).await?;
                self.record_applied(created).await.map(Some)
            }
            ApplyOp::Update(strategy) => {
                let updated = self.update(strategy).await?;
                self.record_applied(updated).await.map(Some)
            }
            ApplyOp::Delete(DeleteStrategy::Default) => self.delete().await.map(|_| None),
            ApplyOp::Delete(DeleteStrategy::Orphan) => self.orphan().await.map(Some),
        }
    }

    async fn create(&self, strategy: CreateStrategy) -> Result<Resource> {
        if let Some(old) = self.change.existing().filter(|e| e.is_being_deleted()) {
            info!(change = %self.description(), "waiting for terminating copy to go away before creating");
            self.await_disappearance(old).await?;
        }
        let err = match self.gw().create(&self.creatable()?).await {
            Ok(created) => return Ok(created),
            Err(e) => e,
        };
        if !(err.is_already_exists() && strategy == CreateStrategy::FallbackOnUpdate) {
            return Err(err);
        }
        debug!(change = %self.description(), "already exists, falling back to update");
        let latest = self.gw().get(self.change.resource()).await?;
        let first = self.recalculate(&latest)?;
        if first.op() == ChangeOp::Keep {
            return Ok(latest);
        }
        let desired = first.new_resource().cloned().ok_or_else(|| Error::Internal("recalculated change without desired resource".into()))?;
        match self.gw().update(&desired).await {
            Ok(updated) => Ok(updated),
            Err(e) if e.is_conflict() => self.update_after_conflict(&first.fingerprint(), e, false).await,
            Err(e) => Err(e),
        }
    }

    async fn update(&self, strategy: UpdateStrategy) -> Result<Resource> {
        if strategy == UpdateStrategy::AlwaysReplace {
            return self.replace(self.existing()?).await;
        }
        let desired = self.change.new_resource().ok_or_else(|| Error::Internal(format!("{} has no desired resource", self.description())))?;
        let fallback = strategy == UpdateStrategy::FallbackOnReplace;
        match self.gw().update(desired).await {
            Ok(updated) => Ok(updated),
            Err(e) if e.is_conflict() => self.update_after_conflict(&self.change.fingerprint(), e, fallback).await,
            Err(e) if e.is_invalid() && fallback => {
                info!(change = %self.description(), error = %e, "update rejected as invalid, replacing");
                self.replace(self.existing()?).await
            }
            Err(e) => Err(e),
        }
    }

    /// Re-diffs against the latest live copy and retries the update while the
    /// structural diff still matches the approved one.
    async fn update_after_conflict(&self, approved: &str, mut last_err: Error, fallback_on_invalid: bool) -> Result<Resource> {
        for attempt in 1..=RECALC_ATTEMPTS {
            counter!("keel_apply_conflict_recalc_total", 1u64);
            let latest = self.gw().get(self.change.resource()).await?;
            let recalc = self.recalculate(&latest)?;
            if recalc.op() != ChangeOp::Update {
                return Err(Error::Internal(format!("expected recalculated change for {} to be an update, got {}", self.description(), recalc.op())));
            }
            if recalc.fingerprint() != approved {
                warn!(change = %self.description(), attempt, "live resource drifted since the diff was approved");
                return Err(Error::DriftDetected { desc: self.description(), source: Box::new(last_err) });
            }
            let desired = recalc.new_resource().ok_or_else(|| Error::Internal("recalculated change without desired resource".into()))?;
            match self.gw().update(desired).await {
                Ok(updated) => {
                    debug!(change = %self.description(), attempt, "update succeeded after recalculation");
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    debug!(change = %self.description(), attempt, error = %e, "conflict again, recalculating");
                    last_err = e;
                }
                Err(e) if e.is_invalid() && fallback_on_invalid => return self.replace(&latest).await,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn recalculate(&self, latest: &Resource) -> Result<Change> {
        let applied = self.change.applied().cloned().ok_or_else(|| Error::Internal(format!("{} has no desired resource", self.description())))?;
        let mut changes = ChangeSet::new(vec![latest.clone()], vec![applied], self.ctx.change_set_opts, &self.ctx.factory).calculate()?;
        match changes.len() {
            1 => Ok(changes.remove(0)),
            n => Err(Error::Internal(format!("expected exactly one change when recalculating {}, got {}", self.description(), n))),
        }
    }

    async fn replace(&self, existing: &Resource) -> Result<Resource> {
        match self.gw().delete(existing).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.await_disappearance(existing).await?;
        self.gw().create(&self.creatable()?).await
    }

    async fn await_disappearance(&self, res: &Resource) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ctx.deletion_timeout;
        while self.gw().exists(res).await? {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(self.ctx.deletion_timeout));
            }
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match self.gw().delete(self.existing()?).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(change = %self.description(), "already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Leaves the object in place, marked orphaned and no longer labelled as ours.
    async fn orphan(&self) -> Result<Resource> {
        let patch = serde_json::json!({"metadata": {"annotations": {ORPHANED: ""}, "labels": {APP_LABEL: null}}});
        self.gw().patch(self.existing()?, PatchType::Merge, patch.to_string().as_bytes()).await
    }

    /// Writes the last-applied record, reloading the live copy after each failure.
    async fn record_applied(&self, mut current: Resource) -> Result<Resource> {
        let Some(applied) = self.change.applied() else { return Ok(current) };
        for attempt in 1..=RECORD_APPLIED_ATTEMPTS {
            let Some(recorded) = self.ctx.factory.resource_with_history(&current).record_last_applied(applied)? else {
                return Ok(current);
            };
            match self.gw().update(&recorded).await {
                Ok(updated) => {
                    counter!("keel_record_applied_total", 1u64);
                    return Ok(updated);
                }
                Err(e) if attempt < RECORD_APPLIED_ATTEMPTS => {
                    warn!(change = %self.description(), attempt, error = %e, "recording last applied failed, reloading");
                    tokio::time::sleep(RECORD_APPLIED_BACKOFF * 2u32.pow(attempt - 1)).await;
                    current = self.gw().get(&current).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(current)
    }

    /// Checks convergence of the applied change.
    pub async fn is_done_applying(&self) -> Result<DoneApplyState> {
        let res = self.change.resource();
        match self.wait_op {
            WaitOp::Noop => Ok(DoneApplyState::ok()),
            WaitOp::Deletion => Ok(if self.gw().exists(res).await? { DoneApplyState::in_progress("Waiting on deletion") } else { DoneApplyState::ok() }),
            WaitOp::Existence => Ok(if self.gw().exists(res).await? { DoneApplyState::ok() } else { DoneApplyState::in_progress("Waiting for resource to exist") }),
            WaitOp::Converge => {
                let latest = self.gw().get(res).await?;
                let state = self.ctx.predicates.check(&latest)?;
                if state.done || !wait_for_associated(&latest)? {
                    return Ok(state);
                }
                let associated = self.associated_states(&latest).await?;
                Ok(aggregate(state, &associated))
            }
        }
    }

    async fn associated_states(&self, parent: &Resource) -> Result<Vec<(String, DoneApplyState)>> {
        let mut opts = ListOpts::default();
        if !parent.namespace().is_empty() {
            opts = opts.in_namespace(parent.namespace());
        }
        let parent_key = UniqueResourceKey::new(parent);
        let mut out = Vec::new();
        for res in self.gw().list(&AssociationLabel::selector(parent), &opts).await? {
            if UniqueResourceKey::new(&res) == parent_key {
                continue;
            }
            out.push((res.description(), self.ctx.predicates.check(&res)?));
        }
        Ok(out)
    }
}
