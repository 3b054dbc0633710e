//! The narrow surface the engine needs from a cluster.

use async_trait::async_trait;
use keel_core::{GroupKind, Resource, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Merge,
    StrategicMerge,
}

/// Narrows a label-selector list. Empty `namespaces` lists across all namespaces.
#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub group_kinds: Option<Vec<GroupKind>>,
    pub namespaces: Vec<String>,
}

impl ListOpts {
    pub fn with_group_kinds(mut self, gks: Vec<GroupKind>) -> Self {
        self.group_kinds = Some(gks);
        self
    }

    pub fn in_namespace(mut self, ns: &str) -> Self {
        self.namespaces.push(ns.to_string());
        self
    }

    pub(crate) fn wants(&self, group: &str, kind: &str) -> bool {
        self.group_kinds.as_ref().map_or(true, |gks| gks.iter().any(|gk| gk.group == group && gk.kind == kind))
    }
}

/// Create/update/patch/delete/get/exists/list over untyped resources.
/// Implementations map server rejections onto the `Conflict`, `Invalid`,
/// `AlreadyExists` and `NotFound` error variants.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create(&self, res: &Resource) -> Result<Resource>;
    async fn update(&self, res: &Resource) -> Result<Resource>;
    async fn patch(&self, res: &Resource, patch_type: PatchType, data: &[u8]) -> Result<Resource>;
    /// Background propagation; carries a UID precondition when `res` has a UID.
    async fn delete(&self, res: &Resource) -> Result<()>;
    async fn get(&self, res: &Resource) -> Result<Resource>;
    async fn exists(&self, res: &Resource) -> Result<bool>;
    async fn list(&self, selector: &str, opts: &ListOpts) -> Result<Vec<Resource>>;
}
