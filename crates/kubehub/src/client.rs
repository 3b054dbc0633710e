//! `ClusterGateway` over a kube-rs client with dynamic, discovery-resolved APIs.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{verbs, Discovery, Scope},
    Client,
};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use keel_core::{ApiFailure, Error, Resource, Result};

use crate::gateway::{ClusterGateway, ListOpts, PatchType};

pub struct KubeGateway {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self { Self { client, discovery: OnceCell::new() } }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    async fn discovery(&self) -> Result<&Discovery> {
        let client = self.client.clone();
        let d = self
            .discovery
            .get_or_try_init(|| async move { Discovery::new(client).run().await.context("running api discovery") })
            .await?;
        Ok(d)
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let discovery = self.discovery().await?;
        for group in discovery.groups() {
            if group.name() != gvk.group {
                continue;
            }
            for (ar, caps) in group.versioned_resources(&gvk.version) {
                if ar.kind == gvk.kind {
                    return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
                }
            }
        }
        Err(Error::Other(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api_for(&self, res: &Resource) -> Result<(Api<DynamicObject>, ApiResource)> {
        let gvk = GroupVersionKind { group: res.api_group().to_string(), version: res.version().to_string(), kind: res.kind().to_string() };
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        let api = if namespaced && !res.namespace().is_empty() {
            Api::namespaced_with(self.client.clone(), res.namespace(), &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, ar))
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create(&self, res: &Resource) -> Result<Resource> {
        let (api, ar) = self.api_for(res).await?;
        debug!(res = %res.description(), "kube: create");
        let obj = api.create(&PostParams::default(), &to_dynamic(res)?).await.map_err(map_kube_err)?;
        from_dynamic(obj, &ar)
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        let (api, ar) = self.api_for(res).await?;
        debug!(res = %res.description(), rv = ?res.resource_version(), "kube: update");
        let obj = api.replace(res.name(), &PostParams::default(), &to_dynamic(res)?).await.map_err(map_kube_err)?;
        from_dynamic(obj, &ar)
    }

    async fn patch(&self, res: &Resource, patch_type: PatchType, data: &[u8]) -> Result<Resource> {
        let (api, ar) = self.api_for(res).await?;
        let body: serde_json::Value = serde_json::from_slice(data)?;
        let patch = match patch_type {
            PatchType::Merge => Patch::Merge(body),
            PatchType::StrategicMerge => Patch::Strategic(body),
        };
        debug!(res = %res.description(), ?patch_type, "kube: patch");
        let obj = api.patch(res.name(), &PatchParams::default(), &patch).await.map_err(map_kube_err)?;
        from_dynamic(obj, &ar)
    }

    async fn delete(&self, res: &Resource) -> Result<()> {
        let (api, _) = self.api_for(res).await?;
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: res.uid().map(|uid| Preconditions { uid: Some(uid.to_string()), resource_version: None }),
            ..DeleteParams::default()
        };
        debug!(res = %res.description(), uid = ?res.uid(), "kube: delete");
        api.delete(res.name(), &dp).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn get(&self, res: &Resource) -> Result<Resource> {
        let (api, ar) = self.api_for(res).await?;
        let obj = api.get(res.name()).await.map_err(map_kube_err)?;
        from_dynamic(obj, &ar)
    }

    async fn exists(&self, res: &Resource) -> Result<bool> {
        let (api, _) = self.api_for(res).await?;
        Ok(api.get_opt(res.name()).await.map_err(map_kube_err)?.is_some())
    }

    async fn list(&self, selector: &str, opts: &ListOpts) -> Result<Vec<Resource>> {
        let discovery = self.discovery().await?;
        let lp = ListParams::default().labels(selector);
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) || !opts.wants(&ar.group, &ar.kind) {
                    continue;
                }
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let apis: Vec<Api<DynamicObject>> = if namespaced && !opts.namespaces.is_empty() {
                    opts.namespaces.iter().map(|ns| Api::namespaced_with(self.client.clone(), ns, &ar)).collect()
                } else {
                    vec![Api::all_with(self.client.clone(), &ar)]
                };
                for api in apis {
                    match api.list(&lp).await {
                        Ok(list) => {
                            for obj in list.items {
                                out.push(from_dynamic(obj, &ar)?);
                            }
                        }
                        // Aggregated APIs may be listed in discovery yet be unavailable or forbidden.
                        Err(kube::Error::Api(resp)) if matches!(resp.code, 403 | 404 | 405 | 503) => {
                            warn!(kind = %ar.kind, group = %ar.group, code = resp.code, reason = %resp.reason, "kube: list skipped");
                        }
                        Err(e) => return Err(map_kube_err(e)),
                    }
                }
            }
        }
        debug!(selector, count = out.len(), "kube: list");
        Ok(out)
    }
}

fn to_dynamic(res: &Resource) -> Result<DynamicObject> { Ok(serde_json::from_value(res.to_value())?) }

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn from_dynamic(mut obj: DynamicObject, ar: &ApiResource) -> Result<Resource> {
    // List items come back without type meta.
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    let mut raw = serde_json::to_value(&obj)?;
    strip_managed_fields(&mut raw);
    Resource::from_value(raw)
}

/// Sorts server rejections into the engine's error variants by code and reason.
pub fn map_kube_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) => {
            let failure = ApiFailure::new(resp.code, resp.reason.clone(), resp.message.clone());
            match (resp.code, resp.reason.as_str()) {
                (_, "AlreadyExists") => Error::AlreadyExists(failure),
                (409, _) | (_, "Conflict") => Error::Conflict(failure),
                (422, _) | (_, "Invalid") => Error::Invalid(failure),
                (404, _) | (_, "NotFound") => Error::NotFound(failure),
                _ => Error::Api(failure),
            }
        }
        other => Error::Transport(other.to_string()),
    }
}
