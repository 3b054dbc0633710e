use std::sync::Arc;

use async_trait::async_trait;
use keel_core::annotations::IdentityAnnotation;
use keel_core::{Resource, Result};

use crate::gateway::{ClusterGateway, ListOpts, PatchType};

/// Stamps the identity annotation on everything written and strips it from
/// everything read. Listed resources whose identity does not decode to their
/// own key and apiVersion were not created by the engine and come back transient.
#[derive(Clone)]
pub struct IdentifiedResources {
    inner: Arc<dyn ClusterGateway>,
}

impl IdentifiedResources {
    pub fn new(inner: Arc<dyn ClusterGateway>) -> Self { Self { inner } }

    pub fn inner(&self) -> &Arc<dyn ClusterGateway> { &self.inner }

    fn identified(res: &Resource) -> Resource {
        let mut res = res.clone();
        IdentityAnnotation::add(&mut res);
        res
    }

    fn unidentified(mut res: Resource) -> Resource {
        IdentityAnnotation::remove(&mut res);
        res
    }

    fn classified(mut res: Resource) -> Resource {
        res.mark_transient(!IdentityAnnotation::valid(&res));
        Self::unidentified(res)
    }
}

#[async_trait]
impl ClusterGateway for IdentifiedResources {
    async fn create(&self, res: &Resource) -> Result<Resource> {
        Ok(Self::unidentified(self.inner.create(&Self::identified(res)).await?))
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        Ok(Self::unidentified(self.inner.update(&Self::identified(res)).await?))
    }

    async fn patch(&self, res: &Resource, patch_type: PatchType, data: &[u8]) -> Result<Resource> {
        Ok(Self::unidentified(self.inner.patch(res, patch_type, data).await?))
    }

    async fn delete(&self, res: &Resource) -> Result<()> { self.inner.delete(res).await }

    async fn get(&self, res: &Resource) -> Result<Resource> { Ok(Self::classified(self.inner.get(res).await?)) }

    async fn exists(&self, res: &Resource) -> Result<bool> { self.inner.exists(res).await }

    async fn list(&self, selector: &str, opts: &ListOpts) -> Result<Vec<Resource>> {
        Ok(self.inner.list(selector, opts).await?.into_iter().map(Self::classified).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use keel_core::annotations::IDENTITY;
    use serde_json::json;

    fn cm(name: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns", "labels": {"app": "a"}}})).unwrap()
    }

    #[tokio::test]
    async fn identity_is_written_and_hidden() {
        let mem = Arc::new(MemoryGateway::new());
        let gw = IdentifiedResources::new(mem.clone());

        let created = gw.create(&cm("c")).await.unwrap();
        assert!(!created.has_annotation(IDENTITY));

        let raw = mem.get(&cm("c")).await.unwrap();
        assert!(IdentityAnnotation::valid(&raw));

        let read = gw.get(&cm("c")).await.unwrap();
        assert!(!read.has_annotation(IDENTITY));
        assert!(!read.transient());
    }

    #[tokio::test]
    async fn foreign_resources_are_transient() {
        let mem = Arc::new(MemoryGateway::new());
        mem.insert(cm("foreign"));
        let gw = IdentifiedResources::new(mem.clone());
        gw.create(&cm("ours")).await.unwrap();

        let listed = gw.list("app=a", &ListOpts::default()).await.unwrap();
        let transient: Vec<(&str, bool)> = listed.iter().map(|r| (r.name(), r.transient())).collect();
        assert_eq!(transient, vec![("foreign", true), ("ours", false)]);
    }
}
