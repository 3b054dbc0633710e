//! In-memory `ClusterGateway` for tests: server-side bookkeeping, optimistic
//! concurrency, label selectors, merge patch, scripted failures and a call log.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as Json};

use keel_core::{ApiFailure, Error, Resource, Result, UniqueResourceKey};

use crate::gateway::{ClusterGateway, ListOpts, PatchType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Patch,
    Delete,
    Get,
    Exists,
    List,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::Get => "get",
            Verb::Exists => "exists",
            Verb::List => "list",
        };
        f.write_str(s)
    }
}

/// Stored objects plus the resourceVersion counter.
#[derive(Default)]
pub struct Store {
    objects: BTreeMap<UniqueResourceKey, Resource>,
    rv: u64,
}

impl Store {
    pub fn get(&self, key: &UniqueResourceKey) -> Option<&Resource> { self.objects.get(key) }

    pub fn remove(&mut self, key: &UniqueResourceKey) -> Option<Resource> { self.objects.remove(key) }

    /// Edits a stored object as a third party would; resourceVersion and
    /// generation follow the change.
    pub fn mutate(&mut self, key: &UniqueResourceKey, f: impl FnOnce(&mut Resource)) -> bool {
        let Some(prev) = self.objects.get(key).cloned() else { return false };
        let mut next = prev.clone();
        f(&mut next);
        self.put(next, Some(&prev));
        true
    }

    fn put(&mut self, mut res: Resource, prev: Option<&Resource>) -> Resource {
        self.rv += 1;
        let generation = match prev {
            Some(p) if spec_of(p) == spec_of(&res) => p.generation(),
            Some(p) => p.generation() + 1,
            None => 1,
        };
        let uid = prev.and_then(Resource::uid).map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let created = prev
            .and_then(|p| p.as_map().get("metadata").and_then(|m| m.get("creationTimestamp")).cloned())
            .unwrap_or_else(|| Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
        let meta = res.as_map_mut().entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if let Json::Object(meta) = meta {
            meta.insert("uid".into(), Json::String(uid));
            meta.insert("resourceVersion".into(), Json::String(self.rv.to_string()));
            meta.insert("generation".into(), Json::from(generation));
            meta.insert("creationTimestamp".into(), created);
        }
        self.objects.insert(UniqueResourceKey::new(&res), res.clone());
        res
    }
}

fn spec_of(res: &Resource) -> Map<String, Json> {
    let mut m = res.as_map().clone();
    m.remove("metadata");
    m.remove("status");
    m
}

pub type Hook = Box<dyn FnMut(Verb, Option<&UniqueResourceKey>, &mut Store) + Send>;

#[derive(Default)]
struct State {
    store: Store,
    failures: Vec<(Verb, String, Error)>,
    calls: Vec<String>,
    hooks: Vec<Hook>,
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryGateway {
    pub fn new() -> Self { Self::default() }

    /// Every call sleeps for `latency` before touching the store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Seeds an object as-is, filling in server bookkeeping.
    pub fn insert(&self, res: Resource) -> Resource {
        let mut st = self.state();
        let prev = st.store.get(&UniqueResourceKey::new(&res)).cloned();
        st.store.put(res, prev.as_ref())
    }

    /// Current stored copy, bypassing the call log and hooks.
    pub fn stored(&self, res: &Resource) -> Option<Resource> { self.state().store.get(&UniqueResourceKey::new(res)).cloned() }

    pub fn mutate(&self, res: &Resource, f: impl FnOnce(&mut Resource)) -> bool { self.state().store.mutate(&UniqueResourceKey::new(res), f) }

    pub fn set_status(&self, res: &Resource, status: Json) -> bool {
        self.mutate(res, |r| {
            r.as_map_mut().insert("status".into(), status);
        })
    }

    /// The next `verb` call on an object named `name` fails with `err`.
    pub fn fail_next(&self, verb: Verb, name: &str, err: Error) { self.state().failures.push((verb, name.to_string(), err)); }

    /// Runs before every call with the store unlocked for edits.
    pub fn on_call(&self, hook: impl FnMut(Verb, Option<&UniqueResourceKey>, &mut Store) + Send + 'static) {
        self.state().hooks.push(Box::new(hook));
    }

    /// `"<verb> <kind>/<name>"` for every call, in order.
    pub fn calls(&self) -> Vec<String> { self.state().calls.clone() }

    pub fn count(&self, verb: Verb) -> usize {
        let prefix = format!("{} ", verb);
        self.state().calls.iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn len(&self) -> usize { self.state().store.objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    async fn begin(&self, verb: Verb, res: Option<&Resource>, label: String) -> Result<MutexGuard<'_, State>> {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state();
        st.calls.push(format!("{} {}", verb, label));
        let key = res.map(UniqueResourceKey::new);
        let State { hooks, store, .. } = &mut *st;
        for hook in hooks.iter_mut() {
            hook(verb, key.as_ref(), store);
        }
        if let Some(res) = res {
            if let Some(pos) = st.failures.iter().position(|(v, n, _)| *v == verb && n == res.name()) {
                let (_, _, err) = st.failures.remove(pos);
                return Err(err);
            }
        }
        Ok(st)
    }
}

fn label(res: &Resource) -> String { format!("{}/{}", res.kind().to_lowercase(), res.name()) }

fn not_found(res: &Resource) -> Error {
    Error::NotFound(ApiFailure::new(404, "NotFound", format!("{} \"{}\" not found", res.kind().to_lowercase(), res.name())))
}

fn conflict(res: &Resource, why: &str) -> Error {
    Error::Conflict(ApiFailure::new(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {} \"{}\": {}", res.kind().to_lowercase(), res.name(), why),
    ))
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn create(&self, res: &Resource) -> Result<Resource> {
        let mut st = self.begin(Verb::Create, Some(res), label(res)).await?;
        let key = UniqueResourceKey::new(res);
        if st.store.get(&key).is_some() {
            return Err(Error::AlreadyExists(ApiFailure::new(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", res.kind().to_lowercase(), res.name()),
            )));
        }
        let mut fresh = res.clone();
        fresh.strip_server_fields();
        Ok(st.store.put(fresh, None))
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        let mut st = self.begin(Verb::Update, Some(res), label(res)).await?;
        let prev = st.store.get(&UniqueResourceKey::new(res)).cloned().ok_or_else(|| not_found(res))?;
        if let Some(rv) = res.resource_version() {
            if Some(rv) != prev.resource_version() {
                return Err(conflict(res, "the object has been modified; please apply your changes to the latest version and try again"));
            }
        }
        let mut next = res.clone();
        match prev.status() {
            Some(s) => {
                next.as_map_mut().insert("status".into(), s.clone());
            }
            None => {
                next.as_map_mut().remove("status");
            }
        }
        Ok(st.store.put(next, Some(&prev)))
    }

    async fn patch(&self, res: &Resource, _patch_type: PatchType, data: &[u8]) -> Result<Resource> {
        let mut st = self.begin(Verb::Patch, Some(res), label(res)).await?;
        let prev = st.store.get(&UniqueResourceKey::new(res)).cloned().ok_or_else(|| not_found(res))?;
        let patch: Json = serde_json::from_slice(data)?;
        let mut merged = prev.to_value();
        merge_patch(&mut merged, &patch);
        let next = Resource::from_value(merged)?;
        Ok(st.store.put(next, Some(&prev)))
    }

    async fn delete(&self, res: &Resource) -> Result<()> {
        let mut st = self.begin(Verb::Delete, Some(res), label(res)).await?;
        let key = UniqueResourceKey::new(res);
        let prev = st.store.get(&key).cloned().ok_or_else(|| not_found(res))?;
        if let Some(uid) = res.uid() {
            if prev.uid() != Some(uid) {
                return Err(conflict(res, "Precondition failed: UID in precondition does not match"));
            }
        }
        if prev.finalizers().is_empty() {
            st.store.remove(&key);
        } else if !prev.is_being_deleted() {
            st.store.mutate(&key, |r| {
                r.as_map_mut()["metadata"]["deletionTimestamp"] = Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
            });
        }
        Ok(())
    }

    async fn get(&self, res: &Resource) -> Result<Resource> {
        let st = self.begin(Verb::Get, Some(res), label(res)).await?;
        st.store.get(&UniqueResourceKey::new(res)).cloned().ok_or_else(|| not_found(res))
    }

    async fn exists(&self, res: &Resource) -> Result<bool> {
        let st = self.begin(Verb::Exists, Some(res), label(res)).await?;
        Ok(st.store.get(&UniqueResourceKey::new(res)).is_some())
    }

    async fn list(&self, selector: &str, opts: &ListOpts) -> Result<Vec<Resource>> {
        let sel = LabelSelector::parse(selector)?;
        let st = self.begin(Verb::List, None, selector.to_string()).await?;
        Ok(st
            .store
            .objects
            .values()
            .filter(|r| opts.wants(r.api_group(), r.kind()))
            .filter(|r| r.namespace().is_empty() || opts.namespaces.is_empty() || opts.namespaces.iter().any(|ns| ns == r.namespace()))
            .filter(|r| sel.matches(&r.labels()))
            .cloned()
            .collect())
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in patch {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

/// Equality-based label selector: `k=v`, `k==v`, `k!=v`, `k`, `!k`, comma separated.
#[derive(Debug, Clone, Default)]
pub struct LabelSelector(Vec<Requirement>);

impl LabelSelector {
    pub fn parse(s: &str) -> Result<Self> {
        let mut reqs = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().into(), v.trim().into())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().into(), v.trim().into())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().into())
            } else if term.contains(|c: char| c.is_whitespace() || c == '(') {
                return Err(Error::Validation(format!("unsupported label selector term '{}'", term)));
            } else {
                Requirement::Exists(term.into())
            };
            reqs.push(req);
        }
        Ok(Self(reqs))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, data: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": "a", "tier": "web"}},
            "data": {"k": data}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn bookkeeping_and_optimistic_concurrency() {
        let gw = MemoryGateway::new();
        let created = gw.create(&cm("c", "1")).await.unwrap();
        assert_eq!(created.generation(), 1);
        assert!(created.uid().is_some());

        let mut stale = created.clone();
        stale.as_map_mut()["data"]["k"] = json!("2");
        let updated = gw.update(&stale).await.unwrap();
        assert_eq!(updated.generation(), 2);
        assert_eq!(updated.uid(), created.uid());
        assert_ne!(updated.resource_version(), created.resource_version());

        let err = gw.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let relabeled = gw.patch(&created, PatchType::Merge, br#"{"metadata":{"labels":{"tier":null}}}"#).await.unwrap();
        assert_eq!(relabeled.generation(), 2);
        assert!(relabeled.label("tier").is_none());

        assert!(gw.create(&cm("c", "1")).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn delete_honours_uid_and_finalizers() {
        let gw = MemoryGateway::new();
        let created = gw.create(&cm("c", "1")).await.unwrap();
        let mut other = created.clone();
        other.as_map_mut()["metadata"]["uid"] = json!("someone-else");
        assert!(gw.delete(&other).await.unwrap_err().is_conflict());

        gw.mutate(&created, |r| r.as_map_mut()["metadata"]["finalizers"] = json!(["keep"]));
        gw.delete(&created).await.unwrap();
        assert!(gw.stored(&created).unwrap().is_being_deleted());
        assert!(gw.exists(&created).await.unwrap());

        gw.mutate(&created, |r| {
            r.as_map_mut()["metadata"].as_object_mut().unwrap().remove("finalizers");
        });
        gw.delete(&created).await.unwrap();
        assert!(!gw.exists(&created).await.unwrap());
        assert!(gw.delete(&created).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn scripted_failures_hooks_and_call_log() {
        let gw = MemoryGateway::new();
        gw.create(&cm("c", "1")).await.unwrap();
        gw.fail_next(Verb::Get, "c", Error::Transport("reset".into()));
        gw.on_call(|verb, key, store| {
            if verb == Verb::Exists {
                if let Some(key) = key {
                    store.remove(key);
                }
            }
        });
        assert!(gw.get(&cm("c", "1")).await.unwrap_err().is_retryable());
        assert_eq!(gw.get(&cm("c", "1")).await.unwrap().name(), "c");
        assert!(!gw.exists(&cm("c", "1")).await.unwrap());
        assert_eq!(gw.calls(), vec!["create configmap/c", "get configmap/c", "get configmap/c", "exists configmap/c"]);
        assert_eq!(gw.count(Verb::Get), 2);
    }

    #[tokio::test]
    async fn lists_by_selector() {
        let gw = MemoryGateway::new();
        gw.create(&cm("a", "1")).await.unwrap();
        let mut b = cm("b", "1");
        b.set_label("tier", "db");
        gw.create(&b).await.unwrap();

        let names = |v: Vec<Resource>| v.iter().map(|r| r.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(gw.list("app=a,tier!=db", &ListOpts::default()).await.unwrap()), vec!["a"]);
        assert_eq!(names(gw.list("tier", &ListOpts::default()).await.unwrap()), vec!["a", "b"]);
        assert!(gw.list("app=a", &ListOpts::default().in_namespace("other")).await.unwrap().is_empty());
        let only_secrets = ListOpts::default().with_group_kinds(vec![keel_core::GroupKind::new("", "Secret")]);
        assert!(gw.list("app=a", &only_secrets).await.unwrap().is_empty());
        assert!(gw.list("tier in (db)", &ListOpts::default()).await.is_err());
    }
}
