//! Untyped cluster resources and their identity keys.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};

/// An untyped cluster object. Cloning produces a deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    obj: Map<String, Json>,
    transient: bool,
    origin: Option<String>,
}

impl Resource {
    pub fn from_value(v: Json) -> Result<Self> {
        let obj = match v {
            Json::Object(m) => m,
            other => return Err(Error::Parse(format!("expected resource to be a map, found {}", type_name(&other)))),
        };
        let res = Self { obj, transient: false, origin: None };
        if res.api_version().is_empty() {
            return Err(Error::Parse("resource missing apiVersion".into()));
        }
        if res.kind().is_empty() {
            return Err(Error::Parse("resource missing kind".into()));
        }
        Ok(res)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Parses a multi-document YAML stream. Empty documents are skipped.
    pub fn from_yaml_multi(yaml: &str) -> Result<Vec<Self>> {
        use serde::Deserialize;
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let val = serde_yaml::Value::deserialize(doc)?;
            if val.is_null() {
                continue;
            }
            let json = serde_json::to_value(val)?;
            out.push(Self::from_value(json)?);
        }
        Ok(out)
    }

    pub fn as_map(&self) -> &Map<String, Json> { &self.obj }
    pub fn as_map_mut(&mut self) -> &mut Map<String, Json> { &mut self.obj }
    pub fn to_value(&self) -> Json { Json::Object(self.obj.clone()) }
    pub fn into_value(self) -> Json { Json::Object(self.obj) }

    /// Compact JSON with keys in canonical order.
    pub fn to_compact_json(&self) -> String { canonical_json(&Json::Object(self.obj.clone())) }

    pub fn to_yaml(&self) -> Result<String> { Ok(serde_yaml::to_string(&canonicalize(&self.to_value()))?) }

    /// Decodes the resource into a typed view.
    pub fn typed<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut cur = self.obj.get(path[0])?;
        for key in &path[1..] {
            cur = cur.as_object()?.get(*key)?;
        }
        cur.as_str()
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        let meta = self.obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        match meta {
            Json::Object(m) => m,
            _ => unreachable!("metadata replaced with map above"),
        }
    }

    pub fn api_version(&self) -> &str { self.str_at(&["apiVersion"]).unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at(&["kind"]).unwrap_or("") }

    /// Group portion of apiVersion; empty for the core group.
    pub fn api_group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        let av = self.api_version();
        av.split_once('/').map(|(_, v)| v).unwrap_or(av)
    }

    pub fn namespace(&self) -> &str { self.str_at(&["metadata", "namespace"]).unwrap_or("") }
    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]).unwrap_or("") }
    pub fn uid(&self) -> Option<&str> { self.str_at(&["metadata", "uid"]).filter(|s| !s.is_empty()) }
    pub fn resource_version(&self) -> Option<&str> { self.str_at(&["metadata", "resourceVersion"]) }

    pub fn generation(&self) -> i64 {
        self.obj.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(0)
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().insert("name".into(), Json::String(name.to_string()));
    }

    pub fn set_namespace(&mut self, ns: &str) {
        self.metadata_mut().insert("namespace".into(), Json::String(ns.to_string()));
    }

    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map("annotations") }
    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map("labels") }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn has_annotation(&self, key: &str) -> bool { self.annotation(key).is_some() }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.obj.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(Json::Object(m)) = self.obj.get("metadata").and_then(|m| m.get(field)) {
            for (k, v) in m {
                if let Some(s) = v.as_str() {
                    out.insert(k.clone(), s.to_string());
                }
            }
        }
        out
    }

    fn string_map_mut(&mut self, field: &str) -> &mut Map<String, Json> {
        let entry = self.metadata_mut().entry(field.to_string()).or_insert_with(|| Json::Object(Map::new()));
        if !entry.is_object() {
            *entry = Json::Object(Map::new());
        }
        match entry {
            Json::Object(m) => m,
            _ => unreachable!("replaced with map above"),
        }
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.string_map_mut("annotations").insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn remove_annotation(&mut self, key: &str) {
        let empty = {
            let Some(Json::Object(meta)) = self.obj.get_mut("metadata") else { return };
            let Some(Json::Object(anns)) = meta.get_mut("annotations") else { return };
            anns.remove(key);
            anns.is_empty()
        };
        if empty {
            if let Some(Json::Object(meta)) = self.obj.get_mut("metadata") {
                meta.remove("annotations");
            }
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.string_map_mut("labels").insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.obj
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(|f| f.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    pub fn owner_refs(&self) -> Vec<Json> {
        self.obj
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|o| o.as_array())
            .cloned()
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<&Json> { self.obj.get("status") }

    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.str_at(&["metadata", "creationTimestamp"])
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    pub fn is_being_deleted(&self) -> bool {
        matches!(self.obj.get("metadata").and_then(|m| m.get("deletionTimestamp")), Some(v) if !v.is_null())
    }

    /// True when the object was observed on the cluster but not created by this engine.
    pub fn transient(&self) -> bool { self.transient }
    pub fn mark_transient(&mut self, transient: bool) { self.transient = transient; }
    pub fn origin(&self) -> Option<&str> { self.origin.as_deref() }
    pub fn set_origin(&mut self, origin: impl Into<String>) { self.origin = Some(origin.into()); }

    /// Human description, e.g. `configmap/app-config (v1) namespace: app1`.
    pub fn description(&self) -> String {
        let scope = if self.namespace().is_empty() { "cluster".to_string() } else { format!("namespace: {}", self.namespace()) };
        format!("{}/{} ({}) {}", self.kind().to_lowercase(), self.name(), self.api_version(), scope)
    }

    /// Drops fields owned by the server so the object can be created anew.
    pub fn strip_server_fields(&mut self) {
        if let Some(Json::Object(meta)) = self.obj.get_mut("metadata") {
            for k in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "deletionTimestamp", "deletionGracePeriodSeconds", "selfLink"] {
                meta.remove(k);
            }
        }
        self.obj.remove("status");
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "map",
    }
}

pub(crate) fn json_type_name(v: &Json) -> String { type_name(v).to_string() }

/// Decodes a YAML document into `T` through its JSON form, so externally
/// tagged enums may be written as single-key maps (`- allMatcher: {}`).
pub fn decode_yaml<T: serde::de::DeserializeOwned>(yaml: &str) -> Result<T> {
    let val: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    Ok(serde_json::from_value(serde_json::to_value(val)?)?)
}

/// Recursively rebuilds maps with keys inserted in sorted order.
pub fn canonicalize(v: &Json) -> Json {
    match v {
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&m[k]));
            }
            Json::Object(out)
        }
        Json::Array(a) => Json::Array(a.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json(v: &Json) -> String {
    // Serializing a Value cannot fail: keys are strings and numbers are finite.
    serde_json::to_string(&canonicalize(v)).unwrap_or_default()
}

/// `(namespace, apiGroup, kind, name)`. API version is not part of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueResourceKey {
    pub namespace: String,
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

impl UniqueResourceKey {
    pub fn new(res: &Resource) -> Self {
        Self {
            namespace: res.namespace().to_string(),
            api_group: res.api_group().to_string(),
            kind: res.kind().to_string(),
            name: res.name().to_string(),
        }
    }

    /// Key with the name replaced, used to group versioned copies by base name.
    pub fn with_custom_name(res: &Resource, name: &str) -> Self {
        Self { name: name.to_string(), ..Self::new(res) }
    }
}

impl fmt::Display for UniqueResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.namespace, self.api_group, self.kind, self.name)
    }
}

/// API group plus kind, used to narrow list calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self { Self { group: group.to_string(), kind: kind.to_string() } }
    pub fn matches(&self, res: &Resource) -> bool { self.group == res.api_group() && self.kind == res.kind() }
}
