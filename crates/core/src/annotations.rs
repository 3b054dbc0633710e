//! Annotation and label keys recognised or written by the engine.

use md5::{Digest, Md5};

use crate::resource::{Resource, UniqueResourceKey};

pub const PREFIX: &str = "keel.dev/";

pub const CREATE_STRATEGY: &str = "keel.dev/create-strategy";
pub const UPDATE_STRATEGY: &str = "keel.dev/update-strategy";
pub const DELETE_STRATEGY: &str = "keel.dev/delete-strategy";
pub const ORPHANED: &str = "keel.dev/orphaned";
pub const IDENTITY: &str = "keel.dev/identity";
pub const ASSOCIATION: &str = "keel.dev/association";
pub const APP_LABEL: &str = "keel.dev/app";

pub const CHANGE_GROUP: &str = "keel.dev/change-group";
pub const CHANGE_RULE: &str = "keel.dev/change-rule";
pub const DISABLE_DEFAULT_CHANGE_GROUP_AND_RULES: &str = "keel.dev/disable-default-change-group-and-rules";
pub const DISABLE_ASSOCIATED_RESOURCES_WAIT: &str = "keel.dev/disable-associated-resources-wait";
pub const DISABLE_WAIT: &str = "keel.dev/disable-wait";
pub const DISABLE_ORIGINAL: &str = "keel.dev/disable-original";
pub const DISABLE_LABEL_SCOPING: &str = "keel.dev/disable-label-scoping";
pub const EXISTS: &str = "keel.dev/exists";
pub const NOOP: &str = "keel.dev/noop";
pub const DEPLOYMENT_MIN_AVAILABLE: &str = "keel.dev/deployment-wait-minimum-replicas-available";

pub const VERSIONED: &str = "keel.dev/versioned";
pub const VERSIONED_KEEP_ORIGINAL: &str = "keel.dev/versioned-keep-original";
pub const VERSIONED_EXPLICIT_REF: &str = "keel.dev/versioned-explicit-ref";
pub const NUM_VERSIONS: &str = "keel.dev/num-versions";

pub const ORIGINAL: &str = "keel.dev/original";
pub const ORIGINAL_DIFF: &str = "keel.dev/original-diff";
pub const ORIGINAL_DIFF_MD5: &str = "keel.dev/original-diff-md5";
pub const ORIGINAL_DIFF_FULL: &str = "keel.dev/original-diff-full";

pub const CREATE_STRATEGY_FALLBACK_ON_UPDATE: &str = "fallback-on-update";
pub const UPDATE_STRATEGY_FALLBACK_ON_REPLACE: &str = "fallback-on-replace";
pub const UPDATE_STRATEGY_ALWAYS_REPLACE: &str = "always-replace";
pub const DELETE_STRATEGY_ORPHAN: &str = "orphan";

/// Annotation values that match `key` exactly or `key.<suffix>`, sorted by key.
pub fn suffixed_values(res: &Resource, key: &str) -> Vec<(String, String)> {
    let dotted = format!("{}.", key);
    res.annotations().into_iter().filter(|(k, _)| k == key || k.starts_with(&dotted)).collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut h = Md5::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// `v1;<ns/group/kind/name>;<apiVersion>` stamped on every created resource.
pub struct IdentityAnnotation;

impl IdentityAnnotation {
    const VERSION: &'static str = "v1";

    pub fn value_for(res: &Resource) -> String {
        format!("{};{};{}", Self::VERSION, UniqueResourceKey::new(res), res.api_version())
    }

    pub fn add(res: &mut Resource) {
        let v = Self::value_for(res);
        res.set_annotation(IDENTITY, &v);
    }

    pub fn remove(res: &mut Resource) { res.remove_annotation(IDENTITY); }

    /// True when the annotation decodes to the resource's own key and apiVersion.
    pub fn valid(res: &Resource) -> bool {
        let Some(v) = res.annotation(IDENTITY) else { return false };
        let mut parts = v.splitn(3, ';');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ver), Some(key), Some(api_version)) => {
                ver == Self::VERSION && key == UniqueResourceKey::new(res).to_string() && api_version == res.api_version()
            }
            _ => false,
        }
    }
}

/// `v1.<md5(key)>` label linking a resource with the objects its controller creates.
pub struct AssociationLabel;

impl AssociationLabel {
    pub fn value_for(key: &UniqueResourceKey) -> String { format!("v1.{}", md5_hex(key.to_string().as_bytes())) }

    pub fn value(res: &Resource) -> String { Self::value_for(&UniqueResourceKey::new(res)) }

    pub fn selector(res: &Resource) -> String { format!("{}={}", ASSOCIATION, Self::value(res)) }
}
