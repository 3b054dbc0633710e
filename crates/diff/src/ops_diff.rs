//! Minimal structural diff and its fingerprint.

use std::fmt;

use keel_core::annotations::md5_hex;
use keel_core::resource::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DiffOp {
    Test { path: String, value: Json },
    Set { path: String, value: Json },
    Remove { path: String },
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffOp::Test { path, value } => write!(f, "test {} {}", path, canonical_json(value)),
            DiffOp::Set { path, value } => write!(f, "set {} {}", path, canonical_json(value)),
            DiffOp::Remove { path } => write!(f, "remove {}", path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpsDiff(pub Vec<DiffOp>);

impl OpsDiff {
    /// Ops turning `left` into `right`; absent sides are null.
    pub fn new(left: Option<&Json>, right: Option<&Json>) -> Self {
        let mut ops = Vec::new();
        match (left, right) {
            (None, None) => {}
            (None, Some(r)) => ops.push(DiffOp::Set { path: String::new(), value: r.clone() }),
            (Some(_), None) => ops.push(DiffOp::Remove { path: String::new() }),
            (Some(l), Some(r)) => walk(l, r, &mut String::new(), &mut ops),
        }
        Self(ops)
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn ops(&self) -> &[DiffOp] { &self.0 }

    /// md5 of the canonical serialization; independent of map key order.
    pub fn fingerprint(&self) -> String {
        let v = serde_json::to_value(&self.0).unwrap_or(Json::Null);
        md5_hex(canonical_json(&v).as_bytes())
    }

    pub fn minimal_string(&self) -> String {
        self.0.iter().map(|op| op.to_string()).collect::<Vec<_>>().join("\n")
    }
}

fn escape(key: &str) -> String { key.replace('~', "~0").replace('/', "~1") }

fn walk(l: &Json, r: &Json, path: &mut String, ops: &mut Vec<DiffOp>) {
    match (l, r) {
        (Json::Object(lm), Json::Object(rm)) => {
            let mut keys: Vec<&String> = lm.keys().chain(rm.keys().filter(|k| !lm.contains_key(*k))).collect();
            keys.sort();
            for k in keys {
                let len = path.len();
                path.push('/');
                path.push_str(&escape(k));
                match (lm.get(k), rm.get(k)) {
                    (Some(lv), Some(rv)) => walk(lv, rv, path, ops),
                    (Some(_), None) => ops.push(DiffOp::Remove { path: path.clone() }),
                    (None, Some(rv)) => ops.push(DiffOp::Set { path: path.clone(), value: rv.clone() }),
                    (None, None) => {}
                }
                path.truncate(len);
            }
        }
        (Json::Array(la), Json::Array(ra)) if la.len() == ra.len() => {
            for (i, (lv, rv)) in la.iter().zip(ra.iter()).enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&i.to_string());
                walk(lv, rv, path, ops);
                path.truncate(len);
            }
        }
        (Json::Array(_), Json::Array(_)) => {
            ops.push(DiffOp::Test { path: path.clone(), value: l.clone() });
            ops.push(DiffOp::Set { path: path.clone(), value: r.clone() });
        }
        _ if l != r => ops.push(DiffOp::Set { path: path.clone(), value: r.clone() }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_ops() {
        let l = json!({"a": 1, "b": {"c": [1, 2]}, "d": [1], "e/f": "x", "gone": true});
        let r = json!({"a": 2, "b": {"c": [1, 3]}, "d": [1, 2], "e/f": "x", "new": null});
        let d = OpsDiff::new(Some(&l), Some(&r));
        assert_eq!(
            d.ops(),
            &[
                DiffOp::Set { path: "/a".into(), value: json!(2) },
                DiffOp::Set { path: "/b/c/1".into(), value: json!(3) },
                DiffOp::Test { path: "/d".into(), value: json!([1]) },
                DiffOp::Set { path: "/d".into(), value: json!([1, 2]) },
                DiffOp::Remove { path: "/gone".into() },
                DiffOp::Set { path: "/new".into(), value: Json::Null },
            ]
        );
        assert!(OpsDiff::new(Some(&l), Some(&l)).is_empty());
    }

    #[test]
    fn fingerprint_ignores_serialization_order() {
        let a: Json = serde_json::from_str(r#"{"spec": {"x": 1, "y": {"p": 1, "q": 2}}}"#).unwrap();
        let b1: Json = serde_json::from_str(r#"{"spec": {"x": 2, "y": {"p": 1, "q": 3}}}"#).unwrap();
        let b2: Json = serde_json::from_str(r#"{"spec": {"y": {"q": 3, "p": 1}, "x": 2}}"#).unwrap();
        let d1 = OpsDiff::new(Some(&a), Some(&b1));
        let d2 = OpsDiff::new(Some(&a), Some(&b2));
        assert_eq!(d1.fingerprint(), d2.fingerprint());
        assert_eq!(d1.fingerprint().len(), 32);

        let set_value: Json = serde_json::from_str(r#"[{"op":"set","path":"/a","value":{"k":1,"j":2}}]"#).unwrap();
        let reordered: Json = serde_json::from_str(r#"[{"value":{"j":2,"k":1},"path":"/a","op":"set"}]"#).unwrap();
        let o1: OpsDiff = serde_json::from_value(set_value).unwrap();
        let o2: OpsDiff = serde_json::from_value(reordered).unwrap();
        assert_eq!(o1.fingerprint(), o2.fingerprint());
    }
}
