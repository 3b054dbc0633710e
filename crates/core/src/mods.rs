//! Structural edits over resource trees addressed by [`Path`].
//!
//! Every mod carries a matcher and is a no-op for resources it does not match.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::matcher::ResourceMatcher;
use crate::path::{Path, PathPart};
use crate::resource::{json_type_name, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModSource {
    New,
    Existing,
}

/// Read-only resources a mod may copy values from.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModSources<'a> {
    pub new: Option<&'a Resource>,
    pub existing: Option<&'a Resource>,
}

impl<'a> ModSources<'a> {
    pub fn new(new: Option<&'a Resource>, existing: Option<&'a Resource>) -> Self { Self { new, existing } }

    pub fn get(&self, src: ModSource) -> Option<&'a Resource> {
        match src {
            ModSource::New => self.new,
            ModSource::Existing => self.existing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceMod {
    FieldCopy(FieldCopyMod),
    FieldRemove(FieldRemoveMod),
    StringMapAppend(StringMapAppendMod),
}

impl ResourceMod {
    pub fn apply(&self, res: &mut Resource, srcs: &ModSources<'_>) -> Result<()> {
        match self {
            ResourceMod::FieldCopy(m) => m.apply(res, srcs),
            ResourceMod::FieldRemove(m) => m.apply(res),
            ResourceMod::StringMapAppend(m) => m.apply(res),
        }
    }
}

fn mismatch(full: &[PathPart], expected: &'static str, found: &Json) -> Error {
    Error::PathTypeMismatch { path: Path(full.to_vec()).to_string(), expected, found: json_type_name(found) }
}

fn in_resource(e: Error, what: &str, path: &Path, desc: &str) -> Error {
    match e {
        Error::PathTypeMismatch { path: at, expected, found } => Error::PathTypeMismatch {
            path: format!("{} ({} for path '{}' on {})", at, what, path, desc),
            expected,
            found,
        },
        Error::Validation(msg) => Error::Validation(format!("{} for path '{}' on {}: {}", what, path, desc, msg)),
        other => other,
    }
}

fn last_part_error() -> Error { Error::Validation("expected last part of the path to be a map key".into()) }

fn is_present(v: Option<&Json>) -> bool { matches!(v, Some(v) if !v.is_null()) }

/// Copies the value at `path` from the first source holding one.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCopyMod {
    pub matcher: ResourceMatcher,
    pub path: Path,
    pub sources: Vec<ModSource>,
}

impl FieldCopyMod {
    pub fn apply(&self, res: &mut Resource, srcs: &ModSources<'_>) -> Result<()> {
        if !self.matcher.matches(res) || self.path.is_empty() {
            return Ok(());
        }
        let desc = res.description();
        for src in &self.sources {
            let Some(source) = srcs.get(*src) else { continue };
            let src_obj = Json::Object(source.as_map().clone());
            let mut target = Json::Object(std::mem::take(res.as_map_mut()));
            let out = self.copy(&mut target, &src_obj, self.path.parts(), &mut Vec::new(), srcs);
            if let Json::Object(m) = target {
                *res.as_map_mut() = m;
            }
            out.map_err(|e| in_resource(e, "FieldCopyMod", &self.path, &desc))?;
        }
        Ok(())
    }

    fn copy(&self, target: &mut Json, src: &Json, parts: &[PathPart], full: &mut Vec<PathPart>, srcs: &ModSources<'_>) -> Result<bool> {
        let Some((part, rest)) = parts.split_first() else { return Ok(false) };
        match part {
            PathPart::MapKey(k) => {
                full.push(part.clone());
                let out = self.copy_map_key(target, src, k, rest, full, srcs);
                full.pop();
                out
            }
            PathPart::Regex(re) => {
                if !src.is_object() {
                    return Err(mismatch(full, "map", src));
                }
                let keys: Vec<String> = src.as_object().map(|m| m.keys().filter(|k| re.is_match(k)).cloned().collect()).unwrap_or_default();
                let mut any = false;
                for k in keys {
                    full.push(PathPart::MapKey(k.clone()));
                    let out = self.copy_map_key(target, src, &k, rest, full, srcs);
                    full.pop();
                    any |= out?;
                }
                Ok(any)
            }
            PathPart::AllIndexes | PathPart::Index(_) => {
                if rest.is_empty() {
                    return Err(last_part_error());
                }
                let src_arr = src.as_array().ok_or_else(|| mismatch(full, "array", src))?;
                let found = json_type_name(target);
                let Json::Array(arr) = target else {
                    return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "array", found });
                };
                let idxs: Vec<usize> = match part {
                    PathPart::Index(i) => vec![*i],
                    _ => (0..arr.len()).collect(),
                };
                let mut any = false;
                for i in idxs {
                    // Targets with fewer elements than the source are left alone.
                    let (Some(t), Some(s)) = (arr.get_mut(i), src_arr.get(i)) else { continue };
                    full.push(PathPart::Index(i));
                    let out = self.copy(t, s, rest, full, srcs);
                    full.pop();
                    any |= out?;
                }
                Ok(any)
            }
        }
    }

    /// `full` already ends with `key`.
    fn copy_map_key(&self, target: &mut Json, src: &Json, key: &str, rest: &[PathPart], full: &mut Vec<PathPart>, srcs: &ModSources<'_>) -> Result<bool> {
        let parent = &full[..full.len() - 1];
        let src_map = src.as_object().ok_or_else(|| mismatch(parent, "map", src))?;
        let found = json_type_name(target);
        let Json::Object(target_map) = target else {
            return Err(Error::PathTypeMismatch { path: Path(parent.to_vec()).to_string(), expected: "map", found });
        };
        if rest.is_empty() {
            return self.copy_into_map(target_map, key, full, srcs);
        }
        let Some(src_next) = src_map.get(key).filter(|v| !v.is_null()) else { return Ok(false) };
        if !is_present(target_map.get(key)) {
            if Path(rest.to_vec()).contains_array_parts() {
                return Ok(false);
            }
            target_map.insert(key.to_string(), Json::Object(Map::new()));
        }
        let Some(target_next) = target_map.get_mut(key) else { return Ok(false) };
        self.copy(target_next, src_next, rest, full, srcs)
    }

    fn copy_into_map(&self, target: &mut Map<String, Json>, key: &str, full: &[PathPart], srcs: &ModSources<'_>) -> Result<bool> {
        for src in &self.sources {
            let Some(source) = srcs.get(*src) else { continue };
            if let Some(val) = obtain_value(source.as_map(), full)? {
                target.insert(key.to_string(), val.clone());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Value at a concrete path (map keys and indexes only).
fn obtain_value<'a>(root: &'a Map<String, Json>, full: &[PathPart]) -> Result<Option<&'a Json>> {
    let Some((PathPart::MapKey(first), rest)) = full.split_first() else { return Ok(None) };
    let Some(mut cur) = root.get(first) else { return Ok(None) };
    for (i, part) in rest.iter().enumerate() {
        let next = match (part, cur) {
            (PathPart::MapKey(k), Json::Object(m)) => m.get(k),
            (PathPart::Index(idx), Json::Array(a)) => a.get(*idx),
            (_, Json::Null) => None,
            (PathPart::MapKey(_), other) => return Err(mismatch(&full[..=i], "map", other)),
            (PathPart::Index(_), other) => return Err(mismatch(&full[..=i], "array", other)),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

/// Deletes the leaf at `path`; missing intermediates are fine.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRemoveMod {
    pub matcher: ResourceMatcher,
    pub path: Path,
}

impl FieldRemoveMod {
    pub fn apply(&self, res: &mut Resource) -> Result<()> {
        if !self.matcher.matches(res) || self.path.is_empty() {
            return Ok(());
        }
        let desc = res.description();
        let mut target = Json::Object(std::mem::take(res.as_map_mut()));
        let out = remove(&mut target, self.path.parts(), &mut Vec::new());
        if let Json::Object(m) = target {
            *res.as_map_mut() = m;
        }
        out.map_err(|e| in_resource(e, "FieldRemoveMod", &self.path, &desc))
    }
}

fn remove(obj: &mut Json, parts: &[PathPart], full: &mut Vec<PathPart>) -> Result<()> {
    let Some((part, rest)) = parts.split_first() else { return Ok(()) };
    if obj.is_null() {
        return Ok(());
    }
    match part {
        PathPart::MapKey(k) => {
            let found = json_type_name(obj);
            let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
            if rest.is_empty() {
                m.remove(k);
                return Ok(());
            }
            let Some(next) = m.get_mut(k) else { return Ok(()) };
            full.push(part.clone());
            let out = remove(next, rest, full);
            full.pop();
            out
        }
        PathPart::Regex(re) => {
            let found = json_type_name(obj);
            let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
            let keys: Vec<String> = m.keys().filter(|k| re.is_match(k)).cloned().collect();
            for k in keys {
                if rest.is_empty() {
                    m.remove(&k);
                } else if let Some(next) = m.get_mut(&k) {
                    full.push(PathPart::MapKey(k.clone()));
                    let out = remove(next, rest, full);
                    full.pop();
                    out?;
                }
            }
            Ok(())
        }
        PathPart::AllIndexes | PathPart::Index(_) => {
            if rest.is_empty() {
                return Err(last_part_error());
            }
            let found = json_type_name(obj);
            let Json::Array(arr) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "array", found }) };
            let idxs: Vec<usize> = match part {
                PathPart::Index(i) => vec![*i],
                _ => (0..arr.len()).collect(),
            };
            for i in idxs {
                let Some(el) = arr.get_mut(i) else { continue };
                full.push(PathPart::Index(i));
                let out = remove(el, rest, full);
                full.pop();
                out?;
            }
            Ok(())
        }
    }
}

/// Inserts string pairs into the map at `path`, creating intermediate maps
/// only when the remaining path has no array parts.
#[derive(Debug, Clone, PartialEq)]
pub struct StringMapAppendMod {
    pub matcher: ResourceMatcher,
    pub path: Path,
    pub kvs: BTreeMap<String, String>,
    pub skip_if_not_found: bool,
}

impl StringMapAppendMod {
    pub fn apply(&self, res: &mut Resource) -> Result<()> {
        if !self.matcher.matches(res) {
            return Ok(());
        }
        let desc = res.description();
        let mut target = Json::Object(std::mem::take(res.as_map_mut()));
        let out = self.append(&mut target, self.path.parts(), &mut Vec::new());
        if let Json::Object(m) = target {
            *res.as_map_mut() = m;
        }
        out.map_err(|e| in_resource(e, "StringMapAppendMod", &self.path, &desc))
    }

    fn append(&self, obj: &mut Json, parts: &[PathPart], full: &mut Vec<PathPart>) -> Result<()> {
        let Some((part, rest)) = parts.split_first() else {
            let found = json_type_name(obj);
            let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
            for (k, v) in &self.kvs {
                m.insert(k.clone(), Json::String(v.clone()));
            }
            return Ok(());
        };
        match part {
            PathPart::MapKey(k) => {
                let found = json_type_name(obj);
                let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
                if !is_present(m.get(k)) {
                    if self.skip_if_not_found || Path(rest.to_vec()).contains_array_parts() {
                        return Ok(());
                    }
                    m.insert(k.clone(), Json::Object(Map::new()));
                }
                let Some(next) = m.get_mut(k) else { return Ok(()) };
                full.push(part.clone());
                let out = self.append(next, rest, full);
                full.pop();
                out
            }
            PathPart::Regex(re) => {
                let found = json_type_name(obj);
                let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
                let keys: Vec<String> = m.keys().filter(|k| re.is_match(k)).cloned().collect();
                for k in keys {
                    let Some(next) = m.get_mut(&k).filter(|v| !v.is_null()) else { continue };
                    full.push(PathPart::MapKey(k.clone()));
                    let out = self.append(next, rest, full);
                    full.pop();
                    out?;
                }
                Ok(())
            }
            PathPart::AllIndexes | PathPart::Index(_) => {
                if obj.is_null() {
                    return Ok(());
                }
                let found = json_type_name(obj);
                let Json::Array(arr) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "array", found }) };
                let idxs: Vec<usize> = match part {
                    PathPart::Index(i) => vec![*i],
                    _ => (0..arr.len()).collect(),
                };
                for i in idxs {
                    let Some(el) = arr.get_mut(i) else { continue };
                    full.push(PathPart::Index(i));
                    let out = self.append(el, rest, full);
                    full.pop();
                    out?;
                }
                Ok(())
            }
        }
    }
}

/// Descends to each map at `path` and hands it to a rewrite callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRefSetMod {
    pub matcher: ResourceMatcher,
    pub path: Path,
}

impl ObjectRefSetMod {
    pub fn apply<F>(&self, res: &mut Resource, mut replace: F) -> Result<()>
    where
        F: FnMut(&mut Map<String, Json>) -> Result<()>,
    {
        if !self.matcher.matches(res) {
            return Ok(());
        }
        let desc = res.description();
        let mut target = Json::Object(std::mem::take(res.as_map_mut()));
        let out = descend(&mut target, self.path.parts(), &mut Vec::new(), &mut replace);
        if let Json::Object(m) = target {
            *res.as_map_mut() = m;
        }
        out.map_err(|e| in_resource(e, "ObjectRefSetMod", &self.path, &desc))
    }
}

fn descend<F>(obj: &mut Json, parts: &[PathPart], full: &mut Vec<PathPart>, replace: &mut F) -> Result<()>
where
    F: FnMut(&mut Map<String, Json>) -> Result<()>,
{
    if obj.is_null() {
        return Ok(());
    }
    let found = json_type_name(obj);
    let Some((part, rest)) = parts.split_first() else {
        let Json::Object(m) = obj else { return Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }) };
        return replace(m);
    };
    match (part, obj) {
        (PathPart::MapKey(k), Json::Object(m)) => {
            let Some(next) = m.get_mut(k) else { return Ok(()) };
            full.push(part.clone());
            let out = descend(next, rest, full, replace);
            full.pop();
            out
        }
        (PathPart::Regex(re), Json::Object(m)) => {
            let keys: Vec<String> = m.keys().filter(|k| re.is_match(k)).cloned().collect();
            for k in keys {
                let Some(next) = m.get_mut(&k) else { continue };
                full.push(PathPart::MapKey(k.clone()));
                let out = descend(next, rest, full, replace);
                full.pop();
                out?;
            }
            Ok(())
        }
        (PathPart::Index(_) | PathPart::AllIndexes, Json::Array(arr)) => {
            let idxs: Vec<usize> = match part {
                PathPart::Index(i) => vec![*i],
                _ => (0..arr.len()).collect(),
            };
            for i in idxs {
                let Some(el) = arr.get_mut(i) else { continue };
                full.push(PathPart::Index(i));
                let out = descend(el, rest, full, replace);
                full.pop();
                out?;
            }
            Ok(())
        }
        (PathPart::MapKey(_) | PathPart::Regex(_), _) => Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "map", found }),
        (_, _) => Err(Error::PathTypeMismatch { path: Path(full.clone()).to_string(), expected: "array", found }),
    }
}
