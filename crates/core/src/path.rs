//! Path language over untyped resource trees.
//!
//! Parts are map keys, a specific array index, an all-indexes wildcard, or a
//! regex over the keys of the current map. In config documents a part is a
//! plain string or one of `{index: N}`, `{allIndexes: true}`, `{regex: "..."}`.

use std::fmt;

use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KeyRegex {
    src: String,
    re: Regex,
}

impl KeyRegex {
    pub fn new(src: &str) -> Result<Self> {
        Ok(Self { src: src.to_string(), re: Regex::new(src)? })
    }
    pub fn is_match(&self, key: &str) -> bool { self.re.is_match(key) }
    pub fn as_str(&self) -> &str { &self.src }
}

impl PartialEq for KeyRegex {
    fn eq(&self, other: &Self) -> bool { self.src == other.src }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathPart {
    MapKey(String),
    Index(usize),
    AllIndexes,
    Regex(KeyRegex),
}

impl PathPart {
    pub fn is_map_key(&self) -> bool { matches!(self, PathPart::MapKey(_)) }
    pub fn is_array(&self) -> bool { matches!(self, PathPart::Index(_) | PathPart::AllIndexes) }
}

impl fmt::Display for PathPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPart::MapKey(k) => write!(f, "{}", k),
            PathPart::Index(i) => write!(f, "{}", i),
            PathPart::AllIndexes => write!(f, "(all)"),
            PathPart::Regex(r) => write!(f, "(regex:{})", r.as_str()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPart {
    Key(String),
    Index { index: usize },
    All {
        #[serde(rename = "allIndexes")]
        all_indexes: bool,
    },
    Regex { regex: String },
}

impl<'de> Deserialize<'de> for PathPart {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match RawPart::deserialize(d)? {
            RawPart::Key(k) => Ok(PathPart::MapKey(k)),
            RawPart::Index { index } => Ok(PathPart::Index(index)),
            RawPart::All { all_indexes: true } => Ok(PathPart::AllIndexes),
            RawPart::All { all_indexes: false } => Err(de::Error::custom("allIndexes must be true when specified")),
            RawPart::Regex { regex } => KeyRegex::new(&regex).map(PathPart::Regex).map_err(de::Error::custom),
        }
    }
}

impl Serialize for PathPart {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            PathPart::MapKey(k) => s.serialize_str(k),
            PathPart::Index(i) => {
                let mut m = s.serialize_map(Some(1))?;
                m.serialize_entry("index", i)?;
                m.end()
            }
            PathPart::AllIndexes => {
                let mut m = s.serialize_map(Some(1))?;
                m.serialize_entry("allIndexes", &true)?;
                m.end()
            }
            PathPart::Regex(r) => {
                let mut m = s.serialize_map(Some(1))?;
                m.serialize_entry("regex", r.as_str())?;
                m.end()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathPart>);

impl Path {
    pub fn new(parts: Vec<PathPart>) -> Self { Self(parts) }

    /// Path made only of map keys.
    pub fn from_strs(keys: &[&str]) -> Self {
        Self(keys.iter().map(|k| PathPart::MapKey((*k).to_string())).collect())
    }

    pub fn parts(&self) -> &[PathPart] { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn last(&self) -> Option<&PathPart> { self.0.last() }

    pub fn contains_non_map_keys(&self) -> bool { self.0.iter().any(|p| !p.is_map_key()) }
    pub fn contains_array_parts(&self) -> bool { self.0.iter().any(PathPart::is_array) }

    pub fn push(mut self, part: PathPart) -> Self {
        self.0.push(part);
        self
    }

    pub fn join(&self, other: &Path) -> Path {
        Path(self.0.iter().chain(other.0.iter()).cloned().collect())
    }

    /// Errors if the path has a part that cannot end a removal or append.
    pub fn require_map_leaf(&self) -> Result<()> {
        match self.last() {
            Some(PathPart::MapKey(_)) | Some(PathPart::Regex(_)) => Ok(()),
            _ => Err(Error::Validation(format!("expected last part of path '{}' to be a map key", self))),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("->"))
    }
}
