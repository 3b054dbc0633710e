//! Keel core types: untyped resources, identity keys, the path language and
//! structural mods, resource matchers, engine annotations and errors.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod error;
pub mod matcher;
pub mod mods;
pub mod path;
pub mod resource;

pub use error::{ApiFailure, Error, Result};
pub use matcher::ResourceMatcher;
pub use mods::{FieldCopyMod, FieldRemoveMod, ModSource, ModSources, ObjectRefSetMod, ResourceMod, StringMapAppendMod};
pub use path::{KeyRegex, Path, PathPart};
pub use resource::{decode_yaml, GroupKind, Resource, UniqueResourceKey};

pub mod prelude {
    pub use super::{Error, Resource, ResourceMatcher, Result, UniqueResourceKey};
}
