//! Last-applied bookkeeping stored in annotations on live resources.

use keel_core::annotations::{DISABLE_ORIGINAL, ORIGINAL, ORIGINAL_DIFF, ORIGINAL_DIFF_FULL, ORIGINAL_DIFF_MD5};
use keel_core::{Resource, Result};
use tracing::{debug, warn};

use crate::change::{Change, ChangeFactory};

/// Annotation values larger than this are not recorded.
pub const MAX_ANNOTATION_VALUE_LEN: usize = 262_144;

const HISTORY_ANNOTATIONS: [&str; 4] = [ORIGINAL, ORIGINAL_DIFF, ORIGINAL_DIFF_MD5, ORIGINAL_DIFF_FULL];

pub struct ResourceWithHistory<'a> {
    res: Resource,
    factory: &'a ChangeFactory,
}

impl<'a> ResourceWithHistory<'a> {
    pub(crate) fn new(res: Resource, factory: &'a ChangeFactory) -> Self { Self { res, factory } }

    pub fn historyless(res: &Resource) -> Resource {
        let mut out = res.clone();
        for k in HISTORY_ANNOTATIONS {
            out.remove_annotation(k);
        }
        out
    }

    /// The recorded last-applied form, if the live object has not drifted
    /// since it was recorded.
    pub fn last_applied_resource(&self) -> Result<Option<Resource>> {
        let (Some(raw), Some(expected)) = (self.res.annotation(ORIGINAL), self.res.annotation(ORIGINAL_DIFF_MD5)) else {
            return Ok(None);
        };
        let last = match Resource::from_json_bytes(raw.as_bytes()) {
            Ok(r) => r,
            Err(e) => {
                warn!(resource = %self.res.description(), error = %e, "ignoring unparsable last applied record");
                return Ok(None);
            }
        };
        let fingerprint = self.recorded_fingerprint(&last)?;
        if fingerprint != expected {
            debug!(resource = %self.res.description(), "live resource drifted from last applied record");
            return Ok(None);
        }
        Ok(Some(last))
    }

    /// Live resource with history annotations describing `applied`; `None`
    /// when recording is disabled or nothing would change.
    pub fn record_last_applied(&self, applied: &Resource) -> Result<Option<Resource>> {
        if self.res.has_annotation(DISABLE_ORIGINAL) || applied.has_annotation(DISABLE_ORIGINAL) {
            return Ok(None);
        }
        let applied = Self::historyless(applied);
        let change = self.exact_change(&applied)?;
        let text = change.text_diff()?;
        let values = [
            (ORIGINAL, applied.to_compact_json()),
            (ORIGINAL_DIFF, text.minimal_string()),
            (ORIGINAL_DIFF_MD5, change.fingerprint()),
            (ORIGINAL_DIFF_FULL, text.full_string()),
        ];
        if let Some((k, v)) = values.iter().find(|(_, v)| v.len() > MAX_ANNOTATION_VALUE_LEN) {
            warn!(resource = %self.res.description(), annotation = %k, len = v.len(), "skipping last applied record, value too large");
            return Ok(None);
        }
        let mut out = self.res.clone();
        for (k, v) in &values {
            out.set_annotation(k, v);
        }
        Ok(if out == self.res { None } else { Some(out) })
    }

    fn exact_change(&self, applied: &Resource) -> Result<Change> {
        let live = self.factory.exclude(&Self::historyless(&self.res))?;
        let applied = self.factory.exclude(applied)?;
        self.factory.new_exact_change(Some(&live), Some(&applied))
    }

    fn recorded_fingerprint(&self, last: &Resource) -> Result<String> { Ok(self.exact_change(&Self::historyless(last))?.fingerprint()) }
}
