use std::collections::BTreeMap;

use keel_config::Conf;
use keel_core::annotations::{AssociationLabel, APP_LABEL, ASSOCIATION, DISABLE_LABEL_SCOPING};
use keel_core::{Path, Resource, ResourceMatcher, Result, StringMapAppendMod};

/// Stamps ownership labels on desired resources before diffing.
///
/// Every resource gets its association label at each ownership path (and
/// always at `metadata.labels`) so objects its controller creates can be
/// found again. With an app label configured, that label is stamped beside
/// it and, unless the resource opts out, added to its selectors.
pub struct LabeledResources<'a> {
    conf: &'a Conf,
    app: Option<&'a str>,
}

impl<'a> LabeledResources<'a> {
    pub fn new(conf: &'a Conf, app: Option<&'a str>) -> Self { Self { conf, app } }

    /// Selector for everything previously applied under the app label.
    pub fn app_selector(&self) -> Option<String> { self.app.map(|app| format!("{}={}", APP_LABEL, app)) }

    pub fn prepare(&self, resources: Vec<Resource>) -> Result<Vec<Resource>> { resources.into_iter().map(|r| self.prepare_one(r)).collect() }

    fn prepare_one(&self, mut res: Resource) -> Result<Resource> {
        let mut owned = BTreeMap::new();
        owned.insert(ASSOCIATION.to_string(), AssociationLabel::value(&res));
        if let Some(app) = self.app {
            owned.insert(APP_LABEL.to_string(), app.to_string());
        }
        let metadata_labels = StringMapAppendMod {
            matcher: ResourceMatcher::all(),
            path: Path::from_strs(&["metadata", "labels"]),
            kvs: owned.clone(),
            skip_if_not_found: false,
        };
        metadata_labels.apply(&mut res)?;
        for m in self.conf.ownership_label_mods(&owned) {
            m.apply(&mut res)?;
        }

        if let Some(app) = self.app {
            if !res.has_annotation(DISABLE_LABEL_SCOPING) {
                let scoped: BTreeMap<String, String> = [(APP_LABEL.to_string(), app.to_string())].into_iter().collect();
                for m in self.conf.label_scoping_mods(&scoped) {
                    m.apply(&mut res)?;
                }
            }
        }
        Ok(res)
    }
}
