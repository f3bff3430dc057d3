//! Template library loading.
//!
//! Templates live in the package configuration directory and may be
//! overlaid per host: a host file with the same base name replaces the
//! package entry. Files are JSON with comments allowed; a file holds one
//! template object or an array of them. Malformed files are logged and
//! skipped, never fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EmError, Result};
use crate::probe::{self, ProbeExpr};
use crate::schema::SchemaStore;

/// Property-mapping of one template: interface key → property name →
/// source detector field.
pub type PropertyMapping = BTreeMap<String, BTreeMap<String, String>>;

/// A loaded template, immutable after load.
#[derive(Debug)]
pub struct Template {
    /// Raw `Name`, possibly containing placeholders.
    pub name: String,
    /// Parsed probe; invalid expressions degrade to never-match.
    pub probe: ProbeExpr,
    /// The full record body, untouched.
    pub body: Value,
    /// For each writable interface block, which source field feeds each
    /// property (extracted from `"$field"` string leaves).
    pub property_mapping: PropertyMapping,
}

/// The template library, ordered alphabetically by file.
pub struct TemplateStore {
    templates: Vec<Template>,
    probe_interfaces: BTreeSet<String>,
    mappings: BTreeMap<String, PropertyMapping>,
}

impl TemplateStore {
    /// A store with no templates, for running without a usable library.
    pub fn empty() -> Self {
        Self {
            templates: Vec::new(),
            probe_interfaces: BTreeSet::new(),
            mappings: BTreeMap::new(),
        }
    }

    /// Load the package directory with the host overlay applied.
    ///
    /// Fails only when no configuration file exists at all; individual
    /// bad files or records are skipped with a log.
    pub fn load(
        config_dir: &Path,
        host_config_dir: &Path,
        schemas: Option<&SchemaStore>,
    ) -> Result<Self> {
        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        for dir in [config_dir, host_config_dir] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    // Later directory wins: host overlays the package.
                    files.insert(stem.to_string(), path);
                }
            }
        }

        if files.is_empty() {
            return Err(EmError::config(format!(
                "Unable to find any configuration files in {}",
                config_dir.display()
            )));
        }

        let mut templates = Vec::new();
        for (stem, path) in &files {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unable to open configuration file");
                    continue;
                }
            };
            let data: Value = match json5::from_str(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Syntax error in configuration file");
                    continue;
                }
            };
            if let Some(schemas) = schemas {
                schemas.validate_advisory(stem, &data);
            }

            let records: Vec<Value> = match data {
                Value::Array(items) => items,
                other => vec![other],
            };
            for record in records {
                match parse_record(record) {
                    Ok(template) => templates.push(template),
                    Err(e) => warn!(file = %path.display(), error = %e, "Skipping template"),
                }
            }
        }

        let mut probe_interfaces = BTreeSet::new();
        for template in &templates {
            template.probe.collect_interfaces(&mut probe_interfaces);
        }

        let mappings = templates
            .iter()
            .filter(|t| !t.property_mapping.is_empty())
            .map(|t| (t.name.clone(), t.property_mapping.clone()))
            .collect();

        debug!(
            templates = templates.len(),
            interfaces = probe_interfaces.len(),
            "Template library loaded"
        );

        Ok(Self {
            templates,
            probe_interfaces,
            mappings,
        })
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Union of interface names probed by any template: the
    /// probe-interest set.
    pub fn probe_interfaces(&self) -> &BTreeSet<String> {
        &self.probe_interfaces
    }

    /// Look up the property-mapping of a template by its record name.
    pub fn property_mapping(&self, name: &str) -> Option<&PropertyMapping> {
        self.mappings.get(name)
    }
}

fn parse_record(record: Value) -> Result<Template> {
    let object = record
        .as_object()
        .ok_or_else(|| EmError::config("template record is not an object"))?;
    let name = object
        .get("Name")
        .and_then(Value::as_str)
        .ok_or_else(|| EmError::config("No Probe/Name found"))?
        .to_string();
    let probe_field = object
        .get("Probe")
        .ok_or_else(|| EmError::config("No Probe/Name found"))?;

    let probe = match probe::parse(probe_field) {
        Ok(probe) => probe,
        Err(e) => {
            warn!(template = %name, error = %e, "Invalid probe, treating as FALSE");
            ProbeExpr::never()
        }
    };

    let property_mapping = if name.contains('$') {
        // Templated names cannot be resolved back to one record.
        PropertyMapping::new()
    } else {
        extract_property_mapping(object)
    };

    Ok(Template {
        name,
        probe,
        body: record,
        property_mapping,
    })
}

fn extract_property_mapping(record: &serde_json::Map<String, Value>) -> PropertyMapping {
    let mut mapping = PropertyMapping::new();
    for (key, value) in record {
        if !value.is_object() {
            continue;
        }
        let mut properties = BTreeMap::new();
        collect_mapped_leaves(value, &mut properties);
        if !properties.is_empty() {
            mapping.insert(key.clone(), properties);
        }
    }
    mapping
}

fn collect_mapped_leaves(value: &Value, out: &mut BTreeMap<String, String>) {
    if let Some(object) = value.as_object() {
        for (key, entry) in object {
            match entry {
                Value::Object(_) => collect_mapped_leaves(entry, out),
                Value::String(s) => {
                    if let Some(at) = s.find('$') {
                        out.insert(key.clone(), s[at + 1..].to_string());
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store_from(base: &[(&str, &str)], host: &[(&str, &str)]) -> Result<TemplateStore> {
        let base_dir = tempfile::tempdir().unwrap();
        let host_dir = tempfile::tempdir().unwrap();
        for (name, content) in base {
            fs::write(base_dir.path().join(name), content).unwrap();
        }
        for (name, content) in host {
            fs::write(host_dir.path().join(name), content).unwrap();
        }
        TemplateStore::load(base_dir.path(), host_dir.path(), None)
    }

    #[test]
    fn empty_library_is_an_error() {
        assert!(store_from(&[], &[]).is_err());
    }

    #[test]
    fn host_overlay_wins_on_same_base_name() {
        let store = store_from(
            &[(
                "board.json",
                r#"{"Name": "PackageBoard", "Probe": "TRUE", "Exposes": []}"#,
            )],
            &[(
                "board.json",
                r#"{"Name": "HostBoard", "Probe": "TRUE", "Exposes": []}"#,
            )],
        )
        .unwrap();

        assert_eq!(store.templates().len(), 1);
        assert_eq!(store.templates()[0].name, "HostBoard");
    }

    #[test]
    fn malformed_file_is_skipped() {
        let store = store_from(
            &[
                ("bad.json", "{ this is not json"),
                (
                    "good.json",
                    r#"{"Name": "Good", "Probe": "TRUE", "Exposes": []}"#,
                ),
            ],
            &[],
        )
        .unwrap();

        assert_eq!(store.templates().len(), 1);
        assert_eq!(store.templates()[0].name, "Good");
    }

    #[test]
    fn comments_and_arrays_are_accepted() {
        let store = store_from(
            &[(
                "multi.json",
                r#"[
                    // first board
                    {"Name": "A", "Probe": "TRUE"},
                    {"Name": "B", "Probe": "FALSE"},
                ]"#,
            )],
            &[],
        )
        .unwrap();

        assert_eq!(store.templates().len(), 2);
    }

    #[test]
    fn record_without_probe_is_skipped() {
        let store = store_from(
            &[
                ("noprobe.json", r#"{"Name": "X"}"#),
                ("ok.json", r#"{"Name": "Y", "Probe": "TRUE"}"#),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(store.templates().len(), 1);
    }

    #[test]
    fn invalid_probe_becomes_never_match() {
        let store = store_from(
            &[("bad_probe.json", r#"{"Name": "X", "Probe": "what is this"}"#)],
            &[],
        )
        .unwrap();
        assert_eq!(store.templates().len(), 1);
        let matches = crate::probe::evaluate(
            &store.templates()[0].probe,
            &entity_manager_common::BusSnapshot::new(),
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn interest_set_spans_all_templates() {
        let store = store_from(
            &[
                (
                    "a.json",
                    r#"{"Name": "A", "Probe": "x.I.One({'k': 1})"}"#,
                ),
                (
                    "b.json",
                    r#"{"Name": "B", "Probe": ["FOUND('x.I.Two')", "OR", "x.I.Three({'k': 2})"]}"#,
                ),
            ],
            &[],
        )
        .unwrap();

        let interest = store.probe_interfaces();
        assert!(interest.contains("x.I.One"));
        assert!(interest.contains("x.I.Two"));
        assert!(interest.contains("x.I.Three"));
    }

    #[test]
    fn property_mapping_extraction() {
        let store = store_from(
            &[(
                "asset.json",
                r#"{
                    "Name": "Board",
                    "Probe": "TRUE",
                    "xyz.openbmc_project.Inventory.Decorator.Asset": {
                        "AssetTag": "$BOARD_ASSET_TAG",
                        "Model": "fixed"
                    }
                }"#,
            )],
            &[],
        )
        .unwrap();

        let mapping = store.property_mapping("Board").unwrap();
        assert_eq!(
            mapping["xyz.openbmc_project.Inventory.Decorator.Asset"]["AssetTag"],
            "BOARD_ASSET_TAG"
        );
        assert!(
            !mapping["xyz.openbmc_project.Inventory.Decorator.Asset"].contains_key("Model")
        );
    }

    #[test]
    fn templated_names_have_no_mapping() {
        let store = store_from(
            &[(
                "templated.json",
                r#"{
                    "Name": "Board $index",
                    "Probe": "TRUE",
                    "x.Iface": {"P": "$FIELD"}
                }"#,
            )],
            &[],
        )
        .unwrap();
        assert!(store.property_mapping("Board $index").is_none());
    }
}
