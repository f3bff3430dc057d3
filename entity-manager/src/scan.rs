//! Scan orchestration.
//!
//! A scan turns the template library plus a mirror snapshot into the new
//! system configuration. Templates are evaluated to a fixed point:
//! every new entity's exposed interfaces are overlaid onto the snapshot
//! so templates probing them can resolve in a later pass. The whole scan
//! is a pure function of its inputs, which is what makes it
//! deterministic and testable.

use serde_json::{Map, Value};
use tracing::debug;

use entity_manager_common::{BusSnapshot, InterfaceMap, PropertyValue};

use crate::probe::{self, ProbeMatch};
use crate::projector::{CONFIGURATION_PREFIX, ENTITY_MANAGER_SERVICE, entity_path};
use crate::substitute::{self, Replacements};
use crate::templates::{Template, TemplateStore};

/// Result of one scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// The new system configuration: entity id → entity.
    pub configuration: Map<String, Value>,
    /// Ids that were not in the previous configuration.
    pub added: Vec<String>,
    /// Ids carried over from the previous configuration.
    pub retained: Vec<String>,
    /// Previous entities the scan no longer yields; pruning candidates.
    pub missing: Map<String, Value>,
}

/// Run one scan against a snapshot.
///
/// `previous` is the live system configuration; `last_seen` is the
/// pre-restart configuration used to restore runtime-added data for
/// entities that come back under the same id.
pub fn run_scan(
    store: &TemplateStore,
    snapshot: &BusSnapshot,
    previous: &Map<String, Value>,
    last_seen: &Map<String, Value>,
) -> ScanOutcome {
    let mut outcome = ScanOutcome {
        missing: previous.clone(),
        ..Default::default()
    };
    let mut overlay = snapshot.clone();
    let mut unresolved: Vec<&Template> = store.templates().iter().collect();

    loop {
        let mut progressed = false;
        let mut still_unresolved = Vec::new();

        for template in unresolved {
            let matches = probe::evaluate(&template.probe, &overlay);
            if matches.is_empty() {
                still_unresolved.push(template);
                continue;
            }

            for (ordinal, found) in matches.iter().enumerate() {
                let mut replacements = found.replacements.clone();
                if !replacements.is_empty() {
                    replacements.insert("index".to_string(), Value::from(ordinal as u64));
                }
                let id = substitute::entity_id(&template.name, &replacements);

                // At most one instance per (template, match) across the scan.
                if outcome.configuration.contains_key(&id) {
                    continue;
                }

                let entity = if previous.contains_key(&id) {
                    outcome.missing.remove(&id);
                    outcome.retained.push(id.clone());
                    refresh_retained(
                        instantiate(template, &replacements, found),
                        &previous[&id],
                    )
                } else if let Some(restored) = last_seen.get(&id) {
                    // Came back across a restart: keep the stored record,
                    // runtime additions included.
                    outcome.added.push(id.clone());
                    restored.clone()
                } else {
                    outcome.added.push(id.clone());
                    instantiate(template, &replacements, found)
                };

                overlay_entity(&mut overlay, &entity);
                outcome.configuration.insert(id, entity);
                progressed = true;
            }
            // Yielded matches: resolved for this scan.
        }

        unresolved = still_unresolved;
        if !progressed || unresolved.is_empty() {
            break;
        }
    }

    debug!(
        entities = outcome.configuration.len(),
        added = outcome.added.len(),
        missing = outcome.missing.len(),
        "Scan complete"
    );
    outcome
}

/// Instantiate a template body for one match.
fn instantiate(template: &Template, replacements: &Replacements, found: &ProbeMatch) -> Value {
    let mut entity = template.body.clone();
    substitute::substitute(&mut entity, replacements);
    if let Some(path) = found.paths.iter().next() {
        if let Some(object) = entity.as_object_mut() {
            object.insert("ProbePath".to_string(), Value::from(path.clone()));
        }
    }
    entity
}

/// Refresh a retained entity: template-defined content is re-substituted
/// fresh, exposes entries added at runtime (beyond the template's own)
/// are carried over, nulled slots included.
fn refresh_retained(mut fresh: Value, previous: &Value) -> Value {
    let template_len = fresh
        .get("Exposes")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if let Some(previous_exposes) = previous.get("Exposes").and_then(Value::as_array) {
        if previous_exposes.len() > template_len {
            if let Some(exposes) = fresh.get_mut("Exposes").and_then(Value::as_array_mut) {
                exposes.extend(previous_exposes[template_len..].iter().cloned());
            }
        }
    }
    fresh
}

/// Make a new entity's exposed interfaces probe-visible for later passes.
fn overlay_entity(overlay: &mut BusSnapshot, entity: &Value) {
    let Some(exposes) = entity.get("Exposes").and_then(Value::as_array) else {
        return;
    };
    let mut interfaces = InterfaceMap::new();
    for expose in exposes {
        if expose.get("Status").and_then(Value::as_str) == Some("disabled") {
            continue;
        }
        let Some(expose_type) = expose.get("Type").and_then(Value::as_str) else {
            continue;
        };
        let Some(object) = expose.as_object() else {
            continue;
        };
        let properties = object
            .iter()
            .filter_map(|(k, v)| PropertyValue::from_json(v).map(|pv| (k.clone(), pv)))
            .collect();
        interfaces.insert(
            format!("{}{}", CONFIGURATION_PREFIX, expose_type),
            properties,
        );
    }
    if !interfaces.is_empty() {
        overlay
            .entry(ENTITY_MANAGER_SERVICE.to_string())
            .or_default()
            .insert(entity_path(entity), interfaces);
    }
}
