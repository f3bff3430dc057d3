//! System configuration persistence.
//!
//! `system.json` is written only when a scan completes, so a partially
//! projected state is never observable across restart. At startup the
//! previous file is carried over as `last.json` when the firmware version
//! is unchanged; a firmware change invalidates it.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::{info, warn};

use entity_manager_common::PathsConfig;

use crate::error::Result;

/// Write the persisted system configuration.
pub fn write_system_configuration(path: &Path, configuration: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string_pretty(&Value::Object(configuration.clone()))?;
    std::fs::write(path, serialized)?;
    Ok(())
}

/// Startup handling of the previous configuration.
///
/// When the firmware version is unchanged, `system.json` is moved aside
/// to `last.json` and parsed; its entities count as "was there before".
/// Otherwise the stale file is cleared. Never fatal: any failure just
/// yields an empty previous configuration.
pub fn load_last_configuration(paths: &PathsConfig) -> Map<String, Value> {
    if !firmware_version_unchanged(paths) {
        // Not an error, logged so it makes it into the journal.
        info!("Clearing previous configuration");
        let _ = std::fs::remove_file(&paths.current_configuration);
        return Map::new();
    }

    if !paths.current_configuration.is_file() {
        return Map::new();
    }

    // Keeping the copy around is nice for debug.
    if let Some(parent) = paths.last_configuration.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(&paths.last_configuration);
    if let Err(e) = std::fs::copy(&paths.current_configuration, &paths.last_configuration) {
        warn!(error = %e, "Unable to preserve previous configuration");
        return Map::new();
    }
    let _ = std::fs::remove_file(&paths.current_configuration);

    let content = match std::fs::read_to_string(&paths.last_configuration) {
        Ok(content) => content,
        Err(e) => {
            warn!(file = %paths.last_configuration.display(), error = %e, "Unable to open");
            return Map::new();
        }
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(file = %paths.last_configuration.display(), "Not a JSON object");
            Map::new()
        }
        Err(e) => {
            warn!(file = %paths.last_configuration.display(), error = %e, "Syntax error");
            Map::new()
        }
    }
}

/// Compare the running firmware version with the witness written by the
/// previous run, updating the witness on change.
fn firmware_version_unchanged(paths: &PathsConfig) -> bool {
    let Some(version) = read_os_version(&paths.os_release) else {
        warn!(file = %paths.os_release.display(), "Unable to read firmware version");
        return false;
    };

    let previous = std::fs::read_to_string(&paths.version_file).unwrap_or_default();
    if previous.trim() == version {
        return true;
    }

    if let Some(parent) = paths.version_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&paths.version_file, &version) {
        warn!(error = %e, "Unable to record firmware version");
    }
    false
}

fn read_os_version(os_release: &Path) -> Option<String> {
    let content = std::fs::read_to_string(os_release).ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix("VERSION_ID=")
            .map(|v| v.trim().trim_matches('"').to_string())
    })
}
