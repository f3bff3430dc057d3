//! Schema loading and validation.
//!
//! The global schema must load at startup (fatal otherwise) but only
//! validates templates advisorily. Per-type schemas gate `AddObject`: no
//! schema means the type cannot be added at runtime.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use entity_manager_bus::BusFault;

use crate::error::{EmError, Result};

const GLOBAL_SCHEMA: &str = "global.json";

pub struct SchemaStore {
    dir: PathBuf,
    global: jsonschema::Validator,
}

impl SchemaStore {
    /// Load the schema directory. Fails when the global schema is missing
    /// or not a legal schema; the daemon must not start without it.
    pub fn load(dir: &Path) -> Result<Self> {
        let global_path = dir.join(GLOBAL_SCHEMA);
        let content = std::fs::read_to_string(&global_path).map_err(|e| {
            EmError::schema(format!(
                "Cannot open schema file {}, cannot validate JSON: {}",
                global_path.display(),
                e
            ))
        })?;
        let schema: Value = json5::from_str(&content).map_err(|e| {
            EmError::schema(format!(
                "Illegal schema file {}: {}",
                global_path.display(),
                e
            ))
        })?;
        let global = jsonschema::validator_for(&schema)
            .map_err(|e| EmError::schema(format!("Illegal global schema: {}", e)))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            global,
        })
    }

    /// Advisory validation of a template file against the global schema.
    /// Failures are logged, never fatal.
    pub fn validate_advisory(&self, source: &str, data: &Value) {
        if !self.global.is_valid(data) {
            warn!(file = %source, "Template does not validate against the global schema");
        }
    }

    /// Validate AddObject payload data against the per-type schema.
    ///
    /// A type without a schema on disk cannot be validated and is rejected
    /// as invalid input; an unreadable schema is our fault.
    pub fn validate_for_type(&self, object_type: &str, data: &Value) -> std::result::Result<(), BusFault> {
        let path = self.dir.join(format!("{}.json", object_type.to_lowercase()));
        let content = std::fs::read_to_string(&path)
            .map_err(|_| BusFault::invalid("No schema available, cannot validate."))?;
        let schema: Value = json5::from_str(&content).map_err(|e| {
            warn!(file = %path.display(), error = %e, "Schema not legal");
            BusFault::internal("schema not legal")
        })?;
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            warn!(file = %path.display(), error = %e, "Schema not legal");
            BusFault::internal("schema not legal")
        })?;
        if !validator.is_valid(data) {
            return Err(BusFault::invalid("Data does not match schema"));
        }
        Ok(())
    }
}
