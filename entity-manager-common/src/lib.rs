//! Entity Manager Common Library
//!
//! Shared leaf types for the entity-manager inventory daemon:
//!
//! - [`value`] - The bus property-value model ([`PropertyValue`])
//! - [`object`] - Managed-object snapshot maps
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod object;
pub mod value;

// Re-export commonly used types at the crate root
pub use config::{
    EmConfig, LogFormat, LoggingConfig, PathsConfig, TimingConfig, load_config, parse_config,
};
pub use error::{Error, Result};
pub use object::{BusSnapshot, InterfaceMap, ManagedObjects, PropertyMap};
pub use value::PropertyValue;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
