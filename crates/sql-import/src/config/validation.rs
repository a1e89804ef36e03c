//! Configuration validation.

use super::Config;
use crate::drivers::postgres::SslMode;
use crate::error::{ImportError, Result};
use std::collections::HashSet;

/// Validate the configuration.
///
/// Mapping descriptors are only checked for naming here; their fields are
/// validated against the target's stored fields before each job starts.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(ImportError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(ImportError::Config("source.database is required".into()));
    }
    if config.source.credential.user.is_empty() {
        return Err(ImportError::Config("source.user is required".into()));
    }
    if !config.source.credential.has_secret() {
        return Err(ImportError::Config(
            "source.password or source.password_env is required".into(),
        ));
    }
    if config.source.r#type != "mssql" {
        return Err(ImportError::Config(format!(
            "source.type must be 'mssql', got '{}'",
            config.source.r#type
        )));
    }
    if config.source.max_connections == 0 {
        return Err(ImportError::Config(
            "source.max_connections must be at least 1".into(),
        ));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(ImportError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(ImportError::Config("target.database is required".into()));
    }
    if config.target.credential.user.is_empty() {
        return Err(ImportError::Config("target.user is required".into()));
    }
    if !config.target.credential.has_secret() {
        return Err(ImportError::Config(
            "target.password or target.password_env is required".into(),
        ));
    }
    if config.target.r#type != "postgres" {
        return Err(ImportError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    SslMode::parse(&config.target.ssl_mode)?;
    if config.target.max_connections == 0 {
        return Err(ImportError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    // Mapping names
    let mut names = HashSet::new();
    for mapping in &config.mappings {
        if mapping.name.trim().is_empty() {
            return Err(ImportError::Config("every mapping needs a name".into()));
        }
        if !names.insert(mapping.name.as_str()) {
            return Err(ImportError::Config(format!(
                "duplicate mapping name '{}'",
                mapping.name
            )));
        }
    }

    Ok(())
}
