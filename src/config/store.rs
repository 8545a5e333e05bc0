use std::path::Path;

use tracing::debug;

use super::RelayConfig;
use crate::error::{RelayError, Result};

/// Load configuration from a JSON file
///
/// Missing fields fall back to their defaults. The result is validated
/// before it is returned.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        RelayError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: RelayConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
