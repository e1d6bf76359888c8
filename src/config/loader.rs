use std::path::Path;

use config::{Config, File, FileFormat};

use crate::config::{
    models::ProxyConfig,
    validation::{ConfigError, ConfigValidator},
};

/// Load and validate configuration from a file using the config crate.
/// Supports TOML (default), YAML and JSON, chosen by extension.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let config = load_config_unchecked(config_path)?;
    ConfigValidator::validate(&config)?;
    Ok(config)
}

/// Load configuration without semantic validation.
pub fn load_config_unchecked(config_path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let config_path = config_path.as_ref();

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    };

    let load_error = |source| ConfigError::Load {
        path: config_path.to_path_buf(),
        source,
    };

    let settings = Config::builder()
        .add_source(File::from(config_path).format(format))
        .build()
        .map_err(load_error)?;

    settings.try_deserialize().map_err(load_error)
}
