use std::path::PathBuf;

use thiserror::Error;

use crate::config::models::ProxyConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ConfigError>;

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("backend_url is not valid for host '{host}': {url}: {reason}")]
    InvalidBackendUrl {
        host: String,
        url: String,
        reason: String,
    },

    #[error("TLS requires both a certificate and a key (got only the {present})")]
    IncompleteTls { present: &'static str },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load config file {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
}

/// Semantic checks on a parsed configuration file.
///
/// Backend URLs are checked when the routing table is built; this validator
/// covers what serde cannot express.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.servers.is_empty() {
            errors.push("at least one [[servers]] entry is required".to_string());
        }

        for (i, server) in config.servers.iter().enumerate() {
            if let Err(e) = Self::validate_host(&server.host) {
                errors.push(format!("servers[{i}].host: {e}"));
            }
            if server.backend_url.trim().is_empty() {
                errors.push(format!("servers[{i}].backend_url: must not be empty"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_host(host: &str) -> Result<(), &'static str> {
        if host.is_empty() {
            return Err("must not be empty");
        }
        if host.chars().any(char::is_whitespace) {
            return Err("must not contain whitespace");
        }
        if host.contains('/') {
            return Err("must be a bare host name, not a URL or path");
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<String>) -> String {
        if errors.len() == 1 {
            return errors.into_iter().next().unwrap_or_default();
        }
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("\n  {}. {e}", i + 1))
            .collect()
    }
}
