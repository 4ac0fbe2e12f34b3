//! Export source configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! `EVENTSYNC_*` environment variables, so credentials never need to be
//! written to disk.
//!
//! ```toml
//! base_url = "https://export.example.com/api/2.0"
//! username = "service-account"
//! secret = "..."
//! project_id = "12345"
//! timeout_secs = 120
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::SourceError;

/// Default per-request timeout. Export responses for a full week of
/// events can take a while to stream.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Connection settings for the HTTP export source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Export API base URL (without the trailing `/export`).
    #[serde(default)]
    pub base_url: String,
    /// Service account user name.
    #[serde(default)]
    pub username: String,
    /// Service account secret.
    #[serde(default)]
    pub secret: String,
    /// Project to export from, when the account can see several.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            secret: String::new(),
            project_id: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl SourceConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if the TOML is malformed.
    pub fn from_toml_str(text: &str) -> Result<Self, SourceError> {
        toml::de::from_str(text).map_err(|e| SourceError::Config {
            message: format!("invalid source config: {e}"),
        })
    }

    /// Loads the configuration from `path` (if given) and applies
    /// environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the file cannot be read or parsed, or an
    /// override has an invalid value.
    pub fn load(path: Option<&Path>) -> Result<Self, SourceError> {
        let base = match path {
            Some(path) => {
                log::debug!("Loading source config from {}", path.display());
                Self::from_toml_str(&std::fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `EVENTSYNC_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if `EVENTSYNC_TIMEOUT_SECS` is not a
    /// positive integer.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, SourceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EVENTSYNC_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("EVENTSYNC_USERNAME") {
            self.username = v;
        }
        if let Some(v) = lookup("EVENTSYNC_SECRET") {
            self.secret = v;
        }
        if let Some(v) = lookup("EVENTSYNC_PROJECT_ID") {
            self.project_id = Some(v);
        }
        if let Some(v) = lookup("EVENTSYNC_TIMEOUT_SECS") {
            self.timeout_secs = v
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| SourceError::Config {
                    message: format!("EVENTSYNC_TIMEOUT_SECS must be a positive integer, got '{v}'"),
                })?;
        }
        Ok(self)
    }

    /// Checks that every required field is present.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when `base_url` is empty, and
    /// [`SourceError::Auth`] when credentials are missing.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.base_url.trim().is_empty() {
            return Err(SourceError::Config {
                message: "base_url is not set (EVENTSYNC_BASE_URL)".to_string(),
            });
        }
        if self.username.is_empty() || self.secret.is_empty() {
            return Err(SourceError::Auth {
                message: "username and secret are required (EVENTSYNC_USERNAME, EVENTSYNC_SECRET)"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn parses_toml_with_defaults() {
        let config = SourceConfig::from_toml_str(
            r#"
            base_url = "https://export.example.com/api/2.0"
            username = "svc"
            secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://export.example.com/api/2.0");
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(config.project_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: BTreeMap<&str, &str> = [
            ("EVENTSYNC_SECRET", "from-env"),
            ("EVENTSYNC_PROJECT_ID", "99"),
            ("EVENTSYNC_TIMEOUT_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let config = SourceConfig::from_toml_str("secret = \"from-file\"")
            .unwrap()
            .with_overrides(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.secret, "from-env");
        assert_eq!(config.project_id.as_deref(), Some("99"));
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn rejects_zero_timeout_override() {
        let result = SourceConfig::default().with_overrides(|key| {
            (key == "EVENTSYNC_TIMEOUT_SECS").then(|| "0".to_string())
        });
        assert!(matches!(result, Err(SourceError::Config { .. })));
    }

    #[test]
    fn missing_credentials_is_an_auth_error() {
        let config = SourceConfig {
            base_url: "https://export.example.com".to_string(),
            ..SourceConfig::default()
        };
        assert!(matches!(config.validate(), Err(SourceError::Auth { .. })));
        assert!(matches!(
            SourceConfig::default().validate(),
            Err(SourceError::Config { .. })
        ));
    }
}
