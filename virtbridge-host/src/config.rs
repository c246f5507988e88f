//! Bridge configuration.

use serde::{Deserialize, Serialize};

/// Default hypervisor URI when a caller does not name one.
pub const DEFAULT_URI: &str = "qemu:///system";

/// Default cap on concurrent blocking host calls.
pub const DEFAULT_MAX_BLOCKING_CALLS: usize = 8;

/// Default gateway listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3457";

pub const ENV_DEFAULT_URI: &str = "VIRTBRIDGE_DEFAULT_URI";
pub const ENV_MAX_BLOCKING_CALLS: &str = "VIRTBRIDGE_MAX_BLOCKING_CALLS";
pub const ENV_LISTEN_ADDR: &str = "VIRTBRIDGE_LISTEN_ADDR";

/// Errors in bridge configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment variable held a value that does not parse.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue { key: &'static str, value: String, reason: String },

    /// A field failed validation.
    #[error("invalid configuration field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for a [`crate::Bridge`] and the gateway in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BridgeConfig {
    /// URI used by `connect` when the caller gives none.
    pub default_uri: String,

    /// Upper bound on blocking host calls in flight at once.
    pub max_blocking_calls: usize,

    /// Address the gateway binds to.
    pub listen_addr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_uri: DEFAULT_URI.to_owned(),
            max_blocking_calls: DEFAULT_MAX_BLOCKING_CALLS,
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `VIRTBRIDGE_*` environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable does not parse or the result
    /// fails [`BridgeConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BridgeConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a value does not parse or the result fails
    /// validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(uri) = lookup(ENV_DEFAULT_URI) {
            config.default_uri = uri;
        }
        if let Some(raw) = lookup(ENV_MAX_BLOCKING_CALLS) {
            config.max_blocking_calls = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    key: ENV_MAX_BLOCKING_CALLS,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            config.listen_addr = addr;
        }

        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_default_uri(mut self, uri: impl Into<String>) -> Self {
        self.default_uri = uri.into();
        self
    }

    #[must_use]
    pub fn with_max_blocking_calls(mut self, max: usize) -> Self {
        self.max_blocking_calls = max;
        self
    }

    /// Check field invariants.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for an empty default URI, a zero
    /// blocking-call limit, or an empty listen address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_uri.is_empty() {
            return Err(ConfigError::Invalid { field: "default_uri", reason: "must not be empty".to_owned() });
        }
        if self.max_blocking_calls == 0 {
            return Err(ConfigError::Invalid {
                field: "max_blocking_calls",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid { field: "listen_addr", reason: "must not be empty".to_owned() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_uri, "qemu:///system");
        assert_eq!(config.max_blocking_calls, 8);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            (ENV_DEFAULT_URI, "test:///default"),
            (ENV_MAX_BLOCKING_CALLS, " 3 "),
            (ENV_LISTEN_ADDR, "0.0.0.0:9000"),
        ]));
        match config {
            Ok(c) => {
                assert_eq!(c.default_uri, "test:///default");
                assert_eq!(c.max_blocking_calls, 3);
                assert_eq!(c.listen_addr, "0.0.0.0:9000");
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn unparsable_worker_count_is_rejected() {
        let result = BridgeConfig::from_lookup(lookup_from(&[(ENV_MAX_BLOCKING_CALLS, "many")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_MAX_BLOCKING_CALLS, .. })));
    }

    #[test]
    fn zero_worker_count_is_rejected() {
        let result = BridgeConfig::from_lookup(lookup_from(&[(ENV_MAX_BLOCKING_CALLS, "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid { field: "max_blocking_calls", .. })));
    }

    #[test]
    fn empty_default_uri_is_rejected() {
        let config = BridgeConfig::default().with_default_uri("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let config: BridgeConfig = match serde_json::from_str(r#"{"max_blocking_calls": 2}"#) {
            Ok(c) => c,
            Err(e) => panic!("deserialize failed: {e}"),
        };
        assert_eq!(config.max_blocking_calls, 2);
        assert_eq!(config.default_uri, DEFAULT_URI);
    }
}
