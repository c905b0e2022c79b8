//! Configuration types

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-wide defaults for the synchronization layer.
///
/// Durations are serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Freshness window for queries that do not declare one.
    /// Zero means every read after the first completes is stale.
    #[serde(rename = "default_stale_after_ms", with = "duration_ms")]
    pub default_stale_after: Duration,

    /// How long an entry with no subscribers is retained for fast remounts.
    #[serde(rename = "gc_grace_ms", with = "duration_ms")]
    pub gc_grace: Duration,

    /// Silent retries after a transport failure before the error surfaces.
    pub default_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_stale_after: Duration::ZERO,
            gc_grace: Duration::from_secs(5),
            default_retries: 1,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_stale_after(mut self, duration: Duration) -> Self {
        self.default_stale_after = duration;
        self
    }

    pub fn with_gc_grace(mut self, duration: Duration) -> Self {
        self.gc_grace = duration;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_grace > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidValue {
                field: "gc_grace_ms".to_string(),
                value: self.gc_grace.as_millis().to_string(),
                reason: "must be at most one hour".to_string(),
            });
        }
        if self.default_retries > 5 {
            return Err(ConfigError::InvalidValue {
                field: "default_retries".to_string(),
                value: self.default_retries.to_string(),
                reason: "must be <= 5".to_string(),
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gc_grace, Duration::from_secs(5));
        assert_eq!(config.default_retries, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = SyncConfig::new()
            .with_default_stale_after(Duration::from_secs(30))
            .with_gc_grace(Duration::ZERO)
            .with_default_retries(0);
        assert_eq!(config.default_stale_after, Duration::from_secs(30));
        assert_eq!(config.gc_grace, Duration::ZERO);
        assert_eq!(config.default_retries, 0);
    }

    #[test]
    fn test_config_rejects_excessive_retries() {
        let config = SyncConfig::new().with_default_retries(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "default_retries"
        ));
    }

    #[test]
    fn test_config_serializes_milliseconds() {
        let config = SyncConfig::new().with_gc_grace(Duration::from_millis(2500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["gc_grace_ms"], 2500);

        let back: SyncConfig = serde_json::from_str(r#"{"default_retries": 2}"#).unwrap();
        assert_eq!(back.default_retries, 2);
        assert_eq!(back.gc_grace, Duration::from_secs(5));
    }
}
