//! Relay tunables and their persistence.
//!
//! `Config` is replaced wholesale: a [`PartialConfig`] override is merged over
//! the current values, validated, and written back under `delivert_config`.
//! An absent or undecodable persisted config falls back to defaults.

use crate::address::{ADDRESS_SPACE, CONFIG_KEY};
use crate::error::{RelayError, Result};
use crate::store::DurableStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay tunables. Field names serialize in upper case so user-supplied
/// overrides read the same as the option names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Config {
    /// Queue capacity
    pub payload_limit: usize,
    /// Drain period in milliseconds
    pub file_transmission_frequency: u64,
    /// Namespace ceiling for addresses
    pub max_offset: u32,
    /// Slack above `payload_limit` before the overflow valve trips
    pub max_payload_error: usize,
    pub auto_reset_minutes: u64,
    pub watch_reset_enabled: bool,
    pub awaken_enabled: bool,
    pub awaken_every_minutes: u64,
    pub exit_enabled: bool,
    pub exit_every_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload_limit: 330,
            file_transmission_frequency: 2000,
            max_offset: 1440,
            max_payload_error: 10,
            auto_reset_minutes: 5,
            watch_reset_enabled: true,
            awaken_enabled: true,
            awaken_every_minutes: 1,
            exit_enabled: true,
            exit_every_minutes: 5,
        }
    }
}

impl Config {
    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.file_transmission_frequency)
    }

    pub fn auto_reset_period(&self) -> Duration {
        Duration::from_secs(60 * self.auto_reset_minutes)
    }

    pub fn awaken_period(&self) -> Duration {
        Duration::from_secs(60 * self.awaken_every_minutes)
    }

    pub fn exit_after(&self) -> Duration {
        Duration::from_secs(60 * self.exit_every_minutes)
    }

    /// Backlog count above which storing gives way to the overflow valve.
    pub fn backlog_tolerance(&self) -> usize {
        self.payload_limit.saturating_add(self.max_payload_error)
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload_limit == 0 {
            return Err(RelayError::InvalidConfig(
                "PAYLOAD_LIMIT must be at least 1".to_string(),
            ));
        }
        if self.file_transmission_frequency == 0 {
            return Err(RelayError::InvalidConfig(
                "FILE_TRANSMISSION_FREQUENCY must be positive".to_string(),
            ));
        }
        // The next address must still fit in four digits
        if self.max_offset >= ADDRESS_SPACE - 1 {
            return Err(RelayError::InvalidConfig(format!(
                "MAX_OFFSET must be below {}, got {}",
                ADDRESS_SPACE - 1,
                self.max_offset
            )));
        }
        if self.auto_reset_minutes == 0
            || self.awaken_every_minutes == 0
            || self.exit_every_minutes == 0
        {
            return Err(RelayError::InvalidConfig(
                "liveness periods must be at least one minute".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge an override over this config, returning the candidate.
    pub fn merged(&self, overrides: &PartialConfig) -> Config {
        let mut next = self.clone();
        if let Some(v) = overrides.payload_limit {
            next.payload_limit = v;
        }
        if let Some(v) = overrides.file_transmission_frequency {
            next.file_transmission_frequency = v;
        }
        if let Some(v) = overrides.max_offset {
            next.max_offset = v;
        }
        if let Some(v) = overrides.max_payload_error {
            next.max_payload_error = v;
        }
        if let Some(v) = overrides.auto_reset_minutes {
            next.auto_reset_minutes = v;
        }
        if let Some(v) = overrides.watch_reset_enabled {
            next.watch_reset_enabled = v;
        }
        if let Some(v) = overrides.awaken_enabled {
            next.awaken_enabled = v;
        }
        if let Some(v) = overrides.awaken_every_minutes {
            next.awaken_every_minutes = v;
        }
        if let Some(v) = overrides.exit_enabled {
            next.exit_enabled = v;
        }
        if let Some(v) = overrides.exit_every_minutes {
            next.exit_every_minutes = v;
        }
        next
    }
}

/// User-supplied override; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct PartialConfig {
    pub payload_limit: Option<usize>,
    pub file_transmission_frequency: Option<u64>,
    pub max_offset: Option<u32>,
    pub max_payload_error: Option<usize>,
    pub auto_reset_minutes: Option<u64>,
    pub watch_reset_enabled: Option<bool>,
    pub awaken_enabled: Option<bool>,
    pub awaken_every_minutes: Option<u64>,
    pub exit_enabled: Option<bool>,
    pub exit_every_minutes: Option<u64>,
}

/// Persists [`Config`] in a [`DurableStore`].
pub struct ConfigStore<'a> {
    store: &'a dyn DurableStore,
}

impl<'a> ConfigStore<'a> {
    pub fn new(store: &'a dyn DurableStore) -> Self {
        Self { store }
    }

    /// Persisted config, `None` if absent or undecodable.
    pub fn read(&self) -> Result<Option<Config>> {
        let Some(bytes) = self.store.read(CONFIG_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Config>(&bytes) {
            Ok(config) => match config.validate() {
                Ok(()) => Ok(Some(config)),
                Err(e) => {
                    tracing::warn!(error = %e, "Persisted config is invalid, ignoring");
                    Ok(None)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Persisted config is undecodable, ignoring");
                Ok(None)
            }
        }
    }

    pub fn write(&self, config: &Config) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(config).map_err(|e| RelayError::serialization(CONFIG_KEY, e))?;
        self.store.write(CONFIG_KEY, &bytes)
    }

    /// Config for this process lifetime: the persisted one, else defaults.
    pub fn load_or_default(&self) -> Result<Config> {
        Ok(self.read()?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirStore;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.payload_limit, 330);
        assert_eq!(config.drain_period(), Duration::from_millis(2000));
        assert_eq!(config.max_offset, 1440);
        assert_eq!(config.backlog_tolerance(), 340);
        assert_eq!(config.auto_reset_period(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_only_touches_set_fields() {
        let base = Config::default();
        let merged = base.merged(&PartialConfig {
            payload_limit: Some(5),
            watch_reset_enabled: Some(false),
            ..Default::default()
        });
        assert_eq!(merged.payload_limit, 5);
        assert!(!merged.watch_reset_enabled);
        assert_eq!(merged.max_offset, base.max_offset);
        assert_eq!(merged.file_transmission_frequency, base.file_transmission_frequency);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.max_offset = 9999;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.payload_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.awaken_every_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_upper_case_names() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"PAYLOAD_LIMIT\":330"));
        assert!(json.contains("\"FILE_TRANSMISSION_FREQUENCY\":2000"));

        let partial: PartialConfig =
            serde_json::from_str(r#"{"MAX_OFFSET": 99, "EXIT_ENABLED": false}"#).unwrap();
        assert_eq!(partial.max_offset, Some(99));
        assert_eq!(partial.exit_enabled, Some(false));
        assert!(partial.payload_limit.is_none());
    }

    #[test]
    fn test_partial_rejects_unknown_fields() {
        assert!(serde_json::from_str::<PartialConfig>(r#"{"PAYLOAD_LIMT": 3}"#).is_err());
    }

    #[test]
    fn test_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();
        let configs = ConfigStore::new(&store);

        assert_eq!(configs.read().unwrap(), None);

        let config = Config::default().merged(&PartialConfig {
            payload_limit: Some(12),
            ..Default::default()
        });
        configs.write(&config).unwrap();
        assert_eq!(configs.read().unwrap(), Some(config));
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();
        store.write(CONFIG_KEY, b"\x00not json").unwrap();

        let config = ConfigStore::new(&store).load_or_default().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();
        store.write(CONFIG_KEY, br#"{"PAYLOAD_LIMIT": 7}"#).unwrap();

        let config = ConfigStore::new(&store).load_or_default().unwrap();
        assert_eq!(config.payload_limit, 7);
        assert_eq!(config.max_offset, 1440);
    }
}
