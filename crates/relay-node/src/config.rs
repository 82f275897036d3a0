//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so the node starts with zero configuration
//! for local development.

use std::path::PathBuf;
use std::time::Duration;

use relay_shared::RecipientId;
use relay_store::StoreOptions;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the database file set.
    /// Env: `RELAY_DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Recipient id of the account this node stores messages for.
    /// Env: `RELAY_LOCAL_ID`
    /// Default: `local`
    pub local_id: RecipientId,

    /// How often expired disappearing messages are swept.
    /// Env: `RELAY_SWEEP_INTERVAL_SECS`
    /// Default: `5`
    pub sweep_interval: Duration,

    /// Per-subscriber notification queue length.
    /// Env: `RELAY_NOTIFICATION_CAPACITY`
    /// Default: `256`
    pub notification_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            local_id: RecipientId::from("local"),
            sweep_interval: Duration::from_secs(5),
            notification_capacity: StoreOptions::default().notification_capacity,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("RELAY_DATA_DIR").filter(|d| !d.is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(id) = lookup("RELAY_LOCAL_ID") {
            let id = id.trim();
            if id.is_empty() {
                tracing::warn!("Empty RELAY_LOCAL_ID, using default");
            } else {
                config.local_id = RecipientId::from(id);
            }
        }

        if let Some(val) = lookup("RELAY_SWEEP_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.sweep_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid RELAY_SWEEP_INTERVAL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("RELAY_NOTIFICATION_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.notification_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid RELAY_NOTIFICATION_CAPACITY, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            notification_capacity: self.notification_capacity,
            ..StoreOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> NodeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]);
        assert!(config.data_dir.is_none());
        assert_eq!(config.local_id.as_str(), "local");
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_values_are_read() {
        let config = load(&[
            ("RELAY_DATA_DIR", "/tmp/relay"),
            ("RELAY_LOCAL_ID", " me "),
            ("RELAY_SWEEP_INTERVAL_SECS", "30"),
            ("RELAY_NOTIFICATION_CAPACITY", "8"),
        ]);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/relay")));
        assert_eq!(config.local_id.as_str(), "me");
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.store_options().notification_capacity, 8);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("RELAY_SWEEP_INTERVAL_SECS", "0"),
            ("RELAY_NOTIFICATION_CAPACITY", "lots"),
        ]);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.notification_capacity, 256);
    }
}
