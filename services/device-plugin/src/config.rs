//! Configuration for the device plugin daemon.

use std::path::PathBuf;
use std::time::Duration;

use macvtap_link::observer::DEFAULT_RESUBSCRIBE_INTERVAL;
use macvtap_link::{MacvtapMode, NetNs};
use serde::Deserialize;

use crate::error::DiscoveryError;

/// Environment variable carrying the static resource configuration.
pub const CONFIG_ENV: &str = "DP_MACVTAP_CONF";

/// Capacity used when a resource does not set one.
pub const DEFAULT_CAPACITY: u32 = 100;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Static resource configuration (JSON), if any.
    pub resources: Option<String>,

    /// Namespace the daemon creates interfaces in and watches.
    pub netns_path: PathBuf,

    /// Delay between link event resubscription attempts.
    pub resubscribe_interval: Duration,

    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let resources = std::env::var(CONFIG_ENV).ok();

        let netns_path = std::env::var("MACVTAP_NETNS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| NetNs::main_thread_path());

        let resubscribe_interval = std::env::var("MACVTAP_RESUBSCRIBE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RESUBSCRIBE_INTERVAL);

        let log_level = std::env::var("MACVTAP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self {
            resources,
            netns_path,
            resubscribe_interval,
            log_level,
        }
    }
}

/// One statically configured resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    pub name: String,
    pub lower_device: String,
    pub mode: MacvtapMode,
    pub capacity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResourceConfig {
    name: String,
    #[serde(default)]
    lower_device: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    capacity: i64,
}

/// Parse `[{name, lowerDevice, mode, capacity}, ...]`.
///
/// A missing or non-positive capacity becomes [`DEFAULT_CAPACITY`], a missing
/// mode becomes bridge and a missing lower device defaults to the resource
/// name. Unknown modes are rejected.
pub fn parse_resource_config(raw: &str) -> Result<Vec<ResourceConfig>, DiscoveryError> {
    let entries: Vec<RawResourceConfig> =
        serde_json::from_str(raw).map_err(|e| DiscoveryError::ConfigParse(e.to_string()))?;

    entries
        .into_iter()
        .map(|entry| {
            let mode = entry
                .mode
                .parse()
                .map_err(|e: macvtap_link::LinkError| DiscoveryError::ConfigParse(e.to_string()))?;
            let capacity = match u32::try_from(entry.capacity) {
                Ok(0) | Err(_) => DEFAULT_CAPACITY,
                Ok(n) => n,
            };
            let lower_device = if entry.lower_device.is_empty() {
                entry.name.clone()
            } else {
                entry.lower_device
            };
            Ok(ResourceConfig {
                name: entry.name,
                lower_device,
                mode,
                capacity,
            })
        })
        .collect()
}

/// A configuration snapshot pushed to discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// New raw configuration. Empty means no static configuration.
    Updated(String),
    /// The configuration object was removed or its watch failed.
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_full_entry() {
        let configs = parse_resource_config(
            r#"[{"name":"dataplane","lowerDevice":"eth0","mode":"vepa","capacity":30}]"#,
        )
        .unwrap();
        assert_eq!(
            configs,
            vec![ResourceConfig {
                name: "dataplane".into(),
                lower_device: "eth0".into(),
                mode: MacvtapMode::Vepa,
                capacity: 30,
            }]
        );
    }

    #[rstest]
    #[case(r#"[{"name":"a","lowerDevice":"eth0"}]"#, MacvtapMode::Bridge, 100)]
    #[case(r#"[{"name":"a","lowerDevice":"eth0","mode":"","capacity":0}]"#, MacvtapMode::Bridge, 100)]
    #[case(r#"[{"name":"a","lowerDevice":"eth0","mode":"private","capacity":-5}]"#, MacvtapMode::Private, 100)]
    #[case(r#"[{"name":"a","lowerDevice":"eth0","capacity":7}]"#, MacvtapMode::Bridge, 7)]
    fn test_parse_defaults(
        #[case] raw: &str,
        #[case] mode: MacvtapMode,
        #[case] capacity: u32,
    ) {
        let configs = parse_resource_config(raw).unwrap();
        assert_eq!(configs[0].mode, mode);
        assert_eq!(configs[0].capacity, capacity);
    }

    #[test]
    fn test_lower_device_defaults_to_name() {
        let configs = parse_resource_config(r#"[{"name":"eth1"}]"#).unwrap();
        assert_eq!(configs[0].lower_device, "eth1");
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"name":"a"}"#)]
    #[case(r#"[{"lowerDevice":"eth0"}]"#)]
    #[case(r#"[{"name":"a","mode":"passthru"}]"#)]
    fn test_parse_rejects(#[case] raw: &str) {
        assert!(matches!(
            parse_resource_config(raw),
            Err(DiscoveryError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_empty_array() {
        assert!(parse_resource_config("[]").unwrap().is_empty());
    }
}
