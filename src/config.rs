use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use mac_address::MacAddress;
use serde_derive::Deserialize;

pub const DEFAULT_DETECTION_TIME: u64 = 500;
pub const DEFAULT_SITE: &str = "default";
pub const DEFAULT_REGISTRY_PATH: &str = "unifi-presence-registry.json";

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub controller: Option<ControllerConfig>,
    pub tracking: Option<TrackingOptions>,
    pub registry: Option<RegistryConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn site(&self) -> String {
        self.controller
            .as_ref()
            .and_then(|c| c.site.clone())
            .unwrap_or_else(|| DEFAULT_SITE.to_string())
    }

    pub fn registry_path(&self) -> String {
        self.registry
            .as_ref()
            .and_then(|r| r.path.clone())
            .unwrap_or_else(|| DEFAULT_REGISTRY_PATH.to_string())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    /// Site the controller bridge reports for; prefixes every unique id.
    pub site: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RegistryConfig {
    pub path: Option<String>,
}

/// Options deciding which entities exist and how their presence is judged.
/// Also accepted at runtime as JSON on the options topic.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingOptions {
    pub track_clients: bool,
    pub track_wired_clients: bool,
    pub track_devices: bool,
    /// Wireless clients are only tracked on these SSIDs; empty means all.
    pub ssid_filter: HashSet<String>,
    pub block_client: HashSet<MacAddress>,
    /// Clients tracked even when the other options would exclude them.
    pub client_source: HashSet<MacAddress>,
    /// Seconds since a client was last seen before it is considered away.
    pub detection_time: u64,
    pub ignore_wired_bug: bool,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        TrackingOptions {
            track_clients: true,
            track_wired_clients: true,
            track_devices: true,
            ssid_filter: HashSet::new(),
            block_client: HashSet::new(),
            client_source: HashSet::new(),
            detection_time: DEFAULT_DETECTION_TIME,
            ignore_wired_bug: false,
        }
    }
}

impl TrackingOptions {
    pub fn detection_time(&self) -> Duration {
        Duration::from_secs(self.detection_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [controller]
            site = "site_id"

            [tracking]
            ssid_filter = ["ssid"]
            block_client = ["00:00:00:00:00:02"]
            detection_time = 300
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.mqtt.host == "localhost");
        assert_eq!(config.site(), "site_id");
        assert_eq!(config.registry_path(), DEFAULT_REGISTRY_PATH);

        let tracking = config.tracking.unwrap();
        assert!(tracking.track_clients);
        assert!(tracking.ssid_filter.contains("ssid"));
        assert!(
            tracking
                .block_client
                .contains(&"00:00:00:00:00:02".parse::<MacAddress>().unwrap())
        );
        assert_eq!(tracking.detection_time(), Duration::from_secs(300));
        assert!(!tracking.ignore_wired_bug);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: AppConfig = toml::de::from_str("[mqtt]\nhost = \"broker\"\n").unwrap();
        assert_eq!(config.site(), DEFAULT_SITE);
        assert!(config.tracking.is_none());

        let defaults = TrackingOptions::default();
        assert_eq!(defaults.detection_time, DEFAULT_DETECTION_TIME);
        assert!(defaults.track_wired_clients && defaults.track_devices);
    }

    #[test]
    fn test_options_from_json() {
        let options: TrackingOptions =
            serde_json::from_str(r#"{"track_clients": false, "ssid_filter": []}"#).unwrap();
        assert!(!options.track_clients);
        assert!(options.track_devices);
        assert!(options.ssid_filter.is_empty());
    }
}
