//! Device configuration from environment variables or a JSON file

use std::path::Path;
use std::time::Duration;

use miya_protocol::transport::{ReconnectPolicy, TransportConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::DeviceError;

/// Settings for one MIYA device behind an RS-485 bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    /// RS-485 bus address of the controller
    #[serde(deserialize_with = "deserialize_address")]
    pub address: u8,
    pub connect_timeout_secs: u64,
    pub keepalive: bool,
    pub keepalive_interval_secs: u64,
    /// 0 disables automatic reconnection
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_step_secs: u64,
    pub reconnect_backoff_max_secs: u64,
    pub queue_capacity: usize,
    /// Send a status query after every (re)connect
    pub query_on_connect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let reconnect = ReconnectPolicy::default();
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            address: 0x01,
            connect_timeout_secs: 10,
            keepalive: true,
            keepalive_interval_secs: 30,
            max_reconnect_attempts: reconnect.max_attempts,
            reconnect_backoff_step_secs: reconnect.backoff_step.as_secs(),
            reconnect_backoff_max_secs: reconnect.max_backoff.as_secs(),
            queue_capacity: miya_protocol::queue::DEFAULT_CAPACITY,
            query_on_connect: true,
        }
    }
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Load from `MIYA_*` environment variables; unset ones keep defaults
    pub fn from_env() -> Result<Self, DeviceError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, DeviceError> {
        let mut config = Self::default();

        if let Some(host) = get("MIYA_HOST") {
            config.host = host;
        }
        if let Some(v) = get("MIYA_PORT") {
            config.port = parse_number("MIYA_PORT", &v)?;
        }
        if let Some(v) = get("MIYA_ADDRESS") {
            config.address = parse_address(&v)?;
        }
        if let Some(v) = get("MIYA_CONNECT_TIMEOUT") {
            config.connect_timeout_secs = parse_number("MIYA_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MIYA_KEEPALIVE") {
            config.keepalive = parse_bool("MIYA_KEEPALIVE", &v)?;
        }
        if let Some(v) = get("MIYA_KEEPALIVE_INTERVAL") {
            config.keepalive_interval_secs = parse_number("MIYA_KEEPALIVE_INTERVAL", &v)?;
        }
        if let Some(v) = get("MIYA_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse_number("MIYA_MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("MIYA_RECONNECT_BACKOFF_STEP") {
            config.reconnect_backoff_step_secs =
                parse_number("MIYA_RECONNECT_BACKOFF_STEP", &v)?;
        }
        if let Some(v) = get("MIYA_RECONNECT_BACKOFF_MAX") {
            config.reconnect_backoff_max_secs = parse_number("MIYA_RECONNECT_BACKOFF_MAX", &v)?;
        }
        if let Some(v) = get("MIYA_QUEUE_CAPACITY") {
            config.queue_capacity = parse_number("MIYA_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("MIYA_QUERY_ON_CONNECT") {
            config.query_on_connect = parse_bool("MIYA_QUERY_ON_CONNECT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; missing keys keep defaults
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .map_err(|source| DeviceError::ConfigIo {
                path: path.display().to_string(),
                source,
            })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| DeviceError::ConfigJson {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        tracing::info!("Loaded device config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.host.trim().is_empty() {
            return Err(DeviceError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(DeviceError::Config("port must not be 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(DeviceError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(DeviceError::Config(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.keepalive && self.keepalive_interval_secs == 0 {
            return Err(DeviceError::Config(
                "keepalive_interval_secs must be positive".to_string(),
            ));
        }
        if self.max_reconnect_attempts > 0 && self.reconnect_backoff_step_secs == 0 {
            return Err(DeviceError::Config(
                "reconnect_backoff_step_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive: self.keepalive,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            reconnect: ReconnectPolicy {
                max_attempts: self.max_reconnect_attempts,
                backoff_step: Duration::from_secs(self.reconnect_backoff_step_secs),
                max_backoff: Duration::from_secs(self.reconnect_backoff_max_secs),
            },
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Parse a bus address written as hex, with or without a `0x` prefix
pub fn parse_address(value: &str) -> Result<u8, DeviceError> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u8::from_str_radix(digits, 16)
        .map_err(|e| DeviceError::Config(format!("invalid device address {value:?}: {e}")))
}

fn deserialize_address<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Address {
        Number(u8),
        Hex(String),
    }

    match Address::deserialize(deserializer)? {
        Address::Number(n) => Ok(n),
        Address::Hex(s) => parse_address(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, DeviceError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DeviceError::Config(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DeviceError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DeviceError::Config(format!(
            "{key}={value:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::new("10.0.0.5");
        assert_eq!(config.port, 38);
        assert_eq!(config.address, 0x01);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_backoff_step_secs, 2);
        assert_eq!(config.reconnect_backoff_max_secs, 30);
        assert_eq!(config.queue_capacity, 100);
        assert!(config.keepalive);
        assert!(config.query_on_connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars() {
        let config = DeviceConfig::from_vars(vars(&[
            ("MIYA_HOST", "bridge.local"),
            ("MIYA_PORT", "8899"),
            ("MIYA_ADDRESS", "0x2A"),
            ("MIYA_KEEPALIVE", "off"),
            ("MIYA_MAX_RECONNECT_ATTEMPTS", "3"),
            ("MIYA_QUERY_ON_CONNECT", "false"),
        ]))
        .unwrap();

        assert_eq!(config.host, "bridge.local");
        assert_eq!(config.port, 8899);
        assert_eq!(config.address, 0x2A);
        assert!(!config.keepalive);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(!config.query_on_connect);
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn test_from_vars_rejects_bad_values() {
        assert!(DeviceConfig::from_vars(vars(&[])).is_err());
        assert!(DeviceConfig::from_vars(vars(&[("MIYA_HOST", "h"), ("MIYA_PORT", "x")])).is_err());
        assert!(
            DeviceConfig::from_vars(vars(&[("MIYA_HOST", "h"), ("MIYA_ADDRESS", "1FF")])).is_err()
        );
        assert!(
            DeviceConfig::from_vars(vars(&[("MIYA_HOST", "h"), ("MIYA_KEEPALIVE", "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("01").unwrap(), 0x01);
        assert_eq!(parse_address("0x01").unwrap(), 0x01);
        assert_eq!(parse_address(" ff ").unwrap(), 0xFF);
        assert!(parse_address("").is_err());
        assert!(parse_address("0x100").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = DeviceConfig::new("h");
        config.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(DeviceError::Config(_))));

        let mut config = DeviceConfig::new("h");
        config.keepalive_interval_secs = 0;
        assert!(config.validate().is_err());
        config.keepalive = false;
        assert!(config.validate().is_ok());

        let mut config = DeviceConfig::new("h");
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_config() {
        let mut config = DeviceConfig::new("h");
        config.reconnect_backoff_step_secs = 3;
        let transport = config.transport_config();
        assert_eq!(transport.addr(), "h:38");
        assert_eq!(transport.connect_timeout, Duration::from_secs(10));
        assert_eq!(transport.reconnect.backoff_step, Duration::from_secs(3));
        assert_eq!(transport.reconnect.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("miya-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "host": "192.168.1.40", "address": "0x03", "keepalive": false }"#)
            .await
            .unwrap();

        let config = DeviceConfig::from_json_file(&path).await.unwrap();
        assert_eq!(config.host, "192.168.1.40");
        assert_eq!(config.address, 0x03);
        assert!(!config.keepalive);
        assert_eq!(config.port, 38);

        fs::write(&path, r#"{ "host": "h", "address": 7 }"#).await.unwrap();
        assert_eq!(DeviceConfig::from_json_file(&path).await.unwrap().address, 7);

        fs::write(&path, "{ not json").await.unwrap();
        assert!(matches!(
            DeviceConfig::from_json_file(&path).await,
            Err(DeviceError::ConfigJson { .. })
        ));

        fs::remove_file(&path).await.unwrap();
        assert!(matches!(
            DeviceConfig::from_json_file(&path).await,
            Err(DeviceError::ConfigIo { .. })
        ));
    }
}
