//! Gateway configuration
//!
//! Configuration comes from three layers: built-in defaults, an optional
//! YAML file, and environment variables, with the environment taking
//! precedence so deployments can override a shared file per instance.
//! A `.env` file is loaded into the environment at startup before any of
//! this runs.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::vad::{AggregationPolicy, VadConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
}

/// A string that must not leak into logs. The value is wiped on drop and
/// the Debug form is redacted; access goes through [`Secret::expose`].
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// UDP audio listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub host: String,
    pub port: u16,
    /// Host devices are told to send audio to in the hello ack. Usually
    /// the gateway's public address, not the bind address.
    pub advertise_host: String,
    /// Bounce decrypted audio straight back as ack packets instead of
    /// feeding the pipeline. For device-side loopback testing.
    pub echo_mode: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8888,
            advertise_host: "127.0.0.1".to_owned(),
            echo_mode: false,
        }
    }
}

impl UdpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Control-plane broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub client_id: String,
    pub keepalive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 1883,
            username: None,
            password: None,
            client_id: "voxgate".to_owned(),
            keepalive_secs: 90,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are removed by the sweeper.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// The protocol version current device firmware speaks.
const DEFAULT_PROTOCOL_VERSION: u32 = 3;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub udp: UdpConfig,
    pub mqtt: MqttConfig,
    pub vad: VadConfig,
    pub session: SessionConfig,
    /// Bearer token WebSocket devices must present.
    pub access_token: Secret,
    /// Protocol version devices must declare, in both the MQTT hello and
    /// the WebSocket Protocol-Version header.
    pub protocol_version: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            udp: UdpConfig::default(),
            mqtt: MqttConfig::default(),
            vad: VadConfig::default(),
            session: SessionConfig::default(),
            access_token: Secret::default(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from defaults and environment variables.
    ///
    /// # Errors
    /// Returns an error when an environment variable fails to parse or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment
    /// variable overrides.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, an
    /// environment variable fails to parse, or validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = read_env("HTTP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env("HTTP_PORT")? {
            self.server.port = port;
        }

        if let Some(host) = read_env("UDP_HOST") {
            self.udp.host = host;
        }
        if let Some(port) = parse_env("UDP_PORT")? {
            self.udp.port = port;
        }
        if let Some(host) = read_env("UDP_ADVERTISE_HOST") {
            self.udp.advertise_host = host;
        }
        if let Some(echo) = parse_bool_env("UDP_ECHO_MODE")? {
            self.udp.echo_mode = echo;
        }

        if let Some(host) = read_env("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = parse_env("MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(username) = read_env("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = read_env("MQTT_PASSWORD") {
            self.mqtt.password = Some(password.into());
        }
        if let Some(client_id) = read_env("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(keepalive) = parse_env("MQTT_KEEPALIVE_SECS")? {
            self.mqtt.keepalive_secs = keepalive;
        }

        if let Some(token) = read_env("ACCESS_TOKEN") {
            self.access_token = token.into();
        }
        if let Some(version) = parse_env("PROTOCOL_VERSION")? {
            self.protocol_version = version;
        }

        if let Some(threshold) = parse_env("VAD_ENERGY_THRESHOLD")? {
            self.vad.energy_threshold = threshold;
        }
        if let Some(value) = read_env("VAD_AGGREGATION") {
            self.vad.aggregation = match value.as_str() {
                "all-positive" => AggregationPolicy::AllPositive,
                "any-positive" => AggregationPolicy::AnyPositive,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "VAD_AGGREGATION".to_owned(),
                        value,
                    });
                }
            };
        }
        if let Some(blocks) = parse_env("VAD_SILENCE_HANG_BLOCKS")? {
            self.vad.silence_hang_blocks = blocks;
        }
        if let Some(timeout) = parse_env("VAD_UTTERANCE_TIMEOUT_MS")? {
            self.vad.utterance_timeout_ms = timeout;
        }

        if let Some(timeout) = parse_env("SESSION_IDLE_TIMEOUT_SECS")? {
            self.session.idle_timeout_secs = timeout;
        }
        if let Some(interval) = parse_env("SESSION_SWEEP_INTERVAL_SECS")? {
            self.session.sweep_interval_secs = interval;
        }
        Ok(())
    }

    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.is_empty() {
            return Err(ConfigError::Invalid(
                "ACCESS_TOKEN must be set for WebSocket authentication".to_owned(),
            ));
        }
        if self.protocol_version == 0 {
            return Err(ConfigError::Invalid(
                "protocol_version must be at least 1".to_owned(),
            ));
        }
        if self.mqtt.keepalive_secs == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.keepalive_secs must be at least 1".to_owned(),
            ));
        }
        if self.session.idle_timeout_secs == 0 || self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session timers must be at least 1 second".to_owned(),
            ));
        }
        self.vad
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match read_env(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_owned(),
                value,
            }),
        None => Ok(None),
    }
}

fn parse_bool_env(key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = read_env(key) else {
        return Ok(None);
    };
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_owned(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "HTTP_HOST",
        "HTTP_PORT",
        "UDP_HOST",
        "UDP_PORT",
        "UDP_ADVERTISE_HOST",
        "UDP_ECHO_MODE",
        "MQTT_HOST",
        "MQTT_PORT",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
        "MQTT_CLIENT_ID",
        "MQTT_KEEPALIVE_SECS",
        "ACCESS_TOKEN",
        "PROTOCOL_VERSION",
        "VAD_ENERGY_THRESHOLD",
        "VAD_AGGREGATION",
        "VAD_SILENCE_HANG_BLOCKS",
        "VAD_UTTERANCE_TIMEOUT_MS",
        "SESSION_IDLE_TIMEOUT_SECS",
        "SESSION_SWEEP_INTERVAL_SECS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = GatewayConfig::default();
        assert_eq!(config.server.address(), "0.0.0.0:8000");
        assert_eq!(config.udp.address(), "0.0.0.0:8888");
        assert_eq!(config.udp.advertise_host, "127.0.0.1");
        assert!(!config.udp.echo_mode);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive_secs, 90);
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.session.idle_timeout_secs, 300);
        // Defaults alone are not runnable: the token is required.
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_requires_token() {
        clear_env();
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::Invalid(_))
        ));

        unsafe { std::env::set_var("ACCESS_TOKEN", "test-token") };
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.access_token.expose(), "test-token");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("ACCESS_TOKEN", "tok");
            std::env::set_var("UDP_PORT", "9999");
            std::env::set_var("UDP_ECHO_MODE", "true");
            std::env::set_var("VAD_AGGREGATION", "any-positive");
            std::env::set_var("MQTT_PASSWORD", "hunter2");
        }
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.udp.port, 9999);
        assert!(config.udp.echo_mode);
        assert_eq!(config.vad.aggregation, AggregationPolicy::AnyPositive);
        assert_eq!(
            config.mqtt.password.as_ref().map(|p| p.expose()),
            Some("hunter2")
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_values_are_rejected() {
        clear_env();
        unsafe {
            std::env::set_var("ACCESS_TOKEN", "tok");
            std::env::set_var("UDP_ECHO_MODE", "banana");
        }
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::InvalidEnv { .. })
        ));

        unsafe {
            std::env::set_var("UDP_ECHO_MODE", "false");
            std::env::set_var("HTTP_PORT", "not-a-port");
        }
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::InvalidEnv { .. })
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_file_with_env_override() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.yaml");
        fs::write(
            &path,
            r#"
server:
  port: 9000
udp:
  advertise_host: "gateway.example.com"
vad:
  aggregation: any-positive
  silence_hang_blocks: 10
access_token: "file-token"
"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.udp.advertise_host, "gateway.example.com");
        assert_eq!(config.vad.silence_hang_blocks, 10);
        assert_eq!(config.access_token.expose(), "file-token");
        // Untouched sections keep their defaults.
        assert_eq!(config.udp.port, 8888);

        // Environment beats the file.
        unsafe { std::env::set_var("ACCESS_TOKEN", "env-token") };
        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.access_token.expose(), "env-token");
        clear_env();
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret: Secret = "super-sensitive".into();
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "super-sensitive");

        let config = GatewayConfig {
            access_token: "super-sensitive".into(),
            ..GatewayConfig::default()
        };
        assert!(!format!("{config:?}").contains("super-sensitive"));
    }
}
