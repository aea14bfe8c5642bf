//! ---
//! skyr_section: "01-core-functionality"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Reflector configuration model, defaults, loading, and validation."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

/// Default TCP port of the Alpaca REST API.
pub const DEFAULT_API_PORT: u16 = 11111;
/// Default UDP port of the Alpaca discovery protocol.
pub const DEFAULT_DISCOVERY_PORT: u16 = 32227;
/// Server name reported by the management API when none is configured.
pub const DEFAULT_SERVER_NAME: &str = "skyr ASCOM Reflector";
/// Manufacturer reported by the management API when none is configured.
pub const DEFAULT_MANUFACTURER: &str = "skyr Observatory Systems";
/// Location reported by the management API when none is configured.
pub const DEFAULT_LOCATION: &str = "Observatory";

fn default_listen_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_API_PORT))
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_owned()
}

fn default_manufacturer() -> String {
    DEFAULT_MANUFACTURER.to_owned()
}

fn default_manufacturer_version() -> String {
    "1.0.0".to_owned()
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_owned()
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_realm() -> String {
    "ASCOM Alpaca Server".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_owned()]
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|method| (*method).to_owned())
        .collect()
}

fn default_allowed_headers() -> Vec<String> {
    vec!["*".to_owned()]
}

fn default_max_age() -> u64 {
    3600
}

fn default_tls_min_version() -> String {
    "1.2".to_owned()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_qos() -> u8 {
    1
}

fn default_topic_prefix() -> String {
    "ascom".to_owned()
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Configuration problems detected before the reflector starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The device list is empty.
    #[error("at least one device must be configured")]
    NoDevices,
    /// A device entry lacks its ASCOM type.
    #[error("device {index}: type is required")]
    MissingDeviceType {
        /// Position of the entry in the device list.
        index: usize,
    },
    /// Two entries share the same `(type, number)` pair.
    #[error("duplicate device: {device_type}-{device_number}")]
    DuplicateDevice {
        /// Normalised device type.
        device_type: String,
        /// Device number.
        device_number: u32,
    },
    /// A network-backed device has no remote server.
    #[error("device {device_type}-{device_number}: network backend requires server_url")]
    MissingServerUrl {
        /// Normalised device type.
        device_type: String,
        /// Device number.
        device_number: u32,
    },
    /// Authentication is on without credentials.
    #[error("authentication is enabled but no username is configured")]
    MissingCredentials,
    /// TLS is on without the named file.
    #[error("tls is enabled but {0} is not set")]
    MissingTlsFile(&'static str),
    /// TLS termination was requested from the reflector itself.
    #[error("tls termination is not handled by the reflector; terminate TLS in a fronting proxy")]
    TlsUnsupported,
    /// MQTT QoS outside 0..=2.
    #[error("mqtt qos must be 0, 1 or 2 (got {0})")]
    InvalidQos(u8),
    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Top-level configuration for the reflector daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub authentication: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Metadata describing where a [`ReflectorConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ReflectorConfig,
    pub source: PathBuf,
}

impl ReflectorConfig {
    pub const ENV_CONFIG_PATH: &'static str = "SKYR_CONFIG";

    /// Load configuration from disk, respecting the `SKYR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single file. YAML is selected by extension, TOML otherwise.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: ReflectorConfig = if is_yaml {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen = HashSet::with_capacity(self.devices.len());
        for (index, device) in self.devices.iter().enumerate() {
            let device_type = device.normalized_type();
            if device_type.is_empty() {
                return Err(ConfigError::MissingDeviceType { index });
            }
            if !seen.insert((device_type.clone(), device.number)) {
                return Err(ConfigError::DuplicateDevice {
                    device_type,
                    device_number: device.number,
                });
            }
            let has_server = device
                .backend
                .server_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty());
            if device.effective_mode(self.backend.mode) == BackendMode::Network && !has_server {
                return Err(ConfigError::MissingServerUrl {
                    device_type,
                    device_number: device.number,
                });
            }
        }

        if self.authentication.enabled && self.authentication.username.trim().is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        self.tls.validate()?;
        if self.backend.mqtt.qos > 2 {
            return Err(ConfigError::InvalidQos(self.backend.mqtt.qos));
        }
        if self.server.write_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("server.write_timeout"));
        }
        self.engine.validate()
    }
}

impl std::str::FromStr for ReflectorConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ReflectorConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// HTTP and discovery listener settings plus the server identity.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Port placed in discovery replies; the bound HTTP port when unset.
    #[serde(default)]
    pub advertised_port: Option<u16>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_manufacturer_version")]
    pub manufacturer_version: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub write_timeout: Duration,
    #[serde(default = "default_idle_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_timeout: Duration,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            discovery_port: default_discovery_port(),
            advertised_port: None,
            server_name: default_server_name(),
            manufacturer: default_manufacturer(),
            manufacturer_version: default_manufacturer_version(),
            location: default_location(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            idle_timeout: default_idle_timeout(),
            shutdown_timeout: default_io_timeout(),
        }
    }
}

/// HTTP Basic authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
            realm: default_realm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age")]
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: default_allowed_origins(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: default_allowed_headers(),
            allow_credentials: false,
            max_age: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_tls_min_version")]
    pub min_version: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            min_version: default_tls_min_version(),
        }
    }
}

impl TlsConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_file.is_none() {
            return Err(ConfigError::MissingTlsFile("cert_file"));
        }
        if self.key_file.is_none() {
            return Err(ConfigError::MissingTlsFile("key_file"));
        }
        Ok(())
    }
}

/// Transport strategy used to realise a virtual device.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Network,
    Mqtt,
    Direct,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Network => "network",
            BackendMode::Mqtt => "mqtt",
            BackendMode::Direct => "direct",
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "network" => Ok(BackendMode::Network),
            "mqtt" => Ok(BackendMode::Mqtt),
            "direct" => Ok(BackendMode::Direct),
            other => Err(format!("unknown backend mode: {}", other)),
        }
    }
}

/// Server-wide backend defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
    #[serde(default)]
    pub network: NetworkBackendConfig,
    #[serde(default)]
    pub mqtt: MqttBackendConfig,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkBackendConfig {
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub default_timeout: Duration,
    #[serde(default = "default_retry_attempts")]
    pub default_retry_attempts: u32,
    /// Seconds; fractions allowed.
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_delay: Duration,
}

impl Default for NetworkBackendConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_io_timeout(),
            default_retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBackendConfig {
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub telescope_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for MqttBackendConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            telescope_id: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            timeout: default_io_timeout(),
            keep_alive: default_keep_alive(),
            qos: default_qos(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

/// One virtual device exposed by the reflector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub backend: DeviceBackendConfig,
}

impl DeviceConfig {
    /// Device type as used in Alpaca URLs (trimmed, lowercase).
    pub fn normalized_type(&self) -> String {
        self.device_type.trim().to_ascii_lowercase()
    }

    /// The device override when present, otherwise the server-wide mode.
    pub fn effective_mode(&self, server_default: BackendMode) -> BackendMode {
        self.backend.mode.unwrap_or(server_default)
    }
}

/// Per-device backend overrides. Only the fields of the effective mode are read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceBackendConfig {
    #[serde(default)]
    pub mode: Option<BackendMode>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub remote_type: Option<String>,
    #[serde(default)]
    pub remote_number: Option<u32>,
    #[serde(default)]
    pub telescope_id: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Device pool engine tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_discovery_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub discovery_timeout: Duration,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_health_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub health_check_interval: Duration,
}

impl EngineConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("engine.health_check_interval"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("engine.request_timeout"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            discovery_timeout: default_discovery_timeout(),
            request_timeout: default_io_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for daily rolling JSON logs; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}
