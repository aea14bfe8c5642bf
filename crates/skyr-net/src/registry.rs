//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Virtual device registry built from configuration."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Every configured device becomes one [`VirtualDevice`] keyed by its
//! lower-case type and number. The backend is fixed at construction; only the
//! connection flag, the refresh timestamp, and the value cache change later.
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use skyr_common::{BackendMode, ConfigError, DeviceConfig, ReflectorConfig};
use skyr_msg::QoS;
use uuid::Uuid;

/// Version reported by `driverversion`.
pub const DRIVER_VERSION: &str = "1.0.0";

/// `(type, number)` identity of a virtual device. The type is stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub device_type: String,
    pub device_number: u32,
}

impl DeviceKey {
    pub fn new(device_type: &str, device_number: u32) -> Self {
        Self {
            device_type: device_type.trim().to_ascii_lowercase(),
            device_number,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device_type, self.device_number)
    }
}

/// Alpaca interface version implemented for a device type.
pub fn interface_version(device_type: &str) -> i32 {
    match device_type.to_ascii_lowercase().as_str() {
        "telescope" | "camera" | "focuser" => 3,
        "dome" | "filterwheel" | "rotator" | "switch" => 2,
        _ => 1,
    }
}

/// Stable identifier derived from the device identity when none is configured.
pub fn derive_unique_id(device_type: &str, device_number: u32) -> String {
    let name = format!("{}-{}", device_type.to_ascii_lowercase(), device_number);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkTarget {
    pub server_url: String,
    pub remote_type: String,
    pub remote_number: u32,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttTarget {
    pub broker: String,
    pub telescope_id: Option<String>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub qos: QoS,
    pub topic_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectTarget {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub protocol: Option<String>,
}

/// How a virtual device reaches the real hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendDescriptor {
    Network(NetworkTarget),
    Mqtt(MqttTarget),
    Direct(DirectTarget),
}

impl BackendDescriptor {
    pub fn mode(&self) -> BackendMode {
        match self {
            BackendDescriptor::Network(_) => BackendMode::Network,
            BackendDescriptor::Mqtt(_) => BackendMode::Mqtt,
            BackendDescriptor::Direct(_) => BackendMode::Direct,
        }
    }

    fn from_config(device: &DeviceConfig, config: &ReflectorConfig) -> Self {
        let overrides = &device.backend;
        match device.effective_mode(config.backend.mode) {
            BackendMode::Network => {
                let defaults = &config.backend.network;
                BackendDescriptor::Network(NetworkTarget {
                    server_url: overrides
                        .server_url
                        .clone()
                        .unwrap_or_default()
                        .trim_end_matches('/')
                        .to_owned(),
                    remote_type: overrides
                        .remote_type
                        .clone()
                        .unwrap_or_else(|| device.normalized_type()),
                    remote_number: overrides.remote_number.unwrap_or(device.number),
                    timeout: defaults.default_timeout,
                    retry_attempts: defaults.default_retry_attempts,
                    retry_delay: defaults.retry_delay,
                })
            }
            BackendMode::Mqtt => {
                let mqtt = &config.backend.mqtt;
                let telescope_id = overrides
                    .telescope_id
                    .clone()
                    .or_else(|| Some(mqtt.telescope_id.clone()))
                    .filter(|id| !id.is_empty());
                BackendDescriptor::Mqtt(MqttTarget {
                    broker: mqtt.broker.clone(),
                    telescope_id,
                    client_id: mqtt.client_id.clone(),
                    username: mqtt.username.clone(),
                    password: mqtt.password.clone(),
                    timeout: mqtt.timeout,
                    keep_alive: mqtt.keep_alive,
                    qos: QoS::try_from(mqtt.qos).unwrap_or_default(),
                    topic_prefix: mqtt.topic_prefix.clone(),
                })
            }
            BackendMode::Direct => BackendDescriptor::Direct(DirectTarget {
                port: overrides.port.clone(),
                baud_rate: overrides.baud_rate,
                protocol: overrides.protocol.clone(),
            }),
        }
    }
}

/// A device as presented to Alpaca clients.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    pub key: DeviceKey,
    /// Type as written in configuration, used for display.
    pub device_type: String,
    pub name: String,
    pub description: String,
    pub driver_info: String,
    pub driver_version: String,
    pub interface_version: i32,
    pub unique_id: String,
    pub backend: BackendDescriptor,
    pub connected: bool,
    pub last_update: DateTime<Utc>,
    pub state_cache: BTreeMap<String, Value>,
}

impl VirtualDevice {
    fn from_config(device: &DeviceConfig, config: &ReflectorConfig) -> Self {
        let server_name = &config.server.server_name;
        let device_type = device.device_type.trim().to_owned();
        let key = DeviceKey::new(&device_type, device.number);
        let name = device
            .name
            .clone()
            .unwrap_or_else(|| format!("{} #{}", device_type, device.number));
        let description = device
            .description
            .clone()
            .unwrap_or_else(|| format!("{} {}", server_name, device_type));
        let unique_id = device
            .unique_id
            .clone()
            .unwrap_or_else(|| derive_unique_id(&key.device_type, key.device_number));
        Self {
            interface_version: interface_version(&key.device_type),
            driver_info: format!("{} - {} Driver", server_name, device_type),
            driver_version: DRIVER_VERSION.to_owned(),
            backend: BackendDescriptor::from_config(device, config),
            key,
            device_type,
            name,
            description,
            unique_id,
            connected: false,
            last_update: Utc::now(),
            state_cache: BTreeMap::new(),
        }
    }
}

/// Configured devices in declaration order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<IndexMap<DeviceKey, VirtualDevice>>,
}

impl DeviceRegistry {
    /// Build the registry, rejecting configurations that fail validation.
    pub fn from_config(config: &ReflectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let devices = config
            .devices
            .iter()
            .map(|device| {
                let virtual_device = VirtualDevice::from_config(device, config);
                (virtual_device.key.clone(), virtual_device)
            })
            .collect();
        Ok(Self {
            devices: RwLock::new(devices),
        })
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.read().contains_key(key)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<VirtualDevice> {
        self.devices.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<VirtualDevice> {
        self.devices.read().values().cloned().collect()
    }

    pub fn set_connected(&self, key: &DeviceKey, connected: bool) {
        if let Some(device) = self.devices.write().get_mut(key) {
            device.connected = connected;
            device.last_update = Utc::now();
        }
    }

    /// Remember the last value read for `member`.
    pub fn record_value(&self, key: &DeviceKey, member: &str, value: Value) {
        if let Some(device) = self.devices.write().get_mut(key) {
            device.state_cache.insert(member.to_owned(), value);
            device.last_update = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyr_common::DeviceBackendConfig;

    fn config() -> ReflectorConfig {
        let mut config = ReflectorConfig::default();
        config.devices = vec![
            DeviceConfig {
                device_type: "Telescope".into(),
                number: 0,
                backend: DeviceBackendConfig {
                    server_url: Some("http://mount.local:11111/".into()),
                    ..DeviceBackendConfig::default()
                },
                ..DeviceConfig::default()
            },
            DeviceConfig {
                device_type: "camera".into(),
                number: 2,
                name: Some("Guide camera".into()),
                unique_id: Some("cam-guide".into()),
                backend: DeviceBackendConfig {
                    mode: Some(BackendMode::Direct),
                    port: Some("/dev/ttyUSB0".into()),
                    ..DeviceBackendConfig::default()
                },
                ..DeviceConfig::default()
            },
        ];
        config
    }

    #[test]
    fn devices_are_keyed_case_insensitively_in_order() {
        let registry = DeviceRegistry::from_config(&config()).unwrap();
        assert_eq!(registry.len(), 2);
        let mount = registry.get(&DeviceKey::new("TELESCOPE", 0)).unwrap();
        assert_eq!(mount.device_type, "Telescope");
        assert_eq!(mount.interface_version, 3);
        assert_eq!(mount.driver_version, DRIVER_VERSION);
        assert_eq!(
            mount.driver_info,
            format!("{} - Telescope Driver", skyr_common::DEFAULT_SERVER_NAME)
        );
        let order: Vec<String> = registry.list().iter().map(|d| d.key.to_string()).collect();
        assert_eq!(order, vec!["telescope-0", "camera-2"]);
    }

    #[test]
    fn network_target_defaults_to_local_identity() {
        let registry = DeviceRegistry::from_config(&config()).unwrap();
        let mount = registry.get(&DeviceKey::new("telescope", 0)).unwrap();
        let BackendDescriptor::Network(target) = mount.backend else {
            panic!("expected a network backend");
        };
        assert_eq!(target.server_url, "http://mount.local:11111");
        assert_eq!(target.remote_type, "telescope");
        assert_eq!(target.remote_number, 0);
        assert_eq!(target.retry_attempts, 3);
    }

    #[test]
    fn unique_ids_are_stable_or_configured() {
        let registry = DeviceRegistry::from_config(&config()).unwrap();
        let mount = registry.get(&DeviceKey::new("telescope", 0)).unwrap();
        assert_eq!(mount.unique_id, derive_unique_id("telescope", 0));
        assert_eq!(derive_unique_id("Telescope", 0), derive_unique_id("telescope", 0));
        assert_ne!(derive_unique_id("telescope", 0), derive_unique_id("telescope", 1));
        let camera = registry.get(&DeviceKey::new("camera", 2)).unwrap();
        assert_eq!(camera.unique_id, "cam-guide");
        assert_eq!(camera.backend.mode(), BackendMode::Direct);
    }

    #[test]
    fn interface_versions_follow_device_family() {
        assert_eq!(interface_version("dome"), 2);
        assert_eq!(interface_version("SafetyMonitor"), 1);
        assert_eq!(interface_version("coffee-machine"), 1);
    }

    #[test]
    fn mutable_state_is_tracked() {
        let registry = DeviceRegistry::from_config(&config()).unwrap();
        let key = DeviceKey::new("camera", 2);
        registry.set_connected(&key, true);
        registry.record_value(&key, "ccdtemperature", serde_json::json!(-10.5));
        let camera = registry.get(&key).unwrap();
        assert!(camera.connected);
        assert_eq!(camera.state_cache["ccdtemperature"], serde_json::json!(-10.5));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert_eq!(
            DeviceRegistry::from_config(&ReflectorConfig::default()).unwrap_err(),
            ConfigError::NoDevices
        );
    }
}
