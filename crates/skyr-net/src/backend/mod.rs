//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Device backend trait, per-backend metrics, and dispatch by descriptor."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use skyr_msg::{MessageBus, MqttBrokerBus};
use tracing::{info, warn};

use crate::error::DeviceError;
use crate::registry::{BackendDescriptor, DeviceKey, DeviceRegistry};

pub mod direct;
pub mod mqtt;
pub mod network;

pub use direct::DirectBackend;
pub use mqtt::MqttBackend;
pub use network::NetworkBackend;

/// Query or form parameters forwarded with an Alpaca call.
pub type Params = BTreeMap<String, String>;

/// Transport that carries Alpaca member reads and writes to real hardware.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn connect(&self) -> Result<(), DeviceError>;
    async fn disconnect(&self) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;
    async fn get(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError>;
    async fn put(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError>;
    async fn health_check(&self) -> Result<(), DeviceError>;
    fn metrics(&self) -> BackendMetrics;
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Error,
}

/// Snapshot of a backend's request statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average, 0.8 history / 0.2 latest sample.
    pub average_latency_ms: f64,
    pub last_request: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub connection_state: ConnectionState,
}

/// Shared metrics accumulator used by backend implementations.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: Mutex<BackendMetrics>,
}

impl MetricsRecorder {
    pub fn record(&self, started: Instant, outcome: Result<(), &DeviceError>) {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.inner.lock();
        metrics.average_latency_ms = if metrics.total_requests == 0 {
            latency_ms
        } else {
            metrics.average_latency_ms * 0.8 + latency_ms * 0.2
        };
        let now = Utc::now();
        metrics.total_requests += 1;
        metrics.last_request = Some(now);
        match outcome {
            Ok(()) => {
                metrics.successful_requests += 1;
                metrics.last_success = Some(now);
                metrics.connection_state = ConnectionState::Connected;
            }
            Err(err) => {
                metrics.failed_requests += 1;
                metrics.last_failure = Some(now);
                metrics.last_error = Some(err.to_string());
                if matches!(err, DeviceError::Unreachable(_) | DeviceError::NotConnected) {
                    metrics.connection_state = ConnectionState::Error;
                }
            }
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().connection_state = state;
    }

    pub fn snapshot(&self) -> BackendMetrics {
        self.inner.lock().clone()
    }
}

/// Owns one backend per virtual device, chosen from its descriptor.
pub struct Dispatcher {
    backends: RwLock<HashMap<DeviceKey, Arc<dyn DeviceBackend>>>,
}

impl Dispatcher {
    /// Build backends for every registered device. `bus` carries MQTT devices;
    /// without one they target the configured broker.
    pub fn from_registry(
        registry: &DeviceRegistry,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Result<Self, DeviceError> {
        let mut backends: HashMap<DeviceKey, Arc<dyn DeviceBackend>> = HashMap::new();
        for device in registry.list() {
            let backend: Arc<dyn DeviceBackend> = match &device.backend {
                BackendDescriptor::Network(target) => Arc::new(NetworkBackend::new(target.clone())?),
                BackendDescriptor::Mqtt(target) => {
                    let bus = bus
                        .clone()
                        .unwrap_or_else(|| Arc::new(MqttBrokerBus::new(target.broker.clone())));
                    Arc::new(MqttBackend::new(device.key.clone(), target.clone(), bus))
                }
                BackendDescriptor::Direct(target) => Arc::new(DirectBackend::new(target.clone())),
            };
            backends.insert(device.key, backend);
        }
        Ok(Self {
            backends: RwLock::new(backends),
        })
    }

    pub fn backend(&self, key: &DeviceKey) -> Option<Arc<dyn DeviceBackend>> {
        self.backends.read().get(key).cloned()
    }

    /// Swap the backend of an existing device.
    pub fn replace(&self, key: &DeviceKey, backend: Arc<dyn DeviceBackend>) -> bool {
        match self.backends.write().get_mut(key) {
            Some(slot) => {
                *slot = backend;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<(DeviceKey, Arc<dyn DeviceBackend>)> {
        self.backends
            .read()
            .iter()
            .map(|(key, backend)| (key.clone(), backend.clone()))
            .collect()
    }

    /// Connect every backend. Failures are logged; the device stays listed.
    pub async fn connect_all(&self) {
        for (key, backend) in self.snapshot() {
            match backend.connect().await {
                Ok(()) => info!(device = %key, backend = backend.kind(), "backend connected"),
                Err(err) => warn!(
                    device = %key,
                    backend = backend.kind(),
                    error = %err,
                    "backend connect failed"
                ),
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for (key, backend) in self.snapshot() {
            if let Err(err) = backend.disconnect().await {
                warn!(device = %key, error = %err, "backend disconnect failed");
            }
        }
    }

    pub fn metrics(&self) -> Vec<(DeviceKey, BackendMetrics)> {
        let mut metrics: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|(key, backend)| (key, backend.metrics()))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyr_common::{BackendMode, DeviceBackendConfig, DeviceConfig, ReflectorConfig};
    use std::time::Duration;

    fn registry() -> DeviceRegistry {
        let mut config = ReflectorConfig::default();
        config.devices = vec![
            DeviceConfig {
                device_type: "telescope".into(),
                backend: DeviceBackendConfig {
                    server_url: Some("http://127.0.0.1:9".into()),
                    ..DeviceBackendConfig::default()
                },
                ..DeviceConfig::default()
            },
            DeviceConfig {
                device_type: "dome".into(),
                backend: DeviceBackendConfig {
                    mode: Some(BackendMode::Mqtt),
                    ..DeviceBackendConfig::default()
                },
                ..DeviceConfig::default()
            },
            DeviceConfig {
                device_type: "focuser".into(),
                backend: DeviceBackendConfig {
                    mode: Some(BackendMode::Direct),
                    ..DeviceBackendConfig::default()
                },
                ..DeviceConfig::default()
            },
        ];
        DeviceRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn dispatcher_builds_backend_per_descriptor() {
        let dispatcher = Dispatcher::from_registry(&registry(), None).unwrap();
        let kind = |t: &str| dispatcher.backend(&DeviceKey::new(t, 0)).unwrap().kind();
        assert_eq!(kind("telescope"), "network");
        assert_eq!(kind("dome"), "mqtt");
        assert_eq!(kind("focuser"), "direct");
        assert!(dispatcher.backend(&DeviceKey::new("camera", 0)).is_none());
    }

    #[tokio::test]
    async fn broker_backed_devices_fail_to_connect_without_a_transport() {
        let dispatcher = Dispatcher::from_registry(&registry(), None).unwrap();
        let dome = dispatcher.backend(&DeviceKey::new("dome", 0)).unwrap();
        assert!(dome.connect().await.is_err());
        assert!(!dome.is_connected());
    }

    #[test]
    fn metrics_average_weights_history() {
        let recorder = MetricsRecorder::default();
        let started = Instant::now() - Duration::from_millis(100);
        recorder.record(started, Ok(()));
        let first = recorder.snapshot().average_latency_ms;
        assert!(first >= 100.0);

        recorder.record(Instant::now(), Err(&DeviceError::Unreachable("down".into())));
        let metrics = recorder.snapshot();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert!(metrics.average_latency_ms < first);
        assert!(metrics.average_latency_ms >= first * 0.8);
        assert_eq!(metrics.connection_state, ConnectionState::Error);
        assert_eq!(metrics.last_error.as_deref(), Some("backend unreachable: down"));
    }
}
