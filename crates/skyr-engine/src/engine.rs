//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Device pool engine: managed devices, telescope pools, health monitor."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skyr_common::EngineConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{AlpacaClient, DeviceControl};
use crate::discovery;
use crate::error::EngineError;
use crate::health::{DeviceState, HealthDetails, HealthEvent, HealthReport};
use crate::model::{AlpacaDevice, DeviceRole};

/// A registered device together with its health state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedDevice {
    pub device: AlpacaDevice,
    pub state: DeviceState,
    pub last_check: Option<DateTime<Utc>>,
    /// Last successful connect or health check.
    pub last_healthy: Option<DateTime<Utc>>,
}

impl ManagedDevice {
    fn new(device: AlpacaDevice) -> Self {
        Self {
            device,
            state: DeviceState::Unknown,
            last_check: None,
            last_healthy: None,
        }
    }

    fn apply(&mut self, event: HealthEvent) -> DeviceState {
        self.state = self.state.next(event);
        self.device.connected = self.state.is_connected();
        let now = Utc::now();
        let healthy = matches!(event, HealthEvent::ConnectSucceeded | HealthEvent::CheckPassed)
            && self.state.is_connected();
        if healthy {
            self.last_healthy = Some(now);
        }
        if healthy || event == HealthEvent::ReportedDisconnected {
            self.device.last_seen = now;
        }
        self.state
    }
}

/// Devices grouped under one logical telescope, keyed by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelescopePool {
    pub telescope_id: String,
    pub devices: BTreeMap<DeviceRole, String>,
}

#[derive(Debug, Default)]
struct PoolState {
    devices: BTreeMap<String, ManagedDevice>,
    telescopes: BTreeMap<String, TelescopePool>,
}

/// Registry of Alpaca devices a coordinator works with.
///
/// Lock guards are never held across a device call; state is re-read after
/// each await so concurrent registration changes are respected.
pub struct DevicePoolEngine {
    config: EngineConfig,
    client: Arc<AlpacaClient>,
    control: Arc<dyn DeviceControl>,
    state: RwLock<PoolState>,
}

impl DevicePoolEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = Arc::new(AlpacaClient::new(config.request_timeout)?);
        let control: Arc<dyn DeviceControl> = client.clone();
        Ok(Self::assemble(config, client, control))
    }

    /// Engine whose connection control goes through `control` instead of HTTP.
    pub fn with_control(config: EngineConfig, control: Arc<dyn DeviceControl>) -> Result<Self, EngineError> {
        config.validate()?;
        let client = Arc::new(AlpacaClient::new(config.request_timeout)?);
        Ok(Self::assemble(config, client, control))
    }

    fn assemble(config: EngineConfig, client: Arc<AlpacaClient>, control: Arc<dyn DeviceControl>) -> Self {
        Self {
            config,
            client,
            control,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// REST client for device operations such as slewing or parking.
    pub fn client(&self) -> Arc<AlpacaClient> {
        Arc::clone(&self.client)
    }

    /// Broadcast discovery on `port` (or the configured port). The pool is left untouched.
    pub async fn discover_devices(&self, port: Option<u16>) -> Result<Vec<AlpacaDevice>, EngineError> {
        let port = port.unwrap_or(self.config.discovery_port);
        self.discover_devices_at(discovery::broadcast_target(port)).await
    }

    /// Discovery against an explicit address instead of the broadcast address.
    pub async fn discover_devices_at(&self, target: SocketAddr) -> Result<Vec<AlpacaDevice>, EngineError> {
        Ok(discovery::discover_at(&self.client, target, self.config.discovery_timeout).await?)
    }

    pub fn register_device(&self, device: AlpacaDevice) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if state.devices.contains_key(&device.device_id) {
            return Err(EngineError::AlreadyRegistered(device.device_id));
        }
        info!(device_id = %device.device_id, device_type = %device.device_type, "device registered");
        state
            .devices
            .insert(device.device_id.clone(), ManagedDevice::new(device));
        Ok(())
    }

    /// Remove a device, disconnecting it first when connected. A failed disconnect is only logged.
    pub async fn unregister_device(&self, device_id: &str) -> Result<(), EngineError> {
        let managed = self.managed(device_id)?;
        if managed.state.is_connected() {
            if let Err(err) = self.control.disconnect(&managed.device).await {
                warn!(device_id, error = %err, "disconnect before unregister failed");
            }
        }
        self.state.write().devices.remove(device_id);
        info!(device_id, "device unregistered");
        Ok(())
    }

    /// Connect a device. Connecting an already connected device clears its failure count.
    pub async fn connect_device(&self, device_id: &str) -> Result<(), EngineError> {
        let device = {
            let mut state = self.state.write();
            let managed = state
                .devices
                .get_mut(device_id)
                .ok_or_else(|| EngineError::NotRegistered(device_id.to_owned()))?;
            if managed.state.is_connected() {
                managed.apply(HealthEvent::ConnectSucceeded);
                return Ok(());
            }
            managed.apply(HealthEvent::ConnectRequested);
            managed.device.clone()
        };

        let outcome = self.control.connect(&device).await;
        let event = match &outcome {
            Ok(()) => HealthEvent::ConnectSucceeded,
            Err(_) => HealthEvent::ConnectFailed,
        };
        self.apply_event(device_id, event);
        match outcome {
            Ok(()) => {
                info!(device_id, "device connected");
                Ok(())
            }
            Err(err) => {
                warn!(device_id, error = %err, "device connect failed");
                Err(err.into())
            }
        }
    }

    /// Disconnect a device. Already disconnected devices are left as they are.
    ///
    /// The local state always becomes disconnected; a remote failure is logged.
    pub async fn disconnect_device(&self, device_id: &str) -> Result<(), EngineError> {
        let managed = self.managed(device_id)?;
        if !managed.state.is_connected() {
            debug!(device_id, "device already disconnected");
            self.apply_event(device_id, HealthEvent::DisconnectRequested);
            return Ok(());
        }
        if let Err(err) = self.control.disconnect(&managed.device).await {
            warn!(device_id, error = %err, "remote disconnect failed");
        }
        self.apply_event(device_id, HealthEvent::DisconnectRequested);
        info!(device_id, "device disconnected");
        Ok(())
    }

    pub fn is_device_connected(&self, device_id: &str) -> Result<bool, EngineError> {
        Ok(self.managed(device_id)?.state.is_connected())
    }

    pub fn device(&self, device_id: &str) -> Result<AlpacaDevice, EngineError> {
        Ok(self.managed(device_id)?.device)
    }

    pub fn managed(&self, device_id: &str) -> Result<ManagedDevice, EngineError> {
        self.state
            .read()
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(device_id.to_owned()))
    }

    pub fn devices(&self) -> Vec<AlpacaDevice> {
        self.state
            .read()
            .devices
            .values()
            .map(|managed| managed.device.clone())
            .collect()
    }

    /// Assign devices to roles of a telescope, replacing any previous assignment.
    pub fn register_telescope_devices(
        &self,
        telescope_id: &str,
        roles: BTreeMap<DeviceRole, String>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if let Some(missing) = roles.values().find(|id| !state.devices.contains_key(*id)) {
            return Err(EngineError::NotRegistered(missing.clone()));
        }
        info!(telescope_id, roles = roles.len(), "telescope pool registered");
        state.telescopes.insert(
            telescope_id.to_owned(),
            TelescopePool {
                telescope_id: telescope_id.to_owned(),
                devices: roles,
            },
        );
        Ok(())
    }

    pub fn unregister_telescope(&self, telescope_id: &str) -> Result<(), EngineError> {
        self.state
            .write()
            .telescopes
            .remove(telescope_id)
            .map(drop)
            .ok_or_else(|| EngineError::TelescopeNotFound(telescope_id.to_owned()))
    }

    pub fn telescope_device(&self, telescope_id: &str, role: DeviceRole) -> Result<AlpacaDevice, EngineError> {
        let state = self.state.read();
        let pool = state
            .telescopes
            .get(telescope_id)
            .ok_or_else(|| EngineError::TelescopeNotFound(telescope_id.to_owned()))?;
        let device_id = pool.devices.get(&role).ok_or_else(|| EngineError::RoleNotFound {
            telescope_id: telescope_id.to_owned(),
            role: role.to_string(),
        })?;
        state
            .devices
            .get(device_id)
            .map(|managed| managed.device.clone())
            .ok_or_else(|| EngineError::NotRegistered(device_id.clone()))
    }

    pub fn telescope(&self, telescope_id: &str) -> Result<TelescopePool, EngineError> {
        self.state
            .read()
            .telescopes
            .get(telescope_id)
            .cloned()
            .ok_or_else(|| EngineError::TelescopeNotFound(telescope_id.to_owned()))
    }

    pub fn telescope_ids(&self) -> Vec<String> {
        self.state.read().telescopes.keys().cloned().collect()
    }

    /// Probe every connected device once. Returns the ids demoted by this pass.
    pub async fn run_health_checks(&self) -> Vec<String> {
        let connected: Vec<AlpacaDevice> = self
            .state
            .read()
            .devices
            .values()
            .filter(|managed| managed.state.is_connected())
            .map(|managed| managed.device.clone())
            .collect();

        let mut demoted = Vec::new();
        for device in connected {
            let event = match self.control.is_connected(&device).await {
                Ok(true) => HealthEvent::CheckPassed,
                Ok(false) => HealthEvent::ReportedDisconnected,
                Err(err) => {
                    debug!(device_id = %device.device_id, error = %err, "health probe failed");
                    HealthEvent::CheckFailed
                }
            };
            let Some((before, after)) = self.apply_event(&device.device_id, event) else {
                continue;
            };
            if before.is_connected() && !after.is_connected() {
                warn!(device_id = %device.device_id, ?event, "device demoted to disconnected");
                demoted.push(device.device_id.clone());
            } else if after.fail_count() > 0 {
                warn!(device_id = %device.device_id, failures = after.fail_count(), "device health check failed");
            }
        }
        demoted
    }

    /// Aggregate health of the pool.
    pub fn check(&self) -> HealthReport {
        let state = self.state.read();
        let mut details = HealthDetails {
            total_devices: state.devices.len(),
            telescope_count: state.telescopes.len(),
            ..HealthDetails::default()
        };
        for managed in state.devices.values() {
            if managed.state.is_connected() {
                details.connected_devices += 1;
                if managed.state.fail_count() == 0 {
                    details.healthy_devices += 1;
                }
            }
        }
        HealthReport::from_details(details)
    }

    /// Spawn the periodic health monitor.
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(&self);
        let task = tokio::spawn(async move { engine.monitor(shutdown_rx).await });
        info!(interval = ?self.config.health_check_interval, "device pool engine started");
        EngineHandle {
            engine: self,
            task,
            shutdown: shutdown_tx,
        }
    }

    async fn monitor(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_health_checks().await;
                }
            }
        }
        debug!("health monitor stopped");
    }

    /// Disconnect every connected device.
    pub async fn stop(&self) {
        let connected: Vec<String> = self
            .state
            .read()
            .devices
            .iter()
            .filter(|(_, managed)| managed.state.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        for device_id in connected {
            if let Err(err) = self.disconnect_device(&device_id).await {
                warn!(device_id = %device_id, error = %err, "disconnect on stop failed");
            }
        }
        info!("device pool engine stopped");
    }

    fn apply_event(&self, device_id: &str, event: HealthEvent) -> Option<(DeviceState, DeviceState)> {
        let mut state = self.state.write();
        let managed = state.devices.get_mut(device_id)?;
        let before = managed.state;
        let after = managed.apply(event);
        if matches!(event, HealthEvent::CheckPassed | HealthEvent::CheckFailed | HealthEvent::ReportedDisconnected) {
            managed.last_check = Some(Utc::now());
        }
        Some((before, after))
    }
}

/// Running health monitor.
pub struct EngineHandle {
    engine: Arc<DevicePoolEngine>,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<DevicePoolEngine> {
        &self.engine
    }

    /// Stop the monitor, then disconnect all devices.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "health monitor task failed");
        }
        self.engine.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedControl {
        refuse_connect: AtomicBool,
        probes: Mutex<VecDeque<Result<bool, ()>>>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        probes_run: AtomicUsize,
    }

    impl ScriptedControl {
        fn script(&self, outcomes: &[Result<bool, ()>]) {
            self.probes.lock().extend(outcomes.iter().copied());
        }
    }

    #[async_trait]
    impl DeviceControl for ScriptedControl {
        async fn connect(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect.load(Ordering::SeqCst) {
                return Err(ClientError::Unreachable {
                    url: device.server_url.clone(),
                    cause: "refused".into(),
                });
            }
            Ok(())
        }

        async fn disconnect(&self, _device: &AlpacaDevice) -> Result<(), ClientError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Request("remote gone".into()))
        }

        async fn is_connected(&self, _device: &AlpacaDevice) -> Result<bool, ClientError> {
            self.probes_run.fetch_add(1, Ordering::SeqCst);
            match self.probes.lock().pop_front().unwrap_or(Ok(true)) {
                Ok(connected) => Ok(connected),
                Err(()) => Err(ClientError::Timeout {
                    url: "probe".into(),
                    timeout: Duration::from_secs(1),
                }),
            }
        }
    }

    fn engine() -> (Arc<ScriptedControl>, DevicePoolEngine) {
        let control = Arc::new(ScriptedControl::default());
        let engine = DevicePoolEngine::with_control(EngineConfig::default(), control.clone()).unwrap();
        (control, engine)
    }

    fn mount() -> AlpacaDevice {
        AlpacaDevice::new("http://obs:11111", "telescope", 0)
    }

    fn camera() -> AlpacaDevice {
        AlpacaDevice::new("http://obs:11111", "camera", 0)
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (_, engine) = engine();
        engine.register_device(mount()).unwrap();
        assert!(matches!(
            engine.register_device(mount()),
            Err(EngineError::AlreadyRegistered(_))
        ));
        assert_eq!(engine.devices().len(), 1);
    }

    #[tokio::test]
    async fn connect_and_disconnect_lifecycle() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        assert_eq!(engine.managed(&id).unwrap().state, DeviceState::Unknown);

        engine.connect_device(&id).await.unwrap();
        assert!(engine.is_device_connected(&id).unwrap());
        assert!(engine.device(&id).unwrap().connected);

        // remote failure is logged; local state still follows the request
        engine.disconnect_device(&id).await.unwrap();
        assert!(!engine.is_device_connected(&id).unwrap());
        assert_eq!(control.disconnects.load(Ordering::SeqCst), 1);

        // second disconnect is a no-op
        engine.disconnect_device(&id).await.unwrap();
        assert_eq!(control.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_a_client_error() {
        let (control, engine) = engine();
        control.refuse_connect.store(true, Ordering::SeqCst);
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        let err = engine.connect_device(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Client(ClientError::Unreachable { .. })));
        assert_eq!(engine.managed(&id).unwrap().state, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn unknown_devices_are_not_found() {
        let (_, engine) = engine();
        assert!(engine.connect_device("nope").await.unwrap_err().is_not_found());
        assert!(engine.disconnect_device("nope").await.unwrap_err().is_not_found());
        assert!(engine.unregister_device("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn third_consecutive_failure_demotes() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        engine.connect_device(&id).await.unwrap();

        control.script(&[Err(()), Err(()), Ok(true), Err(()), Err(())]);
        for _ in 0..5 {
            assert!(engine.run_health_checks().await.is_empty());
        }
        assert_eq!(engine.managed(&id).unwrap().state.fail_count(), 2);
        assert_eq!(engine.check().status, crate::health::HealthStatus::Degraded);

        control.script(&[Err(())]);
        assert_eq!(engine.run_health_checks().await, vec![id.clone()]);
        assert!(!engine.is_device_connected(&id).unwrap());
        assert_eq!(engine.managed(&id).unwrap().state.fail_count(), 0);

        // disconnected devices are not probed
        let probes = control.probes_run.load(Ordering::SeqCst);
        engine.run_health_checks().await;
        assert_eq!(control.probes_run.load(Ordering::SeqCst), probes);
    }

    #[tokio::test]
    async fn last_healthy_only_moves_on_success() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        assert_eq!(engine.managed(&id).unwrap().last_healthy, None);

        engine.connect_device(&id).await.unwrap();
        let connected_at = engine.managed(&id).unwrap().last_healthy.unwrap();

        control.script(&[Err(())]);
        engine.run_health_checks().await;
        let after_failure = engine.managed(&id).unwrap();
        assert_eq!(after_failure.last_healthy, Some(connected_at));
        assert_eq!(after_failure.device.last_seen, connected_at);
        assert!(after_failure.last_check.unwrap() >= connected_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        control.script(&[Ok(true)]);
        engine.run_health_checks().await;
        let after_success = engine.managed(&id).unwrap().last_healthy.unwrap();
        assert!(after_success > connected_at);
    }

    #[test]
    fn zero_health_interval_is_rejected() {
        let control: Arc<dyn DeviceControl> = Arc::new(ScriptedControl::default());
        let config = EngineConfig {
            health_check_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        let err = DevicePoolEngine::with_control(config, control).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        let zero_timeout = EngineConfig {
            request_timeout: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(
            DevicePoolEngine::new(zero_timeout),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_clears_failures() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        engine.connect_device(&id).await.unwrap();
        control.script(&[Err(()), Err(())]);
        engine.run_health_checks().await;
        engine.run_health_checks().await;

        engine.connect_device(&id).await.unwrap();
        assert_eq!(engine.managed(&id).unwrap().state.fail_count(), 0);
        assert_eq!(control.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_reporting_disconnected_is_demoted_immediately() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        engine.connect_device(&id).await.unwrap();
        control.script(&[Ok(false)]);
        assert_eq!(engine.run_health_checks().await, vec![id]);
    }

    #[tokio::test]
    async fn telescope_pools_resolve_roles() {
        let (_, engine) = engine();
        engine.register_device(mount()).unwrap();
        engine.register_device(camera()).unwrap();
        let roles = BTreeMap::from([
            (DeviceRole::Telescope, mount().device_id),
            (DeviceRole::Camera, camera().device_id),
        ]);
        engine.register_telescope_devices("ridge-1", roles).unwrap();

        let device = engine.telescope_device("ridge-1", DeviceRole::Camera).unwrap();
        assert_eq!(device.device_type, "camera");
        assert!(matches!(
            engine.telescope_device("ridge-1", DeviceRole::Dome),
            Err(EngineError::RoleNotFound { .. })
        ));
        assert!(matches!(
            engine.telescope_device("ridge-2", DeviceRole::Camera),
            Err(EngineError::TelescopeNotFound(_))
        ));

        let unknown = BTreeMap::from([(DeviceRole::Focuser, "ghost".to_owned())]);
        assert!(matches!(
            engine.register_telescope_devices("ridge-1", unknown),
            Err(EngineError::NotRegistered(_))
        ));
        // failed registration keeps the previous pool
        assert_eq!(engine.telescope("ridge-1").unwrap().devices.len(), 2);

        let replacement = BTreeMap::from([(DeviceRole::Telescope, mount().device_id)]);
        engine.register_telescope_devices("ridge-1", replacement).unwrap();
        assert_eq!(engine.telescope("ridge-1").unwrap().devices.len(), 1);
        assert_eq!(engine.telescope_ids(), vec!["ridge-1".to_owned()]);

        engine.unregister_telescope("ridge-1").unwrap();
        assert!(engine.unregister_telescope("ridge-1").is_err());
    }

    #[tokio::test]
    async fn health_report_counts_devices() {
        let (_, engine) = engine();
        assert_eq!(engine.check().status, crate::health::HealthStatus::Healthy);
        engine.register_device(mount()).unwrap();
        engine.register_device(camera()).unwrap();
        let report = engine.check();
        assert_eq!(report.status, crate::health::HealthStatus::Unhealthy);
        assert_eq!(report.details.total_devices, 2);

        engine.connect_device(&mount().device_id).await.unwrap();
        let report = engine.check();
        assert_eq!(report.status, crate::health::HealthStatus::Healthy);
        assert_eq!(report.details.connected_devices, 1);
        assert_eq!(report.details.healthy_devices, 1);
    }

    #[tokio::test]
    async fn unregister_disconnects_connected_devices() {
        let (control, engine) = engine();
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        engine.connect_device(&id).await.unwrap();
        engine.unregister_device(&id).await.unwrap();
        assert_eq!(control.disconnects.load(Ordering::SeqCst), 1);
        assert!(engine.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_runs_on_interval_and_shutdown_disconnects() {
        let control = Arc::new(ScriptedControl::default());
        let config = EngineConfig {
            health_check_interval: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let engine = Arc::new(DevicePoolEngine::with_control(config, control.clone()).unwrap());
        let id = mount().device_id;
        engine.register_device(mount()).unwrap();
        engine.connect_device(&id).await.unwrap();

        let handle = Arc::clone(&engine).start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(control.probes_run.load(Ordering::SeqCst), 2);

        handle.shutdown().await.unwrap();
        assert!(!engine.is_device_connected(&id).unwrap());
        assert_eq!(control.disconnects.load(Ordering::SeqCst), 1);
    }
}
