//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Message bus backend correlating device requests with replies."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Requests are published on `{prefix}/request/{type}/{number}/{member}` and
//! answered on `{prefix}/response/{request_id}`. A listener task drains the
//! reply subscription and completes the matching pending call.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use skyr_msg::{request_topic, response_filter, DeviceReply, DeviceRequest, HttpVerb, MessageBus};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendMetrics, ConnectionState, DeviceBackend, MetricsRecorder, Params};
use crate::envelope::ErrorCode;
use crate::error::DeviceError;
use crate::registry::{DeviceKey, MqttTarget};

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<DeviceReply>>>>;

pub struct MqttBackend {
    key: DeviceKey,
    target: MqttTarget,
    bus: Arc<dyn MessageBus>,
    pending: Pending,
    connected: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsRecorder,
}

impl MqttBackend {
    pub fn new(key: DeviceKey, target: MqttTarget, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            key,
            target,
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(false),
            listener: Mutex::new(None),
            metrics: MetricsRecorder::default(),
        }
    }

    /// Calls still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    async fn execute(
        &self,
        verb: HttpVerb,
        member: &str,
        params: &Params,
    ) -> Result<Option<Value>, DeviceError> {
        let started = Instant::now();
        let result = self.round_trip(verb, member, params).await;
        self.metrics.record(started, result.as_ref().map(|_| ()));
        result
    }

    async fn round_trip(
        &self,
        verb: HttpVerb,
        member: &str,
        params: &Params,
    ) -> Result<Option<Value>, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let mut request = DeviceRequest::new(
            self.key.device_type.clone(),
            self.key.device_number,
            member,
            verb,
            params.clone(),
        );
        if let Some(telescope_id) = &self.target.telescope_id {
            request = request.with_telescope(telescope_id.clone());
        }
        let request_id = request.request_id;
        let payload = request.to_payload()?;
        let topic = request_topic(
            &self.target.topic_prefix,
            &self.key.device_type,
            self.key.device_number,
            member,
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);
        if let Err(err) = self.bus.publish(&topic, payload, self.target.qos) {
            self.pending.lock().remove(&request_id);
            return Err(err.into());
        }
        debug!(device = %self.key, topic = %topic, %request_id, "device request published");

        let reply = match tokio::time::timeout(self.target.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(DeviceError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(DeviceError::Timeout(self.target.timeout));
            }
        };

        if reply.error_number != 0 {
            return Err(DeviceError::Ascom {
                code: ErrorCode(reply.error_number),
                message: reply.error_message,
            });
        }
        Ok(reply.value)
    }
}

#[async_trait]
impl DeviceBackend for MqttBackend {
    async fn connect(&self) -> Result<(), DeviceError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut subscription = self
            .bus
            .subscribe(&response_filter(&self.target.topic_prefix))?;
        let pending = self.pending.clone();
        let device = self.key.to_string();
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                match DeviceReply::from_payload(&message.payload) {
                    Ok(reply) => {
                        // replies for other devices share the filter
                        if let Some(waiter) = pending.lock().remove(&reply.request_id) {
                            let _ = waiter.send(reply);
                        }
                    }
                    Err(err) => warn!(
                        device = %device,
                        topic = %message.topic,
                        error = %err,
                        "discarding malformed device reply"
                    ),
                }
            }
        });
        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
        self.connected.store(true, Ordering::SeqCst);
        self.metrics.set_state(ConnectionState::Connected);
        debug!(device = %self.key, bus = self.bus.name(), "bus backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.pending.lock().clear();
        self.metrics.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.bus.is_connected()
    }

    async fn get(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError> {
        self.execute(HttpVerb::Get, member, params).await
    }

    async fn put(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError> {
        self.execute(HttpVerb::Put, member, params).await
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        if !self.bus.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.execute(HttpVerb::Get, "connected", &Params::new())
            .await
            .map(|_| ())
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.snapshot()
    }

    fn kind(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttBackend {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyr_msg::{response_topic, InMemoryBus, QoS};
    use std::time::Duration;

    fn target(timeout: Duration) -> MqttTarget {
        MqttTarget {
            broker: "tcp://localhost:1883".into(),
            telescope_id: Some("scope-a".into()),
            client_id: "skyr-test".into(),
            username: None,
            password: None,
            timeout,
            keep_alive: Duration::from_secs(60),
            qos: QoS::AtLeastOnce,
            topic_prefix: "ascom".into(),
        }
    }

    fn spawn_responder(bus: InMemoryBus) {
        let mut requests = bus.subscribe("ascom/request/#").unwrap();
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let request = DeviceRequest::from_payload(&message.payload).unwrap();
                let reply = match request.method.as_str() {
                    "park" => DeviceReply::failure(request.request_id, 0x408, "already parked"),
                    _ => DeviceReply::success(request.request_id, Some(json!(request.telescope_id))),
                };
                let topic = response_topic("ascom", &reply.request_id);
                bus.publish(&topic, reply.to_payload().unwrap(), QoS::AtLeastOnce)
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn replies_are_correlated_by_request_id() {
        let bus = InMemoryBus::new();
        spawn_responder(bus.clone());
        let backend = MqttBackend::new(
            DeviceKey::new("telescope", 0),
            target(Duration::from_secs(2)),
            Arc::new(bus),
        );
        backend.connect().await.unwrap();

        let value = backend.get("tracking", &Params::new()).await.unwrap();
        assert_eq!(value, Some(json!("scope-a")));

        let err = backend.put("park", &Params::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::INVALID_WHILE_PARKED);
        assert_eq!(backend.pending_requests(), 0);
        assert_eq!(backend.metrics().total_requests, 2);
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let bus = InMemoryBus::new();
        let backend = MqttBackend::new(
            DeviceKey::new("dome", 0),
            target(Duration::from_millis(50)),
            Arc::new(bus),
        );
        backend.connect().await.unwrap();
        let err = backend.get("shutterstatus", &Params::new()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert_eq!(backend.pending_requests(), 0);
    }

    #[tokio::test]
    async fn requests_fail_fast_when_bus_is_down() {
        let bus = InMemoryBus::new();
        let backend = MqttBackend::new(
            DeviceKey::new("dome", 0),
            target(Duration::from_secs(1)),
            Arc::new(bus.clone()),
        );
        assert_eq!(
            backend.get("slewing", &Params::new()).await.unwrap_err(),
            DeviceError::NotConnected
        );
        backend.connect().await.unwrap();
        bus.set_connected(false);
        assert!(!backend.is_connected());
        assert_eq!(backend.health_check().await.unwrap_err(), DeviceError::NotConnected);
    }
}
