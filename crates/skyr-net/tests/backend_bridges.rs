//! ---
//! skyr_section: "15-testing-qa-runbook"
//! skyr_subsection: "integration-tests"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Network proxy chaining and bus bridging through running reflectors."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use skyr_common::{BackendMode, DeviceBackendConfig, DeviceConfig, ReflectorConfig};
use skyr_msg::{response_topic, DeviceReply, DeviceRequest, HttpVerb, InMemoryBus, MessageBus};
use skyr_net::{
    AlpacaResponse, BackendMetrics, DeviceBackend, DeviceError, DeviceKey, ErrorCode, Params,
    ReflectorHandle, ReflectorServer,
};

/// A mount that tracks a single `tracking` flag and refuses to park.
#[derive(Default)]
struct Mount {
    tracking: AtomicBool,
}

#[async_trait]
impl DeviceBackend for Mount {
    async fn connect(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn get(&self, member: &str, _params: &Params) -> Result<Option<Value>, DeviceError> {
        match member {
            "tracking" => Ok(Some(json!(self.tracking.load(Ordering::SeqCst)))),
            "connected" => Ok(Some(json!(true))),
            other => Err(DeviceError::NotImplemented(other.to_owned())),
        }
    }

    async fn put(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError> {
        match member {
            "tracking" => {
                let flag = params.get("Tracking").map(|v| v.eq_ignore_ascii_case("true"));
                self.tracking.store(flag.unwrap_or(false), Ordering::SeqCst);
                Ok(None)
            }
            "park" => Err(DeviceError::Ascom {
                code: ErrorCode::INVALID_OPERATION,
                message: "park position not set".into(),
            }),
            other => Err(DeviceError::NotImplemented(other.to_owned())),
        }
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }

    fn kind(&self) -> &'static str {
        "mount"
    }
}

fn local_config(devices: Vec<DeviceConfig>) -> ReflectorConfig {
    let mut config = ReflectorConfig::default();
    config.server.listen_address = "127.0.0.1:0".parse().unwrap();
    config.server.discovery_port = 0;
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.backend.network.default_timeout = Duration::from_secs(2);
    config.backend.network.retry_delay = Duration::from_millis(10);
    config.devices = devices;
    config
}

fn network_device(device_type: &str, number: u32, server_url: String, remote_number: u32) -> DeviceConfig {
    DeviceConfig {
        device_type: device_type.into(),
        number,
        backend: DeviceBackendConfig {
            server_url: Some(server_url),
            remote_number: Some(remote_number),
            ..DeviceBackendConfig::default()
        },
        ..DeviceConfig::default()
    }
}

async fn call(
    client: &reqwest::Client,
    handle: &ReflectorHandle,
    verb: reqwest::Method,
    path: &str,
    form: &[(&str, &str)],
) -> AlpacaResponse {
    let url = format!("http://{}{}", handle.local_addr(), path);
    let request = if verb == reqwest::Method::PUT {
        client.put(url).form(form)
    } else {
        client.get(url).query(form)
    };
    request.send().await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn network_backend_chains_through_a_second_reflector() {
    let mount = Arc::new(Mount::default());
    let remote = ReflectorServer::new(local_config(vec![network_device(
        "telescope",
        3,
        "http://127.0.0.1:9".into(),
        3,
    )]))
    .unwrap()
    .with_backend("telescope", 3, mount.clone())
    .unwrap()
    .spawn()
    .await
    .unwrap();

    let front = ReflectorServer::new(local_config(vec![network_device(
        "telescope",
        0,
        format!("http://{}", remote.local_addr()),
        3,
    )]))
    .unwrap()
    .spawn()
    .await
    .unwrap();

    let client = reqwest::Client::new();
    let set = call(
        &client,
        &front,
        reqwest::Method::PUT,
        "/api/v1/telescope/0/tracking",
        &[("Tracking", "true"), ("ClientTransactionID", "5")],
    )
    .await;
    assert_eq!(set.error_number, 0, "{}", set.error_message);
    assert_eq!(set.client_transaction_id, 5);
    assert!(mount.tracking.load(Ordering::SeqCst));

    let read = call(&client, &front, reqwest::Method::GET, "/api/v1/telescope/0/tracking", &[]).await;
    assert_eq!(read.value, Some(json!(true)));

    let parked = call(&client, &front, reqwest::Method::PUT, "/api/v1/telescope/0/park", &[]).await;
    assert_eq!(parked.error_number, ErrorCode::INVALID_OPERATION.0);
    assert_eq!(parked.error_message, "park position not set");

    let metrics = front
        .dispatcher()
        .backend(&DeviceKey::new("telescope", 0))
        .unwrap()
        .metrics();
    assert!(metrics.total_requests >= 3);
    assert!(metrics.failed_requests >= 1);

    front.shutdown().await.unwrap();
    remote.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_remote_reports_not_connected() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let mut config = local_config(vec![network_device("focuser", 0, format!("http://{dead}"), 0)]);
    config.backend.network.default_retry_attempts = 1;
    let front = ReflectorServer::new(config).unwrap().spawn().await.unwrap();

    let client = reqwest::Client::new();
    let body = call(&client, &front, reqwest::Method::GET, "/api/v1/focuser/0/position", &[]).await;
    assert_eq!(body.error_number, ErrorCode::NOT_CONNECTED.0);
    front.shutdown().await.unwrap();
}

fn spawn_bus_responder(bus: InMemoryBus) {
    let mut requests = bus.subscribe("observatory/request/#").unwrap();
    tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            let Ok(request) = DeviceRequest::from_payload(&message.payload) else {
                continue;
            };
            let reply = match (request.http_method, request.method.as_str()) {
                (HttpVerb::Get, "shutterstatus") => {
                    DeviceReply::success(request.request_id, Some(json!(1)))
                }
                (HttpVerb::Put, "openshutter") => DeviceReply::success(request.request_id, None),
                _ => DeviceReply::failure(request.request_id, 0x400, "unsupported member"),
            };
            let topic = response_topic("observatory", &reply.request_id);
            let _ = bus.publish(&topic, reply.to_payload().unwrap(), message.qos);
        }
    });
}

#[tokio::test]
async fn bus_backend_bridges_calls_over_the_message_bus() {
    let bus = InMemoryBus::new();
    spawn_bus_responder(bus.clone());

    let mut config = local_config(vec![DeviceConfig {
        device_type: "dome".into(),
        number: 0,
        backend: DeviceBackendConfig {
            mode: Some(BackendMode::Mqtt),
            ..DeviceBackendConfig::default()
        },
        ..DeviceConfig::default()
    }]);
    config.backend.mqtt.topic_prefix = "observatory".into();
    config.backend.mqtt.timeout = Duration::from_secs(2);
    let dome = DeviceKey::new("dome", 0);
    let server = ReflectorServer::with_bus(config, Arc::new(bus.clone())).unwrap();
    // connect before serving so the first call does not race the startup connect
    server.dispatcher().backend(&dome).unwrap().connect().await.unwrap();
    let handle = server.spawn().await.unwrap();

    let client = reqwest::Client::new();
    let status = call(&client, &handle, reqwest::Method::GET, "/api/v1/dome/0/shutterstatus", &[]).await;
    assert_eq!(status.value, Some(json!(1)));

    let open = call(&client, &handle, reqwest::Method::PUT, "/api/v1/dome/0/openshutter", &[]).await;
    assert_eq!(open.error_number, 0);

    let slave = call(&client, &handle, reqwest::Method::PUT, "/api/v1/dome/0/slaved", &[]).await;
    assert_eq!(slave.error_number, ErrorCode::NOT_IMPLEMENTED.0);
    assert_eq!(slave.error_message, "unsupported member");

    bus.set_connected(false);
    let offline = call(&client, &handle, reqwest::Method::GET, "/api/v1/dome/0/shutterstatus", &[]).await;
    assert_eq!(offline.error_number, ErrorCode::NOT_CONNECTED.0);

    handle.shutdown().await.unwrap();
}
