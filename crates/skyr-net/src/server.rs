//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Reflector server assembly, listener lifecycle, and graceful shutdown."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::{Extension, Router};
use skyr_common::{ConfigError, ReflectorConfig};
use skyr_msg::MessageBus;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{DeviceBackend, Dispatcher};
use crate::discovery::{DiscoveryHandle, DiscoveryResponder};
use crate::envelope::{AlpacaReply, AlpacaResponse, ErrorCode, TransactionCounter, TransactionIds};
use crate::management::{self, ServerDescription};
use crate::middleware::{
    apply_cors, assign_transaction, enforce_deadline, log_requests, recover_panics,
    require_basic_auth, CorsPolicy,
};
use crate::registry::{DeviceKey, DeviceRegistry};
use crate::device_api;

/// Shared state handed to every route.
pub struct ReflectorState {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) description: ServerDescription,
}

/// A configured reflector ready to be spawned.
pub struct ReflectorServer {
    config: ReflectorConfig,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<Dispatcher>,
    counter: Arc<TransactionCounter>,
}

impl ReflectorServer {
    /// Build from configuration. Bus-backed devices target the configured broker.
    pub fn new(config: ReflectorConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Build with an externally owned bus for bus-backed devices.
    pub fn with_bus(config: ReflectorConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        Self::build(config, Some(bus))
    }

    fn build(config: ReflectorConfig, bus: Option<Arc<dyn MessageBus>>) -> Result<Self> {
        let registry = DeviceRegistry::from_config(&config)?;
        if config.tls.enabled {
            return Err(ConfigError::TlsUnsupported.into());
        }
        let dispatcher = Dispatcher::from_registry(&registry, bus)?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            counter: Arc::new(TransactionCounter::new()),
        })
    }

    /// Replace the backend of a configured device.
    pub fn with_backend(
        self,
        device_type: &str,
        device_number: u32,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Self> {
        let key = DeviceKey::new(device_type, device_number);
        if !self.dispatcher.replace(&key, backend) {
            bail!("device {key} is not configured");
        }
        Ok(self)
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Routes wrapped in the middleware chain.
    pub fn router(&self) -> Router {
        let state = Arc::new(ReflectorState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            description: ServerDescription::from(&self.config.server),
        });

        // layers added first sit closest to the handlers
        let mut router = Router::new()
            .merge(management::routes())
            .merge(device_api::routes())
            .fallback(unknown_route)
            .with_state(state)
            .layer(from_fn_with_state(self.config.server.write_timeout, enforce_deadline))
            .layer(from_fn_with_state(self.counter.clone(), assign_transaction))
            .layer(from_fn_with_state(
                Arc::new(self.config.authentication.clone()),
                require_basic_auth,
            ));
        if self.config.cors.enabled {
            router = router.layer(from_fn_with_state(
                Arc::new(CorsPolicy::from_config(&self.config.cors)),
                apply_cors,
            ));
        }
        router.layer(from_fn(log_requests)).layer(from_fn(recover_panics))
    }

    /// Bind the REST listener and the discovery responder.
    pub async fn spawn(self) -> Result<ReflectorHandle> {
        let listen = self.config.server.listen_address;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind alpaca api on {listen}"))?;
        let address = listener.local_addr()?;
        let advertised_port = self.config.server.advertised_port.unwrap_or(address.port());

        let discovery = DiscoveryResponder::new(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.server.discovery_port)),
            advertised_port,
        )
        .spawn()
        .await?;

        let router = self.router();
        let dispatcher = self.dispatcher.clone();
        let connector = tokio::spawn(async move { dispatcher.connect_all().await });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "alpaca api server exited with error");
            }
        });

        info!(
            address = %address,
            discovery = %discovery.local_addr(),
            advertised_port,
            devices = self.registry.len(),
            server_name = %self.config.server.server_name,
            "reflector listening"
        );

        Ok(ReflectorHandle {
            address,
            task,
            connector,
            discovery,
            shutdown: shutdown_tx,
            registry: self.registry,
            dispatcher: self.dispatcher,
            drain_timeout: self.config.server.shutdown_timeout,
        })
    }
}

async fn unknown_route(ids: Option<Extension<TransactionIds>>, uri: Uri) -> AlpacaReply {
    let ids = ids.map(|Extension(ids)| ids).unwrap_or_default();
    AlpacaReply::with_status(
        StatusCode::NOT_FOUND,
        AlpacaResponse::error(
            ErrorCode::NOT_IMPLEMENTED,
            format!("unknown endpoint {}", uri.path()),
            ids,
        ),
    )
}

/// Known path, unsupported verb.
pub(crate) async fn method_not_allowed(
    ids: Option<Extension<TransactionIds>>,
    method: Method,
    uri: Uri,
) -> AlpacaReply {
    let ids = ids.map(|Extension(ids)| ids).unwrap_or_default();
    AlpacaReply::with_status(
        StatusCode::METHOD_NOT_ALLOWED,
        AlpacaResponse::error(
            ErrorCode::NOT_IMPLEMENTED,
            format!("{method} is not supported on {}", uri.path()),
            ids,
        ),
    )
}

/// Running reflector.
pub struct ReflectorHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    connector: JoinHandle<()>,
    discovery: DiscoveryHandle,
    shutdown: watch::Sender<bool>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<Dispatcher>,
    drain_timeout: Duration,
}

impl ReflectorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Bound discovery socket (all interfaces).
    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery.local_addr()
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Stop accepting, drain in-flight requests up to the shutdown timeout,
    /// then stop discovery and disconnect backends.
    pub async fn shutdown(self) -> Result<()> {
        let ReflectorHandle {
            mut task,
            connector,
            discovery,
            shutdown,
            dispatcher,
            drain_timeout,
            ..
        } = self;

        let _ = shutdown.send(true);
        connector.abort();
        match tokio::time::timeout(drain_timeout, &mut task).await {
            Ok(joined) => joined.context("alpaca api task failed")?,
            Err(_) => {
                warn!(
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "graceful drain timed out; aborting open connections"
                );
                task.abort();
            }
        }
        discovery.shutdown().await?;
        dispatcher.disconnect_all().await;
        info!("reflector stopped");
        Ok(())
    }
}
