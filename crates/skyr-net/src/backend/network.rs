//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "HTTP proxy backend forwarding Alpaca calls to a remote Alpaca server."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use skyr_msg::HttpVerb;
use tracing::{debug, warn};

use super::{BackendMetrics, ConnectionState, DeviceBackend, MetricsRecorder, Params};
use crate::envelope::{AlpacaResponse, ErrorCode};
use crate::error::DeviceError;
use crate::registry::NetworkTarget;

/// Forwards every member call to `{server_url}/api/v1/{remote_type}/{remote_number}/{member}`.
pub struct NetworkBackend {
    target: NetworkTarget,
    http: reqwest::Client,
    connected: AtomicBool,
    metrics: MetricsRecorder,
}

impl NetworkBackend {
    pub fn new(target: NetworkTarget) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(target.timeout)
            .build()
            .map_err(|err| DeviceError::Internal(format!("http client: {err}")))?;
        Ok(Self {
            target,
            http,
            connected: AtomicBool::new(false),
            metrics: MetricsRecorder::default(),
        })
    }

    pub fn target(&self) -> &NetworkTarget {
        &self.target
    }

    fn endpoint(&self, member: &str) -> String {
        format!(
            "{}/api/v1/{}/{}/{}",
            self.target.server_url, self.target.remote_type, self.target.remote_number, member
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.target.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn execute(
        &self,
        verb: HttpVerb,
        member: &str,
        params: &Params,
    ) -> Result<Option<Value>, DeviceError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            match self.send_once(verb, member, params).await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_retryable() && attempt < self.target.retry_attempts => {
                    let delay = self.backoff(attempt);
                    debug!(
                        server = %self.target.server_url,
                        member,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        self.metrics.record(started, result.as_ref().map(|_| ()));
        match &result {
            Ok(_) | Err(DeviceError::Ascom { .. }) => self.connected.store(true, Ordering::SeqCst),
            Err(err @ DeviceError::Unreachable(_)) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!(server = %self.target.server_url, member, error = %err, "remote server unreachable");
            }
            Err(_) => {}
        }
        result
    }

    async fn send_once(
        &self,
        verb: HttpVerb,
        member: &str,
        params: &Params,
    ) -> Result<Option<Value>, DeviceError> {
        let url = self.endpoint(member);
        let request = match verb {
            HttpVerb::Get => self.http.get(&url).query(params),
            HttpVerb::Put => self.http.put(&url).form(params),
        };
        let response = request
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: AlpacaResponse = response
            .json()
            .await
            .map_err(|err| DeviceError::Malformed(err.to_string()))?;
        if envelope.error_number != 0 {
            return Err(DeviceError::Ascom {
                code: ErrorCode(envelope.error_number),
                message: envelope.error_message,
            });
        }
        Ok(envelope.value)
    }

    fn transport_error(&self, err: reqwest::Error) -> DeviceError {
        if err.is_timeout() {
            DeviceError::Timeout(self.target.timeout)
        } else if err.is_connect() || err.is_request() {
            DeviceError::Unreachable(err.to_string())
        } else {
            DeviceError::Internal(err.to_string())
        }
    }
}

#[async_trait]
impl DeviceBackend for NetworkBackend {
    async fn connect(&self) -> Result<(), DeviceError> {
        self.health_check().await
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        self.metrics.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError> {
        self.execute(HttpVerb::Get, member, params).await
    }

    async fn put(&self, member: &str, params: &Params) -> Result<Option<Value>, DeviceError> {
        self.execute(HttpVerb::Put, member, params).await
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        self.execute(HttpVerb::Get, "connected", &Params::new())
            .await
            .map(|_| ())
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.snapshot()
    }

    fn kind(&self) -> &'static str {
        "network"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(server_url: &str) -> NetworkTarget {
        NetworkTarget {
            server_url: server_url.into(),
            remote_type: "telescope".into(),
            remote_number: 1,
            timeout: Duration::from_millis(500),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn endpoint_uses_remote_identity() {
        let backend = NetworkBackend::new(target("http://mount:11111")).unwrap();
        assert_eq!(
            backend.endpoint("rightascension"),
            "http://mount:11111/api/v1/telescope/1/rightascension"
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let backend = NetworkBackend::new(target("http://mount:11111")).unwrap();
        assert_eq!(backend.backoff(0), Duration::from_millis(10));
        assert_eq!(backend.backoff(1), Duration::from_millis(20));
        assert_eq!(backend.backoff(3), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn unreachable_server_is_retried_then_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = NetworkBackend::new(target(&format!("http://{addr}"))).unwrap();
        let err = backend.get("tracking", &Params::new()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unreachable(_)), "{err:?}");
        assert!(!backend.is_connected());

        let metrics = backend.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.connection_state, ConnectionState::Error);
    }
}
