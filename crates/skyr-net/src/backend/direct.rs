//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Reserved serial/USB backend that reports every call as not implemented."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde_json::Value;

use super::{BackendMetrics, DeviceBackend, Params};
use crate::error::DeviceError;
use crate::registry::DirectTarget;

/// Placeholder for locally attached hardware.
pub struct DirectBackend {
    target: DirectTarget,
}

impl DirectBackend {
    pub fn new(target: DirectTarget) -> Self {
        Self { target }
    }

    fn unavailable(&self) -> DeviceError {
        DeviceError::NotImplemented(format!(
            "direct hardware access ({})",
            self.target.port.as_deref().unwrap_or("no port")
        ))
    }
}

#[async_trait]
impl DeviceBackend for DirectBackend {
    async fn connect(&self) -> Result<(), DeviceError> {
        Err(self.unavailable())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn get(&self, _member: &str, _params: &Params) -> Result<Option<Value>, DeviceError> {
        Err(self.unavailable())
    }

    async fn put(&self, _member: &str, _params: &Params) -> Result<Option<Value>, DeviceError> {
        Err(self.unavailable())
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        Err(self.unavailable())
    }

    fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}
