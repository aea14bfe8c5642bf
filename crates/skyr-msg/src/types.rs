//! ---
//! skyr_section: "02-messaging-ipc-data-model"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Device request/reply payloads and topic layout."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::Result;

/// Topic a device request is published on.
pub fn request_topic(prefix: &str, device_type: &str, device_number: u32, method: &str) -> String {
    format!("{prefix}/request/{device_type}/{device_number}/{method}")
}

/// Topic the reply to `request_id` is expected on.
pub fn response_topic(prefix: &str, request_id: &Uuid) -> String {
    format!("{prefix}/response/{request_id}")
}

/// Filter matching every reply topic under `prefix`.
pub fn response_filter(prefix: &str) -> String {
    format!("{prefix}/response/+")
}

/// HTTP verb of the Alpaca call being bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    /// Property read.
    Get,
    /// Property write or method call.
    Put,
}

/// Alpaca call forwarded onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// Correlation identifier echoed in the reply.
    pub request_id: Uuid,
    /// Logical telescope the device belongs to, when scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telescope_id: Option<String>,
    /// ASCOM device type.
    pub device_type: String,
    /// ASCOM device number.
    pub device_number: u32,
    /// Lower-case Alpaca member name.
    pub method: String,
    /// Verb of the original call.
    pub http_method: HttpVerb,
    /// Query or form parameters of the original call.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl DeviceRequest {
    /// Build a request with a fresh correlation id.
    pub fn new(
        device_type: impl Into<String>,
        device_number: u32,
        method: impl Into<String>,
        http_method: HttpVerb,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            telescope_id: None,
            device_type: device_type.into(),
            device_number,
            method: method.into(),
            http_method,
            parameters,
            timestamp: Utc::now(),
        }
    }

    /// Scope the request to a logical telescope.
    pub fn with_telescope(mut self, telescope_id: impl Into<String>) -> Self {
        self.telescope_id = Some(telescope_id.into());
        self
    }

    /// Encode as a JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a JSON payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Reply correlated to a [`DeviceRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReply {
    /// Identifier of the request being answered.
    pub request_id: Uuid,
    /// Returned value, absent for void members and failures.
    #[serde(default)]
    pub value: Option<JsonValue>,
    /// ASCOM error number, zero on success.
    #[serde(default)]
    pub error_number: i32,
    /// ASCOM error message, empty on success.
    #[serde(default)]
    pub error_message: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl DeviceReply {
    /// Successful reply carrying `value`.
    pub fn success(request_id: Uuid, value: Option<JsonValue>) -> Self {
        Self {
            request_id,
            value,
            error_number: 0,
            error_message: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed reply carrying an ASCOM error.
    pub fn failure(request_id: Uuid, error_number: i32, error_message: impl Into<String>) -> Self {
        Self {
            request_id,
            value: None,
            error_number,
            error_message: error_message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Encode as a JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a JSON payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
