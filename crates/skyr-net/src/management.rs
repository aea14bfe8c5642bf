//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Alpaca management API: api versions, server description, configured devices."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skyr_common::ServerConfig;

use crate::envelope::{AlpacaReply, AlpacaResponse, TransactionIds};
use crate::registry::VirtualDevice;
use crate::server::{method_not_allowed, ReflectorState};

/// Alpaca API versions served.
pub const SUPPORTED_API_VERSIONS: &[i32] = &[1];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerDescription {
    pub server_name: String,
    pub manufacturer: String,
    pub manufacturer_version: String,
    pub location: String,
}

impl From<&ServerConfig> for ServerDescription {
    fn from(server: &ServerConfig) -> Self {
        Self {
            server_name: server.server_name.clone(),
            manufacturer: server.manufacturer.clone(),
            manufacturer_version: server.manufacturer_version.clone(),
            location: server.location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredDevice {
    #[serde(rename = "DeviceName")]
    pub device_name: String,
    #[serde(rename = "DeviceType")]
    pub device_type: String,
    #[serde(rename = "DeviceNumber")]
    pub device_number: u32,
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
}

impl From<&VirtualDevice> for ConfiguredDevice {
    fn from(device: &VirtualDevice) -> Self {
        Self {
            device_name: device.name.clone(),
            device_type: device.device_type.clone(),
            device_number: device.key.device_number,
            unique_id: device.unique_id.clone(),
        }
    }
}

pub fn routes() -> Router<Arc<ReflectorState>> {
    Router::new()
        .route(
            "/management/apiversions",
            get(api_versions).fallback(method_not_allowed),
        )
        .route(
            "/management/v1/description",
            get(description).fallback(method_not_allowed),
        )
        .route(
            "/management/v1/configureddevices",
            get(configured_devices).fallback(method_not_allowed),
        )
}

async fn api_versions(Extension(ids): Extension<TransactionIds>) -> AlpacaReply {
    AlpacaReply::ok(AlpacaResponse::success(Some(json!(SUPPORTED_API_VERSIONS)), ids))
}

async fn description(
    State(state): State<Arc<ReflectorState>>,
    Extension(ids): Extension<TransactionIds>,
) -> AlpacaReply {
    AlpacaReply::ok(AlpacaResponse::success(Some(json!(state.description)), ids))
}

async fn configured_devices(
    State(state): State<Arc<ReflectorState>>,
    Extension(ids): Extension<TransactionIds>,
) -> AlpacaReply {
    let devices: Vec<ConfiguredDevice> = state
        .registry
        .list()
        .iter()
        .map(ConfiguredDevice::from)
        .collect();
    AlpacaReply::ok(AlpacaResponse::success(Some(json!(devices)), ids))
}
