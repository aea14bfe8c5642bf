//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Alpaca device API routing to local metadata or the device backend."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Router};
use serde_json::{json, Value};
use skyr_msg::HttpVerb;
use tracing::{debug, warn};

use crate::backend::Params;
use crate::envelope::{AlpacaReply, AlpacaResponse, ErrorCode, TransactionIds};
use crate::registry::{DeviceKey, VirtualDevice};
use crate::server::{method_not_allowed, ReflectorState};

pub fn routes() -> Router<Arc<ReflectorState>> {
    Router::new().route(
        "/api/v1/:device_type/:device_number/:member",
        get(read_member)
            .put(write_member)
            .fallback(method_not_allowed),
    )
}

/// Parse urlencoded pairs. Repeated keys keep the last value.
pub fn parse_params(encoded: Option<&str>) -> Params {
    encoded
        .map(|encoded| {
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn param_bool(params: &Params, key: &str) -> Option<bool> {
    params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .and_then(|(_, value)| match value.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        })
}

/// Members answered from registry metadata without touching the backend.
fn local_member(device: &VirtualDevice, member: &str) -> Option<Value> {
    let value = match member {
        "description" => json!(device.description),
        "driverinfo" => json!(device.driver_info),
        "driverversion" => json!(device.driver_version),
        "interfaceversion" => json!(device.interface_version),
        "name" => json!(device.name),
        "supportedactions" => json!(Vec::<String>::new()),
        _ => return None,
    };
    Some(value)
}

async fn read_member(
    State(state): State<Arc<ReflectorState>>,
    Extension(ids): Extension<TransactionIds>,
    Path((device_type, device_number, member)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
) -> AlpacaReply {
    let params = parse_params(query.as_deref());
    dispatch(&state, ids, HttpVerb::Get, &device_type, &device_number, &member, params).await
}

async fn write_member(
    State(state): State<Arc<ReflectorState>>,
    Extension(ids): Extension<TransactionIds>,
    Path((device_type, device_number, member)): Path<(String, String, String)>,
    body: Bytes,
) -> AlpacaReply {
    let params = parse_params(std::str::from_utf8(&body).ok());
    dispatch(&state, ids, HttpVerb::Put, &device_type, &device_number, &member, params).await
}

async fn dispatch(
    state: &ReflectorState,
    ids: TransactionIds,
    verb: HttpVerb,
    device_type: &str,
    device_number: &str,
    member: &str,
    params: Params,
) -> AlpacaReply {
    let device = device_number
        .parse::<u32>()
        .ok()
        .and_then(|number| state.registry.get(&DeviceKey::new(device_type, number)));
    let Some(device) = device else {
        return AlpacaReply::with_status(
            StatusCode::BAD_REQUEST,
            AlpacaResponse::error(
                ErrorCode::INVALID_VALUE,
                format!("no device configured for {device_type}/{device_number}"),
                ids,
            ),
        );
    };
    let key = device.key.clone();
    let member = member.to_ascii_lowercase();

    if verb == HttpVerb::Get {
        if let Some(value) = local_member(&device, &member) {
            return AlpacaReply::ok(AlpacaResponse::success(Some(value), ids));
        }
    }

    let Some(backend) = state.dispatcher.backend(&key) else {
        return AlpacaReply::ok(AlpacaResponse::error(
            ErrorCode::NOT_IMPLEMENTED,
            format!("no backend for {key}"),
            ids,
        ));
    };

    let outcome = match verb {
        HttpVerb::Get => backend.get(&member, &params).await,
        HttpVerb::Put => backend.put(&member, &params).await,
    };

    match outcome {
        Ok(value) => {
            match verb {
                HttpVerb::Put if member == "connected" => {
                    if let Some(connected) = param_bool(&params, "Connected") {
                        state.registry.set_connected(&key, connected);
                    }
                }
                HttpVerb::Get => {
                    if let Some(value) = &value {
                        if member == "connected" {
                            if let Some(connected) = value.as_bool() {
                                state.registry.set_connected(&key, connected);
                            }
                        }
                        state.registry.record_value(&key, &member, value.clone());
                    }
                }
                HttpVerb::Put => {}
            }
            debug!(device = %key, member = %member, backend = backend.kind(), "device call served");
            AlpacaReply::ok(AlpacaResponse::success(value, ids))
        }
        Err(err) => {
            warn!(
                device = %key,
                member = %member,
                backend = backend.kind(),
                code = %err.code(),
                error = %err,
                "device call failed"
            );
            AlpacaReply::ok(AlpacaResponse::error(err.code(), err.to_string(), ids))
        }
    }
}
