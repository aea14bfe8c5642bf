//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Alpaca response envelope, ASCOM error codes, and transaction numbering."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query/form key carrying the client's transaction number.
pub const CLIENT_TRANSACTION_KEY: &str = "ClientTransactionID";
/// Query/form key carrying the client's identifier.
pub const CLIENT_ID_KEY: &str = "ClientID";

/// ASCOM error number carried in `ErrorNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0x0000);
    pub const NOT_IMPLEMENTED: ErrorCode = ErrorCode(0x0400);
    pub const INVALID_VALUE: ErrorCode = ErrorCode(0x0401);
    pub const VALUE_NOT_SET: ErrorCode = ErrorCode(0x0402);
    pub const NOT_CONNECTED: ErrorCode = ErrorCode(0x0407);
    pub const INVALID_WHILE_PARKED: ErrorCode = ErrorCode(0x0408);
    pub const INVALID_WHILE_SLAVED: ErrorCode = ErrorCode(0x0409);
    pub const INVALID_OPERATION: ErrorCode = ErrorCode(0x040B);
    pub const ACTION_NOT_IMPLEMENTED: ErrorCode = ErrorCode(0x040C);
    pub const UNSPECIFIED: ErrorCode = ErrorCode(0x04FF);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Transaction numbers attached to one request by the middleware chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionIds {
    pub client: i32,
    pub server: i32,
}

/// Monotonic server transaction numbering. Never yields zero; wraps back to 1.
#[derive(Debug, Default)]
pub struct TransactionCounter {
    last: AtomicI32,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose next value follows `last`.
    pub fn starting_after(last: i32) -> Self {
        Self {
            last: AtomicI32::new(last),
        }
    }

    pub fn next(&self) -> i32 {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(successor(current))
            })
            .unwrap_or_else(|current| current);
        successor(previous)
    }
}

fn successor(current: i32) -> i32 {
    if current <= 0 || current == i32::MAX {
        1
    } else {
        current + 1
    }
}

/// Interpret a raw `ClientTransactionID`. Any int32 is echoed as sent; absent or malformed values become 0.
pub fn parse_client_transaction_id(raw: Option<&str>) -> i32 {
    raw.and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(0)
}

/// Case-insensitive lookup of `key` in a urlencoded string.
pub fn find_param(encoded: Option<&str>, key: &str) -> Option<String> {
    let encoded = encoded?;
    url::form_urlencoded::parse(encoded.as_bytes())
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.into_owned())
}

/// The JSON body every Alpaca endpoint answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlpacaResponse {
    #[serde(rename = "Value", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "ClientTransactionID", default)]
    pub client_transaction_id: i32,
    #[serde(rename = "ServerTransactionID", default)]
    pub server_transaction_id: i32,
    #[serde(rename = "ErrorNumber", default)]
    pub error_number: i32,
    #[serde(rename = "ErrorMessage", default)]
    pub error_message: String,
}

impl AlpacaResponse {
    pub fn success(value: Option<Value>, ids: TransactionIds) -> Self {
        Self {
            value,
            client_transaction_id: ids.client,
            server_transaction_id: ids.server,
            error_number: 0,
            error_message: String::new(),
        }
    }

    /// Failed response. A zero code or empty message is replaced so the pair stays consistent.
    pub fn error(code: ErrorCode, message: impl Into<String>, ids: TransactionIds) -> Self {
        let code = if code.is_success() {
            ErrorCode::UNSPECIFIED
        } else {
            code
        };
        let mut message = message.into();
        if message.is_empty() {
            message = format!("ASCOM error {code}");
        }
        Self {
            value: None,
            client_transaction_id: ids.client,
            server_transaction_id: ids.server,
            error_number: code.0,
            error_message: message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_number == 0
    }
}

/// Error text attached to a response for the request logger.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

/// An envelope paired with its HTTP status.
#[derive(Debug, Clone)]
pub struct AlpacaReply {
    pub status: StatusCode,
    pub body: AlpacaResponse,
}

impl AlpacaReply {
    pub fn ok(body: AlpacaResponse) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn with_status(status: StatusCode, body: AlpacaResponse) -> Self {
        Self { status, body }
    }
}

impl IntoResponse for AlpacaReply {
    fn into_response(self) -> Response {
        let detail = (!self.body.is_success()).then(|| ErrorDetail(self.body.error_message.clone()));
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(detail) = detail {
            response.extensions_mut().insert(detail);
        }
        response
    }
}
