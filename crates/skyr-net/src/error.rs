//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Backend failure taxonomy and its ASCOM error mapping."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::time::Duration;

use skyr_msg::MessagingError;
use thiserror::Error;

use crate::envelope::ErrorCode;

/// Failure reported by a device backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device is not connected")]
    NotConnected,
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// The remote device answered with a non-zero ASCOM error.
    #[error("{message}")]
    Ascom { code: ErrorCode, message: String },
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Malformed(String),
    #[error("message bus error: {0}")]
    Bus(String),
    #[error("{0}")]
    Internal(String),
}

impl DeviceError {
    /// ASCOM error number reported to Alpaca clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            DeviceError::NotConnected | DeviceError::Unreachable(_) => ErrorCode::NOT_CONNECTED,
            DeviceError::Ascom { code, .. } => *code,
            DeviceError::NotImplemented(_) => ErrorCode::NOT_IMPLEMENTED,
            DeviceError::InvalidValue(_) => ErrorCode::INVALID_VALUE,
            DeviceError::InvalidOperation(_) => ErrorCode::INVALID_OPERATION,
            DeviceError::Timeout(_)
            | DeviceError::HttpStatus { .. }
            | DeviceError::Malformed(_)
            | DeviceError::Bus(_)
            | DeviceError::Internal(_) => ErrorCode::UNSPECIFIED,
        }
    }

    /// Transport failures worth another attempt. ASCOM errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Unreachable(_) | DeviceError::Timeout(_) => true,
            DeviceError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<MessagingError> for DeviceError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::Disconnected => DeviceError::NotConnected,
            other => DeviceError::Bus(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_onto_ascom_codes() {
        assert_eq!(DeviceError::NotConnected.code(), ErrorCode::NOT_CONNECTED);
        assert_eq!(
            DeviceError::Unreachable("refused".into()).code(),
            ErrorCode::NOT_CONNECTED
        );
        assert_eq!(
            DeviceError::Ascom {
                code: ErrorCode::INVALID_WHILE_PARKED,
                message: "parked".into()
            }
            .code(),
            ErrorCode::INVALID_WHILE_PARKED
        );
        assert_eq!(
            DeviceError::NotImplemented("x".into()).code(),
            ErrorCode::NOT_IMPLEMENTED
        );
        assert_eq!(DeviceError::InvalidValue("x".into()).code(), ErrorCode::INVALID_VALUE);
        assert_eq!(
            DeviceError::InvalidOperation("x".into()).code(),
            ErrorCode::INVALID_OPERATION
        );
        assert_eq!(
            DeviceError::Timeout(Duration::from_secs(1)).code(),
            ErrorCode::UNSPECIFIED
        );
    }

    #[test]
    fn only_transport_failures_are_retried() {
        assert!(DeviceError::Unreachable("reset".into()).is_retryable());
        assert!(DeviceError::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!DeviceError::HttpStatus {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!DeviceError::Ascom {
            code: ErrorCode::UNSPECIFIED,
            message: "boom".into()
        }
        .is_retryable());
    }

    #[test]
    fn bus_disconnect_means_not_connected() {
        assert_eq!(
            DeviceError::from(MessagingError::Disconnected),
            DeviceError::NotConnected
        );
    }
}
