//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Error types for the Alpaca client and the device pool engine."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::time::Duration;

use skyr_common::ConfigError;
use thiserror::Error;

/// Failure talking to an Alpaca server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("cannot reach {url}: {cause}")]
    Unreachable { url: String, cause: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus { url: String, status: u16, body: String },
    #[error("device error 0x{code:04X}: {message}")]
    Ascom { code: i32, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("unexpected value for {member}: {found}")]
    UnexpectedValue { member: String, found: String },
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// ASCOM error number when the device itself rejected the call.
    pub fn ascom_code(&self) -> Option<i32> {
        match self {
            ClientError::Ascom { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Failure of a device pool operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device {0} not registered")]
    NotRegistered(String),
    #[error("device {0} already registered")]
    AlreadyRegistered(String),
    #[error("telescope {0} not registered")]
    TelescopeNotFound(String),
    #[error("device role {role} not found for telescope {telescope_id}")]
    RoleNotFound { telescope_id: String, role: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::NotRegistered(_)
                | EngineError::TelescopeNotFound(_)
                | EngineError::RoleNotFound { .. }
        )
    }
}
