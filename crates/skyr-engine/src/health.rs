//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Managed device health state machine and health report."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Consecutive failed checks that demote a connected device.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Connection state of a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Unknown,
    Connecting,
    Connected { consecutive_failures: u32 },
    Disconnected,
}

/// Inputs to [`DeviceState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    CheckPassed,
    CheckFailed,
    /// The device answered but says it is not connected.
    ReportedDisconnected,
    DisconnectRequested,
}

impl DeviceState {
    /// Apply one event. Pairs without a rule leave the state as it is.
    pub fn next(self, event: HealthEvent) -> DeviceState {
        use DeviceState::*;
        use HealthEvent::*;
        match (self, event) {
            (_, DisconnectRequested) => Disconnected,
            (_, ConnectSucceeded) => Connected {
                consecutive_failures: 0,
            },
            (Connected { .. }, ConnectRequested) => self,
            (_, ConnectRequested) => Connecting,
            (Connecting, ConnectFailed) => Disconnected,
            (Connected { .. }, CheckPassed) => Connected {
                consecutive_failures: 0,
            },
            (
                Connected {
                    consecutive_failures,
                },
                CheckFailed,
            ) => {
                let failures = consecutive_failures + 1;
                if failures >= FAILURE_THRESHOLD {
                    Disconnected
                } else {
                    Connected {
                        consecutive_failures: failures,
                    }
                }
            }
            (Connected { .. }, ReportedDisconnected) => Disconnected,
            (state, _) => state,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, DeviceState::Connected { .. })
    }

    /// Failures recorded since the last success; zero outside `Connected`.
    pub fn fail_count(self) -> u32 {
        match self {
            DeviceState::Connected {
                consecutive_failures,
            } => consecutive_failures,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDetails {
    pub total_devices: usize,
    pub connected_devices: usize,
    pub healthy_devices: usize,
    pub telescope_count: usize,
}

/// Result of an engine health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub details: HealthDetails,
}

impl HealthReport {
    pub fn from_details(details: HealthDetails) -> Self {
        let (status, message) = if details.total_devices > 0 && details.connected_devices == 0 {
            (HealthStatus::Unhealthy, "No devices connected".to_owned())
        } else if details.healthy_devices < details.connected_devices {
            (
                HealthStatus::Degraded,
                format!(
                    "Some devices unhealthy: {}/{}",
                    details.healthy_devices, details.connected_devices
                ),
            )
        } else {
            (
                HealthStatus::Healthy,
                format!("{} devices connected", details.connected_devices),
            )
        };
        Self {
            status,
            message,
            details,
        }
    }
}
