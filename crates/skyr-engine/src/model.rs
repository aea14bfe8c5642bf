//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Device, role, and status models shared by the client and the engine."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyr_net::ConfiguredDevice;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// A device hosted by some Alpaca server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlpacaDevice {
    /// `{server_url}-{device_type}-{device_number}`.
    pub device_id: String,
    pub device_type: String,
    pub device_number: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub server_url: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl AlpacaDevice {
    pub fn new(server_url: &str, device_type: &str, device_number: u32) -> Self {
        let server_url = server_url.trim_end_matches('/').to_owned();
        Self {
            device_id: Self::id_for(&server_url, device_type, device_number),
            device_type: device_type.to_owned(),
            device_number,
            name: format!("{device_type} #{device_number}"),
            description: String::new(),
            server_url,
            unique_id: String::new(),
            connected: false,
            last_seen: Utc::now(),
        }
    }

    pub fn id_for(server_url: &str, device_type: &str, device_number: u32) -> String {
        format!("{server_url}-{device_type}-{device_number}")
    }

    /// Device entry built from a server's `configureddevices` listing.
    pub fn from_configured(server_url: &str, entry: &ConfiguredDevice) -> Self {
        let mut device = Self::new(server_url, &entry.device_type, entry.device_number);
        device.name = entry.device_name.clone();
        device.unique_id = entry.unique_id.clone();
        device
    }

    /// Base path of the device's Alpaca endpoints.
    pub fn api_base(&self) -> String {
        format!(
            "{}/api/v1/{}/{}",
            self.server_url,
            self.device_type.to_ascii_lowercase(),
            self.device_number
        )
    }
}

/// Position a device occupies inside a telescope pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceRole {
    Telescope,
    Camera,
    Dome,
    Focuser,
    FilterWheel,
    Rotator,
    Switch,
    Safety,
    ObservingConditions,
    CoverCalibrator,
}

/// Snapshot of a mount's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelescopeStatus {
    pub connected: bool,
    pub tracking: bool,
    pub slewing: bool,
    pub at_park: bool,
    /// Hours.
    pub right_ascension: f64,
    /// Degrees.
    pub declination: f64,
    pub altitude: f64,
    pub azimuth: f64,
}

/// ASCOM `CameraState` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum CameraState {
    Idle,
    Waiting,
    Exposing,
    Reading,
    Download,
    Error,
}

impl CameraState {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Idle,
            1 => Self::Waiting,
            2 => Self::Exposing,
            3 => Self::Reading,
            4 => Self::Download,
            5 => Self::Error,
            _ => return None,
        })
    }
}

/// ASCOM `ShutterState` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

impl ShutterState {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Open,
            1 => Self::Closed,
            2 => Self::Opening,
            3 => Self::Closing,
            4 => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub connected: bool,
    /// `None` when the device reports an unknown code.
    pub camera_state: Option<CameraState>,
    /// Celsius.
    pub ccd_temperature: f64,
    pub cooler_on: bool,
    /// Percent.
    pub cooler_power: f64,
    pub image_ready: bool,
    pub percent_completed: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomeStatus {
    pub connected: bool,
    pub at_home: bool,
    pub at_park: bool,
    pub slewing: bool,
    /// Degrees.
    pub azimuth: f64,
    pub shutter_status: Option<ShutterState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocuserStatus {
    pub connected: bool,
    pub is_moving: bool,
    /// Steps.
    pub position: i32,
    pub max_step: i32,
    pub temp_comp: bool,
    /// Celsius.
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterWheelStatus {
    pub connected: bool,
    /// Zero-based slot, `-1` while the wheel is moving.
    pub position: i32,
    pub names: Vec<String>,
}
