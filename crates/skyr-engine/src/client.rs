//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Alpaca REST client used by the engine and by coordinators."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use skyr_net::envelope::{CLIENT_ID_KEY, CLIENT_TRANSACTION_KEY};
use skyr_net::{AlpacaResponse, ConfiguredDevice, TransactionCounter};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::model::{
    AlpacaDevice, CameraState, CameraStatus, DomeStatus, FilterWheelStatus, FocuserStatus, ShutterState,
    TelescopeStatus,
};

/// Client id sent with every call.
pub const CLIENT_ID: u32 = 1;

/// Connection control the engine needs from a device client.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn connect(&self, device: &AlpacaDevice) -> Result<(), ClientError>;
    async fn disconnect(&self, device: &AlpacaDevice) -> Result<(), ClientError>;
    /// What the device itself reports for `Connected`.
    async fn is_connected(&self, device: &AlpacaDevice) -> Result<bool, ClientError>;
}

/// Thin typed wrapper over the Alpaca device and management endpoints.
pub struct AlpacaClient {
    http: reqwest::Client,
    timeout: Duration,
    transactions: TransactionCounter,
}

impl AlpacaClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Request(err.to_string()))?;
        Ok(Self {
            http,
            timeout,
            transactions: TransactionCounter::new(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn ids(&self) -> [(&'static str, String); 2] {
        [
            (CLIENT_ID_KEY, CLIENT_ID.to_string()),
            (CLIENT_TRANSACTION_KEY, self.transactions.next().to_string()),
        ]
    }

    fn transport_error(&self, url: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                url: url.to_owned(),
                timeout: self.timeout,
            }
        } else if err.is_connect() || err.is_request() {
            ClientError::Unreachable {
                url: url.to_owned(),
                cause: err.to_string(),
            }
        } else {
            ClientError::Request(err.to_string())
        }
    }

    async fn decode(&self, url: &str, response: reqwest::Response) -> Result<Option<Value>, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
                body,
            });
        }
        let envelope: AlpacaResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))?;
        if !envelope.is_success() {
            return Err(ClientError::Ascom {
                code: envelope.error_number,
                message: envelope.error_message,
            });
        }
        Ok(envelope.value)
    }

    async fn fetch(&self, url: &str) -> Result<Option<Value>, ClientError> {
        let response = self
            .http
            .get(url)
            .query(&self.ids())
            .send()
            .await
            .map_err(|err| self.transport_error(url, err))?;
        self.decode(url, response).await
    }

    /// Read a device property.
    pub async fn get(&self, device: &AlpacaDevice, member: &str) -> Result<Option<Value>, ClientError> {
        let url = format!("{}/{}", device.api_base(), member.to_ascii_lowercase());
        debug!(url = %url, "alpaca get");
        self.fetch(&url).await
    }

    /// Write a property or invoke a method.
    pub async fn put(
        &self,
        device: &AlpacaDevice,
        member: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Value>, ClientError> {
        let url = format!("{}/{}", device.api_base(), member.to_ascii_lowercase());
        debug!(url = %url, "alpaca put");
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.extend(self.ids());
        let response = self
            .http
            .put(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| self.transport_error(&url, err))?;
        self.decode(&url, response).await
    }

    async fn get_as<T: DeserializeOwned>(&self, device: &AlpacaDevice, member: &str) -> Result<T, ClientError> {
        let value = self.get(device, member).await?.unwrap_or(Value::Null);
        serde_json::from_value(value.clone()).map_err(|_| ClientError::UnexpectedValue {
            member: member.to_owned(),
            found: value.to_string(),
        })
    }

    /// Devices a server exposes through its management API.
    pub async fn configured_devices(&self, server_url: &str) -> Result<Vec<AlpacaDevice>, ClientError> {
        let server_url = server_url.trim_end_matches('/');
        let url = format!("{server_url}/management/v1/configureddevices");
        let value = self.fetch(&url).await?.unwrap_or(Value::Array(Vec::new()));
        let entries: Vec<ConfiguredDevice> = serde_json::from_value(value)
            .map_err(|err| ClientError::Decode(err.to_string()))?;
        Ok(entries
            .iter()
            .map(|entry| AlpacaDevice::from_configured(server_url, entry))
            .collect())
    }

    pub async fn name(&self, device: &AlpacaDevice) -> Result<String, ClientError> {
        self.get_as(device, "name").await
    }

    pub async fn description(&self, device: &AlpacaDevice) -> Result<String, ClientError> {
        self.get_as(device, "description").await
    }

    pub async fn slew_to_coordinates(
        &self,
        device: &AlpacaDevice,
        right_ascension: f64,
        declination: f64,
    ) -> Result<(), ClientError> {
        self.put(
            device,
            "slewtocoordinates",
            &[
                ("RightAscension", right_ascension.to_string()),
                ("Declination", declination.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn park(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "park", &[]).await.map(drop)
    }

    pub async fn unpark(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "unpark", &[]).await.map(drop)
    }

    pub async fn set_tracking(&self, device: &AlpacaDevice, tracking: bool) -> Result<(), ClientError> {
        self.put(device, "tracking", &[("Tracking", tracking.to_string())])
            .await
            .map(drop)
    }

    pub async fn abort_slew(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "abortslew", &[]).await.map(drop)
    }

    /// Mount snapshot. Only the `connected` read is fatal; other members keep defaults on failure.
    pub async fn telescope_status(&self, device: &AlpacaDevice) -> Result<TelescopeStatus, ClientError> {
        let mut status = TelescopeStatus {
            connected: self.get_as(device, "connected").await?,
            ..TelescopeStatus::default()
        };
        if !status.connected {
            return Ok(status);
        }
        status.tracking = self.read_or_default(device, "tracking").await;
        status.slewing = self.read_or_default(device, "slewing").await;
        status.at_park = self.read_or_default(device, "atpark").await;
        status.right_ascension = self.read_or_default(device, "rightascension").await;
        status.declination = self.read_or_default(device, "declination").await;
        status.altitude = self.read_or_default(device, "altitude").await;
        status.azimuth = self.read_or_default(device, "azimuth").await;
        Ok(status)
    }

    /// Camera snapshot, read the same way as [`Self::telescope_status`].
    pub async fn camera_status(&self, device: &AlpacaDevice) -> Result<CameraStatus, ClientError> {
        let mut status = CameraStatus {
            connected: self.get_as(device, "connected").await?,
            ..CameraStatus::default()
        };
        if !status.connected {
            return Ok(status);
        }
        status.camera_state = self
            .read_or_default::<Option<i64>>(device, "camerastate")
            .await
            .and_then(CameraState::from_code);
        status.ccd_temperature = self.read_or_default(device, "ccdtemperature").await;
        status.cooler_on = self.read_or_default(device, "cooleron").await;
        status.cooler_power = self.read_or_default(device, "coolerpower").await;
        status.image_ready = self.read_or_default(device, "imageready").await;
        status.percent_completed = self.read_or_default(device, "percentcompleted").await;
        Ok(status)
    }

    pub async fn start_exposure(&self, device: &AlpacaDevice, duration: Duration, light: bool) -> Result<(), ClientError> {
        self.put(
            device,
            "startexposure",
            &[
                ("Duration", duration.as_secs_f64().to_string()),
                ("Light", light.to_string()),
            ],
        )
        .await
        .map(drop)
    }

    pub async fn stop_exposure(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "stopexposure", &[]).await.map(drop)
    }

    pub async fn abort_exposure(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "abortexposure", &[]).await.map(drop)
    }

    pub async fn set_cooler_on(&self, device: &AlpacaDevice, on: bool) -> Result<(), ClientError> {
        self.put(device, "cooleron", &[("CoolerOn", on.to_string())])
            .await
            .map(drop)
    }

    pub async fn dome_status(&self, device: &AlpacaDevice) -> Result<DomeStatus, ClientError> {
        let mut status = DomeStatus {
            connected: self.get_as(device, "connected").await?,
            ..DomeStatus::default()
        };
        if !status.connected {
            return Ok(status);
        }
        status.at_home = self.read_or_default(device, "athome").await;
        status.at_park = self.read_or_default(device, "atpark").await;
        status.slewing = self.read_or_default(device, "slewing").await;
        status.azimuth = self.read_or_default(device, "azimuth").await;
        status.shutter_status = self
            .read_or_default::<Option<i64>>(device, "shutterstatus")
            .await
            .and_then(ShutterState::from_code);
        Ok(status)
    }

    pub async fn slew_dome_to_azimuth(&self, device: &AlpacaDevice, azimuth: f64) -> Result<(), ClientError> {
        self.put(device, "slewtoazimuth", &[("Azimuth", azimuth.to_string())])
            .await
            .map(drop)
    }

    pub async fn open_shutter(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "openshutter", &[]).await.map(drop)
    }

    pub async fn close_shutter(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "closeshutter", &[]).await.map(drop)
    }

    pub async fn focuser_status(&self, device: &AlpacaDevice) -> Result<FocuserStatus, ClientError> {
        let mut status = FocuserStatus {
            connected: self.get_as(device, "connected").await?,
            ..FocuserStatus::default()
        };
        if !status.connected {
            return Ok(status);
        }
        status.is_moving = self.read_or_default(device, "ismoving").await;
        status.position = self.read_or_default(device, "position").await;
        status.max_step = self.read_or_default(device, "maxstep").await;
        status.temp_comp = self.read_or_default(device, "tempcomp").await;
        status.temperature = self.read_or_default(device, "temperature").await;
        Ok(status)
    }

    /// Absolute target for absolute focusers, a step offset for relative ones.
    pub async fn move_focuser(&self, device: &AlpacaDevice, position: i32) -> Result<(), ClientError> {
        self.put(device, "move", &[("Position", position.to_string())])
            .await
            .map(drop)
    }

    pub async fn halt_focuser(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "halt", &[]).await.map(drop)
    }

    pub async fn filter_wheel_status(&self, device: &AlpacaDevice) -> Result<FilterWheelStatus, ClientError> {
        let mut status = FilterWheelStatus {
            connected: self.get_as(device, "connected").await?,
            ..FilterWheelStatus::default()
        };
        if !status.connected {
            return Ok(status);
        }
        status.position = self.read_or_default(device, "position").await;
        status.names = self.read_or_default(device, "names").await;
        Ok(status)
    }

    pub async fn set_filter_wheel_position(&self, device: &AlpacaDevice, position: u32) -> Result<(), ClientError> {
        self.put(device, "position", &[("Position", position.to_string())])
            .await
            .map(drop)
    }

    async fn read_or_default<T: DeserializeOwned + Default>(&self, device: &AlpacaDevice, member: &str) -> T {
        match self.get_as(device, member).await {
            Ok(value) => value,
            Err(err) => {
                warn!(device_id = %device.device_id, member, error = %err, "device property unavailable");
                T::default()
            }
        }
    }
}

#[async_trait]
impl DeviceControl for AlpacaClient {
    async fn connect(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "connected", &[("Connected", "true".to_owned())])
            .await
            .map(drop)
    }

    async fn disconnect(&self, device: &AlpacaDevice) -> Result<(), ClientError> {
        self.put(device, "connected", &[("Connected", "false".to_owned())])
            .await
            .map(drop)
    }

    async fn is_connected(&self, device: &AlpacaDevice) -> Result<bool, ClientError> {
        self.get_as(device, "connected").await
    }
}
