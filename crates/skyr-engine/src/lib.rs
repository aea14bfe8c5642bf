//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Device pool engine crate root."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Client-side view of Alpaca devices: finds servers on the network, keeps a
//! pool of managed devices grouped into telescopes, and demotes devices that
//! stop answering health probes.

pub mod client;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod health;
pub mod model;

pub use client::{AlpacaClient, DeviceControl, CLIENT_ID};
pub use discovery::{broadcast_target, discover, discover_at, discover_servers};
pub use engine::{DevicePoolEngine, EngineHandle, ManagedDevice, TelescopePool};
pub use error::{ClientError, EngineError};
pub use health::{
    DeviceState, HealthDetails, HealthEvent, HealthReport, HealthStatus, FAILURE_THRESHOLD,
};
pub use model::{
    AlpacaDevice, CameraState, CameraStatus, DeviceRole, DomeStatus, FilterWheelStatus, FocuserStatus, ShutterState,
    TelescopeStatus,
};
