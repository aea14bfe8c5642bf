//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "ASCOM Alpaca reflector crate root."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Presents configured virtual devices over the Alpaca REST protocol and
//! forwards member calls to a remote Alpaca server, a message bus, or
//! (reserved) directly attached hardware.

pub mod backend;
pub mod device_api;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod management;
pub mod middleware;
pub mod registry;
pub mod server;

pub use backend::{
    BackendMetrics, ConnectionState, DeviceBackend, DirectBackend, Dispatcher, MqttBackend,
    NetworkBackend, Params,
};
pub use discovery::{DiscoveryHandle, DiscoveryResponder, DiscoveryResponse, DISCOVERY_TOKEN};
pub use envelope::{
    AlpacaReply, AlpacaResponse, ErrorCode, TransactionCounter, TransactionIds,
};
pub use error::DeviceError;
pub use management::{ConfiguredDevice, ServerDescription, SUPPORTED_API_VERSIONS};
pub use registry::{
    derive_unique_id, interface_version, BackendDescriptor, DeviceKey, DeviceRegistry,
    VirtualDevice,
};
pub use server::{ReflectorHandle, ReflectorServer};
