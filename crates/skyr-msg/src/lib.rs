//! ---
//! skyr_section: "02-messaging-ipc-data-model"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Message-bus seam and device request/reply payloads."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Topic based publish/subscribe abstraction used to bridge Alpaca calls
//! onto a message bus, plus the JSON payloads exchanged on it.

pub mod bus;
pub mod qos;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by bus implementations and payload codecs.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Raised when a transport is not available in this build.
    #[error("messaging transport not implemented: {0}")]
    Unimplemented(&'static str),
    /// The bus is not connected.
    #[error("message bus is disconnected")]
    Disconnected,
    /// Topic or filter failed validation.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
    /// QoS outside the 0..=2 range.
    #[error("invalid qos level {0}")]
    InvalidQos(u8),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use bus::{topic_matches, BusMessage, InMemoryBus, MessageBus, MqttBrokerBus, Subscription};
pub use qos::QoS;
pub use types::{
    request_topic, response_filter, response_topic, DeviceReply, DeviceRequest, HttpVerb,
};
