//! ---
//! skyr_section: "02-messaging-ipc-data-model"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Delivery guarantee levels understood by the bus."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::MessagingError;

/// Delivery guarantee requested for a publish, numbered as on an MQTT broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Redelivered until acknowledged.
    #[default]
    AtLeastOnce,
    /// Deduplicated delivery.
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = MessagingError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MessagingError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_to_integers() {
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
        assert!(matches!(
            QoS::try_from(3),
            Err(MessagingError::InvalidQos(3))
        ));
    }
}
