//! Relay-channel wire format.
//!
//! Messages are JSON objects tagged by `type`:
//!   `{"type":"offer","id":"<sender>","offer":<descriptor>}`
//!   `{"type":"signal","id":"<sender>","target":"<offerer>","signal":<descriptor>}`
//!
//! Descriptors are opaque to this module. Anything that does not parse is
//! dropped by the receiver.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::SwarmError;

/// Opaque connection-establishment descriptor produced by a link factory.
pub type Descriptor = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { id: String, offer: Descriptor },
    Signal { id: String, target: String, signal: Descriptor },
}

impl SignalMessage {
    pub fn sender(&self) -> &str {
        match self {
            SignalMessage::Offer { id, .. } | SignalMessage::Signal { id, .. } => id,
        }
    }

    pub fn encode(&self) -> Result<String, SwarmError> {
        serde_json::to_string(self).map_err(|e| SwarmError::Signaling(e.to_string()))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                trace!("dropping relay message: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_wire_shape() {
        let msg = SignalMessage::Offer { id: "a1".into(), offer: json!({"sdp": "x"}) };
        let v: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "offer", "id": "a1", "offer": {"sdp": "x"}}));
    }

    #[test]
    fn decodes_signal() {
        let raw = r#"{"type":"signal","id":"b2","target":"a1","signal":{"sdp":"y"}}"#;
        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(msg.sender(), "b2");
        assert!(matches!(msg, SignalMessage::Signal { ref target, .. } if target == "a1"));
    }

    #[test]
    fn malformed_messages_are_dropped() {
        assert!(SignalMessage::decode("not json").is_none());
        assert!(SignalMessage::decode(r#"{"type":"hello","id":"x"}"#).is_none());
        assert!(SignalMessage::decode(r#"{"type":"signal","id":"x","signal":1}"#).is_none());
        assert!(SignalMessage::decode(r#"{"id":"x","offer":{}}"#).is_none());
    }
}
