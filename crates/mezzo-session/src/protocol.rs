//! Signaling protocol — request/response pairs plus server-pushed events
//! over one long-lived WebSocket per client.
//!
//! The media itself never touches this channel; it only carries negotiation
//! and lifecycle messages.

use mezzo_engine::{Capabilities, MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client → server requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ClientRequest {
    /// First message on the socket; answered with [`ServerMessage::Connected`].
    Connect,

    /// Re-request the engine's codec capabilities.
    GetCapabilities,

    CreateTransport {
        direction: TransportDirection,
    },

    ConnectTransport {
        transport_id: Uuid,
        /// Opaque negotiation blob relayed to the engine.
        client_params: serde_json::Value,
    },

    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        /// Opaque media parameters relayed to the engine.
        rtp_parameters: serde_json::Value,
    },

    Consume {
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: Capabilities,
    },

    ResumeConsumer {
        consumer_id: Uuid,
    },
}

/// Server → client messages: direct replies and pushed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ServerMessage {
    // === Replies ===
    Connected {
        session_id: Uuid,
        capabilities: Capabilities,
        existing_producers: Vec<ProducerInfo>,
        bridge: BridgeInfo,
    },

    Capabilities {
        capabilities: Capabilities,
    },

    TransportCreated {
        transport_id: Uuid,
        params: serde_json::Value,
    },

    TransportConnected {
        transport_id: Uuid,
    },

    Produced {
        producer_id: Uuid,
    },

    Consumed {
        consumer_id: Uuid,
        producer_id: Uuid,
        kind: MediaKind,
        params: serde_json::Value,
    },

    ConsumerResumed {
        consumer_id: Uuid,
    },

    // === Pushed events ===
    ProducerAvailable {
        producer_id: Uuid,
        kind: MediaKind,
    },

    ProducerClosed {
        producer_id: Uuid,
    },

    ConsumerClosed {
        consumer_id: Uuid,
    },

    BridgeStatus {
        running: bool,
        playlist: Option<String>,
    },

    BridgeDegraded {
        diagnostics: String,
    },

    /// Response-level error; the connection stays up.
    Error {
        code: String,
        message: String,
    },
}

/// A producer another session may consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: Uuid,
    pub kind: MediaKind,
}

/// Bridge status as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub running: bool,
    pub playlist: Option<String>,
}

/// Who a pushed event is for. The WebSocket layer filters on this; the
/// orchestrator never talks to sockets directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    All,
    /// Everyone except the named session (e.g. a producer's owner).
    Exclude(Uuid),
    /// Only the named session (e.g. "your consumer closed").
    Only(Uuid),
}

impl EventScope {
    pub fn matches(&self, session_id: Uuid) -> bool {
        match self {
            EventScope::All => true,
            EventScope::Exclude(excluded) => *excluded != session_id,
            EventScope::Only(only) => *only == session_id,
        }
    }
}

/// A pushed event on the orchestrator's broadcast channel.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub scope: EventScope,
    pub message: ServerMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_the_wire_shape() {
        let raw = r#"{"op":"create_transport","d":{"direction":"send"}}"#;
        let req: ClientRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            req,
            ClientRequest::CreateTransport {
                direction: TransportDirection::Send
            }
        ));

        let msg = ServerMessage::ProducerAvailable {
            producer_id: Uuid::nil(),
            kind: MediaKind::Video,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "producer_available");
        assert_eq!(json["d"]["kind"], "video");
    }

    #[test]
    fn scope_filtering() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(EventScope::All.matches(me));
        assert!(!EventScope::Exclude(me).matches(me));
        assert!(EventScope::Exclude(other).matches(me));
        assert!(EventScope::Only(me).matches(me));
        assert!(!EventScope::Only(other).matches(me));
    }
}
