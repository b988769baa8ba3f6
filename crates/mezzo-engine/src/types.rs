//! Wire-level descriptors exchanged between the orchestrator, the engine
//! and clients. Connection parameter blobs are opaque `serde_json::Value`s —
//! the orchestrator records and relays them but never interprets them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Direction of a negotiated transport, from the owning session's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// A single codec the engine can route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodec {
    pub kind: MediaKind,
    /// e.g. "audio/opus", "video/VP8"
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub payload_type: u8,
}

/// The engine's codec capability descriptor, sent to clients on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub codecs: Vec<RtpCodec>,
}

impl Capabilities {
    /// The codec set routed by the engine: Opus audio and VP8 video.
    pub fn supported() -> Self {
        Self {
            codecs: vec![
                RtpCodec {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".into(),
                    clock_rate: 48_000,
                    channels: Some(2),
                    payload_type: 100,
                },
                RtpCodec {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".into(),
                    clock_rate: 90_000,
                    channels: None,
                    payload_type: 96,
                },
            ],
        }
    }

    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodec> {
        self.codecs.iter().find(|c| c.kind == kind)
    }

    /// Whether this capability set includes a codec with the given mime type.
    pub fn includes_mime(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// A freshly created transport: its id plus the connection-parameters blob
/// relayed verbatim to the requesting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportHandle {
    pub id: Uuid,
    pub params: serde_json::Value,
}

/// A freshly created consumer: created paused, resumed on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerHandle {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    pub params: serde_json::Value,
}

/// The bridge's ingest point inside the engine: a plain RTP sink the
/// transcoder reads from.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    pub transport_id: Uuid,
    pub rtp_port: u16,
    pub payload_type: u8,
    pub clock_rate: u32,
}
