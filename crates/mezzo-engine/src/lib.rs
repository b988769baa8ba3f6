//! # mezzo-engine
//!
//! Gateway to the media-routing engine. The orchestrator talks to the engine
//! only through the [`MediaEngine`] trait: capability negotiation, transport
//! creation, produce/consume and teardown. Every call can fail with
//! [`EngineError`]; the gateway never retries — retry policy belongs to the
//! caller.
//!
//! The engine's RTP/RTCP processing itself is out of scope here. The
//! in-process [`UdpEngine`] owns the identities, the UDP ports transports
//! live on, and codec capability matching — exactly the surface the
//! orchestration layer observes.

pub mod types;
pub mod udp;

use tokio::sync::broadcast;
use uuid::Uuid;

pub use types::{
    Capabilities, ConsumerHandle, MediaKind, RtpCodec, SinkHandle, TransportDirection,
    TransportHandle,
};
pub use udp::UdpEngine;

/// Errors surfaced by the media-routing engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No free ports in the configured RTP range {min}-{max}")]
    NoPortsAvailable { min: u16, max: u16 },

    #[error("{kind} {id} not found in engine")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Operation rejected by engine: {0}")]
    Rejected(String),
}

impl From<EngineError> for mezzo_common::MezzoError {
    fn from(e: EngineError) -> Self {
        mezzo_common::MezzoError::Engine {
            reason: e.to_string(),
        }
    }
}

/// Engine-originated events, delivered to the orchestrator's event loop.
///
/// Cleanup driven by these events goes through the orchestrator so teardown
/// ordering stays auditable — no callbacks hang off individual resources.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A transport closed underneath its producers; the orchestrator must run
    /// the producer-close cascade for each.
    ProducerTransportClosed {
        transport_id: Uuid,
        producer_ids: Vec<Uuid>,
    },
    /// The engine's process-level worker died. Unrecoverable: no session can
    /// be served without it, so the process should exit.
    WorkerDied { reason: String },
}

/// Abstract capability of the external media-routing engine.
///
/// One router exists per process, created once at startup; all ids handed out
/// are engine-scoped and owned by exactly one logical owner at a time.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// The engine's codec capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Create a send or receive transport, returning its id and the
    /// connection-parameters blob for the client.
    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportHandle, EngineError>;

    /// Complete transport negotiation with the client's parameters.
    async fn connect_transport(
        &self,
        transport_id: Uuid,
        client_params: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Publish a track on a send transport.
    async fn produce(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<Uuid, EngineError>;

    /// Whether `client_caps` can receive the given producer's media.
    /// Must be checked before every [`consume`](Self::consume).
    async fn can_consume(
        &self,
        producer_id: Uuid,
        client_caps: &Capabilities,
    ) -> Result<bool, EngineError>;

    /// Create a consumer (paused) on a receive transport, pulling the given
    /// producer's media.
    async fn consume(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        client_caps: &Capabilities,
    ) -> Result<ConsumerHandle, EngineError>;

    /// Resume a paused consumer.
    async fn resume(&self, consumer_id: Uuid) -> Result<(), EngineError>;

    /// Close any engine resource by id. Closing an already-absent id is a
    /// no-op — the registry guards against double-close, and the engine
    /// honors the same contract.
    async fn close(&self, id: Uuid) -> Result<(), EngineError>;

    /// Allocate the bridge's plain RTP sink transport.
    async fn create_plain_sink(&self) -> Result<SinkHandle, EngineError>;

    /// Subscribe to engine-originated events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
