//! # mezzo-session
//!
//! Signaling and session orchestration: the WebSocket protocol clients speak,
//! the registry of who owns which transport/producer/consumer, and the
//! orchestrator that keeps the engine and the HLS bridge in step with it.

pub mod handler;
pub mod orchestrator;
pub mod protocol;
pub mod registry;

pub use handler::build_router;
pub use orchestrator::{ConnectReply, Orchestrator, StreamStatus};
pub use protocol::{ClientRequest, EventScope, ServerMessage, SessionEvent};
