//! # mezzo-bridge
//!
//! Lifecycle owner of the single transcoding pipeline that bridges the
//! engine's media into a pull-based HLS stream, plus the health monitor
//! that watches its output.

pub mod health;
pub mod output;
pub mod supervisor;

pub use health::spawn_health_monitor;
pub use output::{HlsOutput, OutputSnapshot, PLAYLIST_URL};
pub use supervisor::{BridgeEvent, BridgeState, BridgeStatus, BridgeSupervisor, StartOutcome};
