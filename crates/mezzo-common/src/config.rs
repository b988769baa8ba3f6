//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call mezzo_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = builder()?.build()?;
    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a config without touching the global — used by tests.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    builder()?.build()?.try_deserialize()
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    Ok(config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.http_port", 8000)?
        .set_default("server.signaling_port", 8001)?
        // Engine (media-routing) defaults — the RTP range the engine may
        // allocate transport ports from, as announced to clients.
        .set_default("engine.listen_ip", "127.0.0.1")?
        .set_default("engine.announced_ip", "")?
        .set_default("engine.rtc_min_port", 10000)?
        .set_default("engine.rtc_max_port", 10100)?
        // Bridge (HLS transcoding pipeline) defaults
        .set_default("bridge.output_dir", "./data/hls")?
        .set_default("bridge.ffmpeg_bin", "ffmpeg")?
        .set_default("bridge.segment_secs", 2)?
        .set_default("bridge.playlist_len", 10)?
        .set_default("bridge.start_grace_secs", 5)?
        .set_default("bridge.stop_grace_secs", 3)?
        // Health monitor defaults
        .set_default("health.interval_secs", 10)?
        .set_default("health.stall_threshold", 3)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (MEZZO_SERVER__HOST, MEZZO_BRIDGE__OUTPUT_DIR, etc.)
        .add_source(
            config::Environment::with_prefix("MEZZO")
                .separator("__")
                .try_parsing(true),
        ))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub bridge: BridgeConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port for the playback + ops HTTP surface.
    pub http_port: u16,
    /// Port for the signaling WebSocket.
    pub signaling_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// IP the engine binds its RTP transports on.
    pub listen_ip: String,
    /// Publicly announced IP for NAT traversal; empty means "same as listen_ip".
    pub announced_ip: String,
    /// Inclusive RTP port range the engine allocates from.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl EngineConfig {
    /// The address clients should be told to send media to.
    pub fn announced_or_listen_ip(&self) -> &str {
        if self.announced_ip.is_empty() {
            &self.listen_ip
        } else {
            &self.announced_ip
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    /// Directory the transcoder writes the manifest and segments into.
    pub output_dir: String,
    /// Transcoder executable.
    pub ffmpeg_bin: String,
    /// HLS segment duration in seconds.
    pub segment_secs: u32,
    /// Sliding playlist length in segments.
    pub playlist_len: u32,
    /// How long to wait for the pipeline to report readiness before
    /// declaring the start failed.
    pub start_grace_secs: u64,
    /// How long to wait for a graceful exit before force-killing.
    pub stop_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Health-check interval in seconds.
    pub interval_secs: u64,
    /// Consecutive non-advancing checks before the bridge is declared degraded.
    pub stall_threshold: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let cfg = load().expect("defaults must deserialize");
        assert_eq!(cfg.server.http_port, 8000);
        assert!(cfg.engine.rtc_min_port < cfg.engine.rtc_max_port);
        assert_eq!(cfg.engine.announced_or_listen_ip(), "127.0.0.1");
        assert!(cfg.health.stall_threshold >= 1);
    }
}
