//! # Mezzo Server
//!
//! Main binary that wires the services together:
//! - Signaling WebSocket (transport/producer/consumer negotiation)
//! - HTTP surface (HLS delivery + stream ops endpoints)
//! - HLS bridge supervisor and its health monitor
//!
//! One process, two listeners. The engine event loop runs alongside them;
//! if the engine worker dies the whole process exits so a supervisor can
//! restart it clean.

mod routes;

use mezzo_bridge::{spawn_health_monitor, BridgeSupervisor};
use mezzo_engine::{MediaEngine, UdpEngine};
use mezzo_session::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = mezzo_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mezzo=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Mezzo v{}", env!("CARGO_PKG_VERSION"));

    // === Media engine ===
    let engine: Arc<UdpEngine> = Arc::new(UdpEngine::from_config(&config.engine)?);
    let engine_rx = engine.subscribe();
    tracing::info!(
        listen_ip = %config.engine.listen_ip,
        rtc_ports = format!("{}-{}", config.engine.rtc_min_port, config.engine.rtc_max_port),
        "Media engine ready"
    );

    // === HLS bridge ===
    let (bridge, bridge_rx) = BridgeSupervisor::new(
        engine.clone(),
        config.bridge.clone(),
        config.health.stall_threshold,
    );
    spawn_health_monitor(
        bridge.clone(),
        Duration::from_secs(config.health.interval_secs),
    );
    tracing::info!(output = %config.bridge.output_dir, "HLS bridge ready");

    // === Orchestrator ===
    let orchestrator = Orchestrator::new(engine, bridge);

    // === Listeners ===
    let signaling_router = mezzo_session::build_router(orchestrator.clone());
    let signaling_addr = SocketAddr::new(
        config.server.host.parse()?,
        config.server.signaling_port,
    );

    let http_router = routes::build_router(orchestrator.clone());
    let http_addr = SocketAddr::new(config.server.host.parse()?, config.server.http_port);

    tracing::info!("Signaling listening on ws://{signaling_addr}/ws");
    tracing::info!("HTTP listening on http://{http_addr}");

    tokio::try_join!(
        async {
            let listener = tokio::net::TcpListener::bind(signaling_addr).await?;
            axum::serve(listener, signaling_router).await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            let listener = tokio::net::TcpListener::bind(http_addr).await?;
            axum::serve(listener, http_router).await?;
            Ok::<_, anyhow::Error>(())
        },
        // Engine + bridge event loop. Returns an error when the engine
        // worker dies, which takes the whole process down with it.
        orchestrator.run_events(engine_rx, bridge_rx),
    )?;

    Ok(())
}
