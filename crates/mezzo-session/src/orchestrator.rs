//! Session orchestrator — the one place that mutates session state.
//!
//! Owns the resource registry and drives the engine gateway and the bridge
//! supervisor. One handler per inbound request; per-session requests are
//! handled in arrival order by the WebSocket layer, while sessions proceed
//! concurrently. Registry mutations happen under one mutex; slow engine
//! calls are issued outside it and the registry is committed only once they
//! succeed, so one slow negotiation never blocks unrelated sessions.
//!
//! Bridge start/stop decisions are always derived from the registry's live
//! eligible-video-producer count at the triggering event (produce,
//! disconnect, producer close) — never from cached or engine-side state.

use crate::protocol::{BridgeInfo, EventScope, ProducerInfo, ServerMessage, SessionEvent};
use crate::registry::{Registry, Teardown, TransportState};
use mezzo_bridge::{BridgeEvent, BridgeSupervisor, StartOutcome};
use mezzo_common::{MezzoError, MezzoResult};
use mezzo_engine::{
    Capabilities, ConsumerHandle, EngineEvent, MediaEngine, MediaKind, TransportDirection,
    TransportHandle,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

/// Reply to a session's initial `connect`.
#[derive(Debug, Clone)]
pub struct ConnectReply {
    pub session_id: Uuid,
    pub capabilities: Capabilities,
    pub existing_producers: Vec<ProducerInfo>,
    pub bridge: BridgeInfo,
}

/// Ops-surface status payload.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub has_segments: bool,
    pub manifest_exists: bool,
    pub active_producers: usize,
    pub video_producers: usize,
}

pub struct Orchestrator {
    engine: Arc<dyn MediaEngine>,
    bridge: Arc<BridgeSupervisor>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<SessionEvent>,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn MediaEngine>, bridge: Arc<BridgeSupervisor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            engine,
            bridge,
            registry: Mutex::new(Registry::new()),
            events,
        })
    }

    /// Subscribe to pushed events. Each WebSocket connection holds one
    /// receiver and filters by [`EventScope`].
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn bridge(&self) -> &Arc<BridgeSupervisor> {
        &self.bridge
    }

    fn push(&self, scope: EventScope, message: ServerMessage) {
        let _ = self.events.send(SessionEvent { scope, message });
    }

    async fn bridge_info(&self) -> BridgeInfo {
        let status = self.bridge.status().await;
        BridgeInfo {
            running: status.running,
            playlist: status.playlist,
        }
    }

    // === Request handlers ===

    /// Register a new session and report the current world to it.
    pub async fn connect(&self) -> ConnectReply {
        let session_id = Uuid::new_v4();
        let existing = {
            let mut registry = self.registry.lock().await;
            registry.register_session(session_id);
            registry.producers_snapshot()
        };
        let bridge = self.bridge_info().await;

        tracing::info!(session = %session_id, "Session connected");

        ConnectReply {
            session_id,
            capabilities: self.engine.capabilities(),
            existing_producers: existing
                .into_iter()
                .map(|(producer_id, kind)| ProducerInfo { producer_id, kind })
                .collect(),
            bridge,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.engine.capabilities()
    }

    pub async fn create_transport(
        &self,
        session_id: Uuid,
        direction: TransportDirection,
    ) -> MezzoResult<TransportHandle> {
        if !self.registry.lock().await.session_exists(session_id) {
            return Err(MezzoError::not_found("session"));
        }

        let handle = self.engine.create_transport(direction).await?;

        let mut registry = self.registry.lock().await;
        if !registry.session_exists(session_id) {
            // Session vanished while we negotiated; don't leak the transport.
            drop(registry);
            let _ = self.engine.close(handle.id).await;
            return Err(MezzoError::not_found("session"));
        }
        registry.add_transport(session_id, handle.id, direction)?;

        tracing::debug!(
            session = %session_id,
            transport = %handle.id,
            ?direction,
            "Transport registered"
        );
        Ok(handle)
    }

    pub async fn connect_transport(
        &self,
        session_id: Uuid,
        transport_id: Uuid,
        client_params: serde_json::Value,
    ) -> MezzoResult<()> {
        {
            let registry = self.registry.lock().await;
            let transport = registry
                .owned_transport(session_id, transport_id)
                .ok_or_else(|| MezzoError::not_found("transport"))?;
            if transport.state != TransportState::Created {
                return Err(MezzoError::Validation {
                    message: "transport already connected".into(),
                });
            }
        }

        self.engine
            .connect_transport(transport_id, client_params)
            .await?;

        self.registry
            .lock()
            .await
            .mark_transport_connected(transport_id)?;
        Ok(())
    }

    /// Publish a track. The producer is broadcast only after it is durably
    /// registered, so a racing consume from another session can never see an
    /// id the registry doesn't know.
    pub async fn produce(
        &self,
        session_id: Uuid,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> MezzoResult<Uuid> {
        {
            let registry = self.registry.lock().await;
            let transport = registry
                .owned_transport(session_id, transport_id)
                .ok_or_else(|| MezzoError::not_found("transport"))?;
            if transport.direction != TransportDirection::Send {
                return Err(MezzoError::Validation {
                    message: "produce requires a send transport".into(),
                });
            }
            if transport.state != TransportState::Connected {
                return Err(MezzoError::Validation {
                    message: "transport is not connected".into(),
                });
            }
        }

        // Engine negotiation can be slow; nobody else waits on it.
        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        {
            let mut registry = self.registry.lock().await;
            if !registry.session_exists(session_id) {
                drop(registry);
                let _ = self.engine.close(producer_id).await;
                return Err(MezzoError::not_found("session"));
            }
            registry.add_producer(session_id, transport_id, producer_id, kind)?;
        }

        tracing::info!(
            session = %session_id,
            producer = %producer_id,
            ?kind,
            "Producer registered"
        );

        self.push(
            EventScope::Exclude(session_id),
            ServerMessage::ProducerAvailable { producer_id, kind },
        );

        if kind == MediaKind::Video {
            self.sync_bridge_after_produce(producer_id).await;
        }

        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        session_id: Uuid,
        transport_id: Uuid,
        producer_id: Uuid,
        client_caps: Capabilities,
    ) -> MezzoResult<ConsumerHandle> {
        {
            let registry = self.registry.lock().await;
            let transport = registry
                .owned_transport(session_id, transport_id)
                .ok_or_else(|| MezzoError::not_found("transport"))?;
            if transport.direction != TransportDirection::Recv {
                return Err(MezzoError::Validation {
                    message: "consume requires a receive transport".into(),
                });
            }
            if registry.producer(producer_id).is_none() {
                // Also covers "produce still in flight" — fail fast, never queue.
                return Err(MezzoError::not_found("producer"));
            }
        }

        // Capability check first so the requester gets a clean error instead
        // of an engine-level fault.
        if !self.engine.can_consume(producer_id, &client_caps).await? {
            return Err(MezzoError::CannotConsume);
        }

        let consumer = self
            .engine
            .consume(transport_id, producer_id, &client_caps)
            .await?;

        {
            let mut registry = self.registry.lock().await;
            // Name whichever side vanished while the engine call was in flight.
            if !registry.session_exists(session_id) {
                drop(registry);
                let _ = self.engine.close(consumer.id).await;
                return Err(MezzoError::not_found("session"));
            }
            if registry.producer(producer_id).is_none() {
                drop(registry);
                let _ = self.engine.close(consumer.id).await;
                return Err(MezzoError::not_found("producer"));
            }
            registry.add_consumer(session_id, transport_id, consumer.id, producer_id)?;
        }

        tracing::info!(
            session = %session_id,
            consumer = %consumer.id,
            producer = %producer_id,
            "Consumer registered (paused)"
        );
        Ok(consumer)
    }

    pub async fn resume_consumer(&self, session_id: Uuid, consumer_id: Uuid) -> MezzoResult<()> {
        if self
            .registry
            .lock()
            .await
            .owned_consumer(session_id, consumer_id)
            .is_none()
        {
            return Err(MezzoError::not_found("consumer"));
        }
        self.engine.resume(consumer_id).await?;
        Ok(())
    }

    /// Tear down a session and everything it owns. Best-effort: individual
    /// engine close failures are logged, never fatal.
    pub async fn disconnect(&self, session_id: Uuid) {
        let Some(teardown) = self.registry.lock().await.remove_session(session_id) else {
            return;
        };

        self.release_teardown(&teardown).await;

        // Remaining sessions learn about closed producers and their own
        // orphaned consumers.
        for producer in &teardown.producers {
            self.push(
                EventScope::All,
                ServerMessage::ProducerClosed {
                    producer_id: producer.id,
                },
            );
        }
        for consumer in &teardown.orphaned_consumers {
            self.push(
                EventScope::Only(consumer.session_id),
                ServerMessage::ConsumerClosed {
                    consumer_id: consumer.id,
                },
            );
        }

        tracing::info!(
            session = %session_id,
            transports = teardown.transports.len(),
            producers = teardown.producers.len(),
            consumers = teardown.consumers.len() + teardown.orphaned_consumers.len(),
            "Session disconnected, resources released"
        );

        self.sync_bridge_after_removal().await;
    }

    /// Release a teardown's resources in the engine. Consumers first, then
    /// producers, then transports — a transport closed last has no producers
    /// left riding it, so the engine won't raise redundant close events.
    async fn release_teardown(&self, teardown: &Teardown) {
        for consumer_id in teardown
            .consumers
            .iter()
            .chain(teardown.orphaned_consumers.iter().map(|c| &c.id))
        {
            if let Err(e) = self.engine.close(*consumer_id).await {
                tracing::warn!(consumer = %consumer_id, error = %e, "Consumer close failed");
            }
        }
        for producer in &teardown.producers {
            if producer.kind == MediaKind::Video {
                self.bridge.detach_producer(producer.id).await;
            }
            if let Err(e) = self.engine.close(producer.id).await {
                tracing::warn!(producer = %producer.id, error = %e, "Producer close failed");
            }
        }
        for transport_id in &teardown.transports {
            if let Err(e) = self.engine.close(*transport_id).await {
                tracing::warn!(transport = %transport_id, error = %e, "Transport close failed");
            }
        }
    }

    // === Bridge policy ===

    /// After a new video producer: start the bridge if idle, then feed the
    /// producer in. A failed start does not fail the produce — the producer
    /// exists and is broadcast; viewers just see no playback yet.
    async fn sync_bridge_after_produce(&self, producer_id: Uuid) {
        match self.bridge.start().await {
            Ok(StartOutcome::Started) => {
                // Startup takes seconds; re-derive eligibility in case every
                // producer disconnected while we were starting.
                let eligible = self.registry.lock().await.eligible_video_producers();
                if eligible.is_empty() {
                    tracing::info!("All producers left during bridge startup, stopping");
                    self.bridge.stop().await;
                    self.push_bridge_status().await;
                    return;
                }
                for pid in eligible {
                    if let Err(e) = self.bridge.attach_producer(pid).await {
                        tracing::warn!(producer = %pid, error = %e, "Bridge attach failed");
                    }
                }
                self.push_bridge_status().await;
            }
            Ok(StartOutcome::AlreadyActive) => {
                if let Err(e) = self.bridge.attach_producer(producer_id).await {
                    tracing::warn!(producer = %producer_id, error = %e, "Bridge attach failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bridge start failed, continuing without playback");
                self.push_bridge_status().await;
            }
        }
    }

    /// After producers went away: stop the bridge when no eligible video
    /// producer remains. It must keep running while at least one does.
    async fn sync_bridge_after_removal(&self) {
        let eligible = self.registry.lock().await.eligible_video_producers();
        if !eligible.is_empty() {
            return;
        }
        let was_running = self.bridge.status().await.running;
        self.bridge.stop().await;
        if was_running {
            self.push_bridge_status().await;
        }
    }

    async fn push_bridge_status(&self) {
        let info = self.bridge_info().await;
        self.push(
            EventScope::All,
            ServerMessage::BridgeStatus {
                running: info.running,
                playlist: info.playlist,
            },
        );
    }

    // === Ops surface ===

    pub async fn stream_status(&self) -> StreamStatus {
        let (_, producers, videos) = self.registry.lock().await.counts();
        let status = self.bridge.status().await;
        let output = self.bridge.output();
        StreamStatus {
            running: status.running,
            has_segments: output.has_segments(),
            manifest_exists: output.manifest_exists(),
            active_producers: producers,
            video_producers: videos,
        }
    }

    /// Manual bridge start (ops). Attaches whatever eligible producers exist.
    pub async fn start_bridge(&self) -> MezzoResult<StreamStatus> {
        self.bridge.start().await?;
        let eligible = self.registry.lock().await.eligible_video_producers();
        for pid in eligible {
            if let Err(e) = self.bridge.attach_producer(pid).await {
                tracing::warn!(producer = %pid, error = %e, "Bridge attach failed");
            }
        }
        self.push_bridge_status().await;
        Ok(self.stream_status().await)
    }

    /// Manual bridge stop (ops).
    pub async fn stop_bridge(&self) -> StreamStatus {
        self.bridge.stop().await;
        self.push_bridge_status().await;
        self.stream_status().await
    }

    // === Event loop ===

    /// Consume engine and bridge events until one of the sources closes or
    /// the engine worker dies (fatal). Run as a dedicated task.
    pub async fn run_events(
        self: Arc<Self>,
        mut engine_rx: broadcast::Receiver<EngineEvent>,
        mut bridge_rx: mpsc::Receiver<BridgeEvent>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                event = engine_rx.recv() => match event {
                    Ok(EngineEvent::ProducerTransportClosed { transport_id, producer_ids }) => {
                        tracing::info!(
                            transport = %transport_id,
                            producers = producer_ids.len(),
                            "Engine closed a producer transport"
                        );
                        self.handle_producers_closed(producer_ids).await;
                    }
                    Ok(EngineEvent::WorkerDied { reason }) => {
                        tracing::error!(%reason, "Engine worker died, shutting down");
                        anyhow::bail!("engine worker died: {reason}");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Engine event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                event = bridge_rx.recv() => match event {
                    Some(BridgeEvent::Lost { reason }) => {
                        tracing::error!(%reason, "Bridge lost");
                        self.push_bridge_status().await;
                    }
                    Some(BridgeEvent::Degraded { diagnostics }) => {
                        self.handle_bridge_degraded(diagnostics).await;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// The same cascade as a producer's closure within disconnect, driven by
    /// an engine-originated transport close.
    pub async fn handle_producers_closed(&self, producer_ids: Vec<Uuid>) {
        for producer_id in producer_ids {
            let removed = self.registry.lock().await.remove_producer(producer_id);
            let Some((producer, dropped_consumers)) = removed else {
                continue; // already torn down elsewhere
            };

            if producer.kind == MediaKind::Video {
                self.bridge.detach_producer(producer_id).await;
            }
            let _ = self.engine.close(producer_id).await;

            for consumer in &dropped_consumers {
                if let Err(e) = self.engine.close(consumer.id).await {
                    tracing::warn!(consumer = %consumer.id, error = %e, "Consumer close failed");
                }
                self.push(
                    EventScope::Only(consumer.session_id),
                    ServerMessage::ConsumerClosed {
                        consumer_id: consumer.id,
                    },
                );
            }
            self.push(
                EventScope::All,
                ServerMessage::ProducerClosed { producer_id },
            );
        }
        self.sync_bridge_after_removal().await;
    }

    /// Degradation policy: stop the stalled pipeline; if eligible producers
    /// remain, try one immediate restart, otherwise stay down until the next
    /// produce retriggers a start.
    async fn handle_bridge_degraded(&self, diagnostics: String) {
        tracing::warn!(%diagnostics, "Bridge degraded");
        self.push(
            EventScope::All,
            ServerMessage::BridgeDegraded {
                diagnostics: diagnostics.clone(),
            },
        );

        self.bridge.stop().await;

        let eligible = self.registry.lock().await.eligible_video_producers();
        if eligible.is_empty() {
            self.push_bridge_status().await;
            return;
        }

        match self.bridge.start().await {
            Ok(_) => {
                for pid in eligible {
                    if let Err(e) = self.bridge.attach_producer(pid).await {
                        tracing::warn!(producer = %pid, error = %e, "Bridge attach failed");
                    }
                }
                tracing::info!("Bridge restarted after degradation");
            }
            Err(e) => {
                tracing::error!(error = %e, "Bridge restart after degradation failed");
            }
        }
        self.push_bridge_status().await;
    }
}
