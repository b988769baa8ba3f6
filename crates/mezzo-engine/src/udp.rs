//! In-process engine adapter backed by real UDP ports.
//!
//! Each transport owns a bound UDP socket allocated from the configured RTP
//! port range, so every connection-parameters blob carries an address a peer
//! (or the transcoder) can actually send media to. Producer/consumer identity
//! and codec matching live here; packet-level routing is the external
//! engine's concern and stays out of this crate.

use crate::types::{
    Capabilities, ConsumerHandle, MediaKind, RtpCodec, SinkHandle, TransportDirection,
    TransportHandle,
};
use crate::{EngineError, EngineEvent, MediaEngine};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// The engine gateway implementation used in production and tests.
#[derive(Debug)]
pub struct UdpEngine {
    listen_ip: IpAddr,
    announced_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    caps: Capabilities,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

#[derive(Debug, Default)]
struct EngineState {
    next_port: u16,
    transports: HashMap<Uuid, TransportEntry>,
    producers: HashMap<Uuid, ProducerEntry>,
    consumers: HashMap<Uuid, ConsumerEntry>,
}

#[derive(Debug)]
struct TransportEntry {
    direction: TransportDirection,
    /// Held to keep the port reserved for the transport's lifetime.
    _socket: Arc<UdpSocket>,
    port: u16,
    connected: bool,
}

#[derive(Debug)]
struct ProducerEntry {
    transport_id: Uuid,
    kind: MediaKind,
    codec: RtpCodec,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport_id: Uuid,
    producer_id: Uuid,
    kind: MediaKind,
    paused: bool,
}

impl UdpEngine {
    pub fn new(listen_ip: IpAddr, announced_ip: IpAddr, port_min: u16, port_max: u16) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            listen_ip,
            announced_ip,
            port_min,
            port_max,
            caps: Capabilities::supported(),
            state: Mutex::new(EngineState {
                next_port: port_min,
                ..Default::default()
            }),
            events,
        }
    }

    /// Build from application config. Fails on an unparseable IP.
    pub fn from_config(cfg: &mezzo_common::config::EngineConfig) -> Result<Self, EngineError> {
        let listen_ip: IpAddr = cfg
            .listen_ip
            .parse()
            .map_err(|_| EngineError::Rejected(format!("invalid listen_ip {}", cfg.listen_ip)))?;
        let announced_ip: IpAddr = cfg.announced_or_listen_ip().parse().map_err(|_| {
            EngineError::Rejected(format!("invalid announced_ip {}", cfg.announced_ip))
        })?;
        if cfg.rtc_min_port > cfg.rtc_max_port {
            return Err(EngineError::Rejected(format!(
                "invalid rtc port range {}-{}",
                cfg.rtc_min_port, cfg.rtc_max_port
            )));
        }
        Ok(Self::new(
            listen_ip,
            announced_ip,
            cfg.rtc_min_port,
            cfg.rtc_max_port,
        ))
    }

    /// Bind a socket on the next free port in the range. The cursor wraps so
    /// churny workloads don't pile up on the low end.
    async fn allocate_socket(&self, state: &mut EngineState) -> Result<(Arc<UdpSocket>, u16), EngineError> {
        let span = (self.port_max - self.port_min) as u32 + 1;
        for _ in 0..span {
            let port = state.next_port;
            state.next_port = if port >= self.port_max {
                self.port_min
            } else {
                port + 1
            };
            match UdpSocket::bind(SocketAddr::new(self.listen_ip, port)).await {
                Ok(socket) => return Ok((Arc::new(socket), port)),
                Err(_) => continue, // port in use, try the next one
            }
        }
        Err(EngineError::NoPortsAvailable {
            min: self.port_min,
            max: self.port_max,
        })
    }
}

#[async_trait::async_trait]
impl MediaEngine for UdpEngine {
    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportHandle, EngineError> {
        let mut state = self.state.lock().await;
        let (socket, port) = self.allocate_socket(&mut state).await?;
        let id = Uuid::new_v4();
        state.transports.insert(
            id,
            TransportEntry {
                direction,
                _socket: socket,
                port,
                connected: false,
            },
        );

        tracing::debug!(transport = %id, %port, ?direction, "Transport created");

        Ok(TransportHandle {
            id,
            params: serde_json::json!({
                "id": id,
                "ip": self.announced_ip.to_string(),
                "port": port,
                "direction": direction,
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: Uuid,
        _client_params: serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let entry = state
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::NotFound {
                kind: "transport",
                id: transport_id,
            })?;
        entry.connected = true;
        tracing::debug!(transport = %transport_id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        _rtp_parameters: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get(&transport_id)
            .ok_or(EngineError::NotFound {
                kind: "transport",
                id: transport_id,
            })?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Rejected(
                "produce requires a send transport".into(),
            ));
        }
        if !transport.connected {
            return Err(EngineError::Rejected("transport not connected".into()));
        }
        let codec = self
            .caps
            .codec_for(kind)
            .cloned()
            .ok_or_else(|| EngineError::Rejected(format!("no codec for {kind:?}")))?;

        let id = Uuid::new_v4();
        state.producers.insert(
            id,
            ProducerEntry {
                transport_id,
                kind,
                codec,
            },
        );

        tracing::debug!(producer = %id, transport = %transport_id, ?kind, "Producer created");
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: Uuid,
        client_caps: &Capabilities,
    ) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .producers
            .get(&producer_id)
            .is_some_and(|p| client_caps.includes_mime(&p.codec.mime_type)))
    }

    async fn consume(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        client_caps: &Capabilities,
    ) -> Result<ConsumerHandle, EngineError> {
        let mut state = self.state.lock().await;
        if !state.transports.contains_key(&transport_id) {
            return Err(EngineError::NotFound {
                kind: "transport",
                id: transport_id,
            });
        }
        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::NotFound {
                kind: "producer",
                id: producer_id,
            })?;
        if !client_caps.includes_mime(&producer.codec.mime_type) {
            return Err(EngineError::Rejected("cannot consume".into()));
        }

        let id = Uuid::new_v4();
        let kind = producer.kind;
        let codec = producer.codec.clone();
        state.consumers.insert(
            id,
            ConsumerEntry {
                transport_id,
                producer_id,
                kind,
                paused: true,
            },
        );

        tracing::debug!(consumer = %id, producer = %producer_id, "Consumer created (paused)");

        Ok(ConsumerHandle {
            id,
            producer_id,
            kind,
            params: serde_json::json!({
                "id": id,
                "producerId": producer_id,
                "kind": kind,
                "rtpParameters": { "codecs": [codec] },
                "paused": true,
            }),
        })
    }

    async fn resume(&self, consumer_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let entry = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::NotFound {
                kind: "consumer",
                id: consumer_id,
            })?;
        entry.paused = false;
        tracing::debug!(consumer = %consumer_id, "Consumer resumed");
        Ok(())
    }

    async fn close(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;

        if state.consumers.remove(&id).is_some() {
            tracing::debug!(consumer = %id, "Consumer closed");
            return Ok(());
        }
        if state.producers.remove(&id).is_some() {
            tracing::debug!(producer = %id, "Producer closed");
            return Ok(());
        }
        if let Some(transport) = state.transports.remove(&id) {
            // Everything riding the transport goes with it.
            let producer_ids: Vec<Uuid> = state
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == id)
                .map(|(pid, _)| *pid)
                .collect();
            for pid in &producer_ids {
                state.producers.remove(pid);
            }
            state.consumers.retain(|_, c| c.transport_id != id);

            tracing::debug!(
                transport = %id,
                port = transport.port,
                producers = producer_ids.len(),
                "Transport closed"
            );

            if !producer_ids.is_empty() {
                let _ = self.events.send(EngineEvent::ProducerTransportClosed {
                    transport_id: id,
                    producer_ids,
                });
            }
            return Ok(());
        }

        // Already gone — closing twice is a no-op, never a double-free.
        Ok(())
    }

    async fn create_plain_sink(&self) -> Result<SinkHandle, EngineError> {
        let mut state = self.state.lock().await;
        let (socket, port) = self.allocate_socket(&mut state).await?;
        let transport_id = Uuid::new_v4();
        state.transports.insert(
            transport_id,
            TransportEntry {
                direction: TransportDirection::Recv,
                _socket: socket,
                port,
                connected: true,
            },
        );

        let video = self
            .caps
            .codec_for(MediaKind::Video)
            .ok_or_else(|| EngineError::Rejected("no video codec configured".into()))?;

        tracing::info!(transport = %transport_id, %port, "Plain RTP sink created");

        Ok(SinkHandle {
            transport_id,
            rtp_port: port,
            payload_type: video.payload_type,
            clock_rate: video.clock_rate,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> UdpEngine {
        // High ephemeral-ish range to avoid colliding with other tests.
        UdpEngine::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            20500,
            20560,
        )
    }

    async fn send_transport(e: &UdpEngine) -> Uuid {
        let t = e.create_transport(TransportDirection::Send).await.unwrap();
        e.connect_transport(t.id, serde_json::json!({})).await.unwrap();
        t.id
    }

    #[tokio::test]
    async fn transports_get_distinct_ports_in_range() {
        let e = engine();
        let a = e.create_transport(TransportDirection::Send).await.unwrap();
        let b = e.create_transport(TransportDirection::Recv).await.unwrap();
        let pa = a.params["port"].as_u64().unwrap() as u16;
        let pb = b.params["port"].as_u64().unwrap() as u16;
        assert_ne!(pa, pb);
        assert!((20500..=20560).contains(&pa));
        assert!((20500..=20560).contains(&pb));
    }

    #[tokio::test]
    async fn produce_requires_connected_send_transport() {
        let e = engine();
        let recv = e.create_transport(TransportDirection::Recv).await.unwrap();
        let err = e
            .produce(recv.id, MediaKind::Video, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let send = e.create_transport(TransportDirection::Send).await.unwrap();
        // Not yet connected
        assert!(e
            .produce(send.id, MediaKind::Video, serde_json::json!({}))
            .await
            .is_err());
        e.connect_transport(send.id, serde_json::json!({})).await.unwrap();
        assert!(e
            .produce(send.id, MediaKind::Video, serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn capability_matching_gates_consume() {
        let e = engine();
        let send = send_transport(&e).await;
        let producer = e
            .produce(send, MediaKind::Video, serde_json::json!({}))
            .await
            .unwrap();

        let full = Capabilities::supported();
        assert!(e.can_consume(producer, &full).await.unwrap());

        let audio_only = Capabilities {
            codecs: full
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .cloned()
                .collect(),
        };
        assert!(!e.can_consume(producer, &audio_only).await.unwrap());

        // Unknown producer is simply not consumable.
        assert!(!e.can_consume(Uuid::new_v4(), &full).await.unwrap());

        let recv = e.create_transport(TransportDirection::Recv).await.unwrap();
        let err = e.consume(recv.id, producer, &audio_only).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[tokio::test]
    async fn consumer_starts_paused_until_resumed() {
        let e = engine();
        let send = send_transport(&e).await;
        let producer = e
            .produce(send, MediaKind::Audio, serde_json::json!({}))
            .await
            .unwrap();
        let recv = e.create_transport(TransportDirection::Recv).await.unwrap();
        let consumer = e
            .consume(recv.id, producer, &Capabilities::supported())
            .await
            .unwrap();
        assert_eq!(consumer.params["paused"], serde_json::json!(true));
        e.resume(consumer.id).await.unwrap();
        assert!(matches!(
            e.resume(Uuid::new_v4()).await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let e = engine();
        let send = send_transport(&e).await;
        let producer = e
            .produce(send, MediaKind::Video, serde_json::json!({}))
            .await
            .unwrap();
        e.close(producer).await.unwrap();
        e.close(producer).await.unwrap();
        e.close(send).await.unwrap();
        e.close(send).await.unwrap();
        e.close(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn transport_close_cascades_and_notifies() {
        let e = engine();
        let mut events = e.subscribe();
        let send = send_transport(&e).await;
        let producer = e
            .produce(send, MediaKind::Video, serde_json::json!({}))
            .await
            .unwrap();

        e.close(send).await.unwrap();

        match events.try_recv().unwrap() {
            EngineEvent::ProducerTransportClosed {
                transport_id,
                producer_ids,
            } => {
                assert_eq!(transport_id, send);
                assert_eq!(producer_ids, vec![producer]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Producer went with the transport; nothing left to consume.
        assert!(!e
            .can_consume(producer, &Capabilities::supported())
            .await
            .unwrap());
    }

    #[test]
    fn from_config_rejects_inverted_port_range() {
        let cfg = mezzo_common::config::EngineConfig {
            listen_ip: "127.0.0.1".into(),
            announced_ip: String::new(),
            rtc_min_port: 21000,
            rtc_max_port: 20000,
        };
        assert!(matches!(
            UdpEngine::from_config(&cfg).unwrap_err(),
            EngineError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn port_exhaustion_is_reported() {
        let e = UdpEngine::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            20590,
            20591,
        );
        e.create_transport(TransportDirection::Send).await.unwrap();
        e.create_transport(TransportDirection::Send).await.unwrap();
        let err = e
            .create_transport(TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPortsAvailable { .. }));
    }
}
