//! Bridge process supervisor.
//!
//! Owns the single transcoding pipeline that turns the engine's RTP sink into
//! a segmented HLS stream:
//!
//! ```text
//!   producers ──engine──▶ plain RTP sink ──ffmpeg──▶ playlist.m3u8 + segments
//! ```
//!
//! State machine: `Idle → Starting → Running → Stopping → Idle`, plus
//! `Running → Degraded → Running|Idle`. Only one pipeline may exist at a
//! time; `start` while one is active is a no-op reporting "already active".
//!
//! Readiness is the pipeline's first manifest write, bounded by a grace
//! period — not a blind fixed delay. The supervisor never restarts the
//! pipeline on its own: on loss it forces `Idle` and reports a
//! [`BridgeEvent::Lost`], leaving the restart decision to the orchestrator.

use crate::output::{HlsOutput, OutputSnapshot, PLAYLIST_URL};
use mezzo_common::config::BridgeConfig;
use mezzo_common::{MezzoError, MezzoResult};
use mezzo_engine::{MediaEngine, SinkHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Lifecycle of the transcoding pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
}

/// Supervisor-originated events consumed by the orchestrator's event loop.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The pipeline died or its output froze past recovery; the supervisor is
    /// back in `Idle`. Restart policy belongs to the caller.
    Lost { reason: String },
    /// The output stopped advancing for the configured number of consecutive
    /// health checks. The pipeline is still up; the caller decides whether to
    /// stop it.
    Degraded { diagnostics: String },
}

/// Result of a `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A pipeline was already starting or running; nothing was done.
    AlreadyActive,
}

/// Snapshot of the bridge for status broadcasts and the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub state: BridgeState,
    /// Viewer-facing playlist path while the pipeline is up.
    pub playlist: Option<String>,
    pub attached_producers: usize,
}

struct Inner {
    state: BridgeState,
    sink: Option<SinkHandle>,
    child: Option<Child>,
    /// producer id → sink-side consumer id
    attached: HashMap<Uuid, Uuid>,
    /// Bumped on every start/stop so stale watcher tasks disarm themselves.
    generation: u64,
    last_snapshot: Option<OutputSnapshot>,
    stalled_checks: u32,
}

pub struct BridgeSupervisor {
    engine: Arc<dyn MediaEngine>,
    cfg: BridgeConfig,
    output: HlsOutput,
    stall_threshold: u32,
    events: mpsc::Sender<BridgeEvent>,
    inner: Mutex<Inner>,
}

impl BridgeSupervisor {
    /// Returns the supervisor and the event stream the orchestrator consumes.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        cfg: BridgeConfig,
        stall_threshold: u32,
    ) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        let output = HlsOutput::new(&cfg.output_dir);
        let supervisor = Arc::new(Self {
            engine,
            cfg,
            output,
            stall_threshold,
            events,
            inner: Mutex::new(Inner {
                state: BridgeState::Idle,
                sink: None,
                child: None,
                attached: HashMap::new(),
                generation: 0,
                last_snapshot: None,
                stalled_checks: 0,
            }),
        });
        (supervisor, events_rx)
    }

    pub fn output(&self) -> &HlsOutput {
        &self.output
    }

    pub async fn status(&self) -> BridgeStatus {
        let inner = self.inner.lock().await;
        let running = matches!(inner.state, BridgeState::Running | BridgeState::Degraded);
        BridgeStatus {
            running,
            state: inner.state,
            playlist: running.then(|| PLAYLIST_URL.to_string()),
            attached_producers: inner.attached.len(),
        }
    }

    /// Start the pipeline. Valid from `Idle`; a no-op while one is active.
    ///
    /// Allocates the engine's RTP sink, launches the transcoder pointed at
    /// it, and waits up to the grace period for the first manifest write. On
    /// timeout or early process exit everything is released and the state
    /// returns to `Idle`.
    pub async fn start(self: &Arc<Self>) -> MezzoResult<StartOutcome> {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.state != BridgeState::Idle {
                return Ok(StartOutcome::AlreadyActive);
            }
            inner.state = BridgeState::Starting;
            inner.generation += 1;
            inner.generation
        };

        match self.try_start().await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                if inner.state != BridgeState::Starting || inner.generation != generation {
                    // stop() won the race during startup
                    return Err(MezzoError::BridgeUnavailable {
                        reason: "stopped during startup".into(),
                    });
                }
                inner.state = BridgeState::Running;
                inner.last_snapshot = Some(self.output.snapshot());
                inner.stalled_checks = 0;
                drop(inner);

                self.spawn_exit_watcher(generation);
                tracing::info!("Bridge pipeline running");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bridge start failed");
                let mut inner = self.inner.lock().await;
                self.teardown_locked(&mut inner).await;
                Err(e)
            }
        }
    }

    async fn try_start(self: &Arc<Self>) -> MezzoResult<()> {
        self.output.ensure_dir().map_err(|e| MezzoError::BridgeUnavailable {
            reason: format!("output dir: {e}"),
        })?;
        self.output.clean().map_err(|e| MezzoError::BridgeUnavailable {
            reason: format!("output cleanup: {e}"),
        })?;

        let sink = self.engine.create_plain_sink().await.map_err(|e| {
            MezzoError::BridgeUnavailable {
                reason: format!("sink transport: {e}"),
            }
        })?;
        // Record the sink before anything else can fail, so the error path's
        // teardown releases it and its port.
        {
            let mut inner = self.inner.lock().await;
            inner.sink = Some(sink.clone());
        }

        self.write_sdp(&sink)
            .map_err(|e| MezzoError::BridgeUnavailable {
                reason: format!("sdp descriptor: {e}"),
            })?;

        let child = self
            .spawn_pipeline()
            .map_err(|e| MezzoError::BridgeUnavailable {
                reason: format!("spawn {}: {e}", self.cfg.ffmpeg_bin),
            })?;

        tracing::info!(
            port = sink.rtp_port,
            bin = %self.cfg.ffmpeg_bin,
            out = %self.output.dir().display(),
            "Bridge pipeline launched"
        );

        {
            let mut inner = self.inner.lock().await;
            inner.child = Some(child);
        }

        self.wait_ready().await
    }

    /// SDP descriptor for the sink port, read by the transcoder.
    fn write_sdp(&self, sink: &SinkHandle) -> std::io::Result<()> {
        let sdp = format!(
            "v=0\r\n\
             o=- 0 0 IN IP4 127.0.0.1\r\n\
             s=Mezzo Bridge\r\n\
             c=IN IP4 127.0.0.1\r\n\
             t=0 0\r\n\
             m=video {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} VP8/{clock}\r\n\
             a=recvonly\r\n",
            port = sink.rtp_port,
            pt = sink.payload_type,
            clock = sink.clock_rate,
        );
        std::fs::write(self.output.sdp_path(), sdp)
    }

    fn spawn_pipeline(&self) -> std::io::Result<Child> {
        let segment = self.cfg.segment_secs.to_string();
        let playlist_len = self.cfg.playlist_len.to_string();
        let segment_pattern = self.output.dir().join("segment_%03d.ts");

        let mut cmd = Command::new(&self.cfg.ffmpeg_bin);
        cmd.arg("-protocol_whitelist")
            .arg("file,udp,rtp")
            .arg("-fflags")
            .arg("+genpts")
            .arg("-i")
            .arg(self.output.sdp_path())
            .args(["-c:v", "libx264"])
            .args(["-preset", "ultrafast", "-tune", "zerolatency"])
            .args(["-g", "30", "-sc_threshold", "0"])
            .args(["-b:v", "1000k", "-maxrate", "1000k", "-bufsize", "2000k"])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-f", "hls"])
            .args(["-hls_time", &segment])
            .args(["-hls_list_size", &playlist_len])
            .args(["-hls_flags", "delete_segments+append_list"])
            .arg("-hls_segment_filename")
            .arg(segment_pattern)
            .arg(self.output.manifest_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Wait for the first manifest write, bounded by the grace period.
    async fn wait_ready(&self) -> MezzoResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.cfg.start_grace_secs);
        loop {
            if self.output.manifest_exists() {
                return Ok(());
            }
            // A pipeline that died before its first write will never be ready.
            {
                let mut inner = self.inner.lock().await;
                if inner.state != BridgeState::Starting {
                    return Err(MezzoError::BridgeUnavailable {
                        reason: "stopped during startup".into(),
                    });
                }
                if let Some(child) = inner.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(MezzoError::BridgeUnavailable {
                            reason: format!("pipeline exited during startup: {status}"),
                        });
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MezzoError::BridgeUnavailable {
                    reason: format!("no output within {}s", self.cfg.start_grace_secs),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Feed a producer into the pipeline: consume it on the sink transport
    /// and resume. Idempotent per producer id; valid while starting or
    /// running.
    pub async fn attach_producer(&self, producer_id: Uuid) -> MezzoResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BridgeState::Starting | BridgeState::Running | BridgeState::Degraded => {}
            _ => {
                return Err(MezzoError::BridgeUnavailable {
                    reason: "bridge is not active".into(),
                })
            }
        }
        if inner.attached.contains_key(&producer_id) {
            return Ok(());
        }
        let sink = inner.sink.as_ref().ok_or(MezzoError::BridgeUnavailable {
            reason: "no sink transport".into(),
        })?;
        let sink_transport = sink.transport_id;

        let consumer = self
            .engine
            .consume(sink_transport, producer_id, &self.engine.capabilities())
            .await?;
        self.engine.resume(consumer.id).await?;
        inner.attached.insert(producer_id, consumer.id);

        tracing::info!(
            producer = %producer_id,
            consumer = %consumer.id,
            "Producer attached to bridge"
        );
        Ok(())
    }

    /// Drop a producer's sink-side consumer. No-op for unknown producers.
    pub async fn detach_producer(&self, producer_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(consumer_id) = inner.attached.remove(&producer_id) {
            if let Err(e) = self.engine.close(consumer_id).await {
                tracing::warn!(consumer = %consumer_id, error = %e, "Sink consumer close failed");
            }
            tracing::info!(producer = %producer_id, "Producer detached from bridge");
        }
    }

    /// Stop the pipeline from any state. Graceful quit escalating to a
    /// forced kill, sink + consumers released, artifacts deleted. Always
    /// ends in `Idle`, even if the process was already dead.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BridgeState::Idle {
            return;
        }
        inner.state = BridgeState::Stopping;
        self.teardown_locked(&mut inner).await;
        tracing::info!("Bridge pipeline stopped");
    }

    /// Release everything and land in `Idle`. Caller holds the lock.
    async fn teardown_locked(&self, inner: &mut Inner) {
        inner.generation += 1;

        if let Some(mut child) = inner.child.take() {
            // ffmpeg quits cleanly on 'q'; escalate if it ignores us.
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(b"q\n").await;
                let _ = stdin.shutdown().await;
            }
            let grace = Duration::from_secs(self.cfg.stop_grace_secs);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(%status, "Pipeline exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Pipeline wait failed");
                }
                Err(_) => {
                    tracing::warn!("Pipeline ignored quit, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        for (producer_id, consumer_id) in inner.attached.drain() {
            if let Err(e) = self.engine.close(consumer_id).await {
                tracing::warn!(
                    producer = %producer_id,
                    consumer = %consumer_id,
                    error = %e,
                    "Sink consumer close failed"
                );
            }
        }
        if let Some(sink) = inner.sink.take() {
            if let Err(e) = self.engine.close(sink.transport_id).await {
                tracing::warn!(transport = %sink.transport_id, error = %e, "Sink close failed");
            }
        }
        if let Err(e) = self.output.clean() {
            tracing::warn!(error = %e, "Output cleanup failed");
        }

        inner.last_snapshot = None;
        inner.stalled_checks = 0;
        inner.state = BridgeState::Idle;
    }

    /// Watches for the pipeline dying on its own. A self-exit is handled
    /// like a failed health check: force `Idle`, report `Lost`, no restart.
    fn spawn_exit_watcher(self: &Arc<Self>, generation: u64) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut inner = supervisor.inner.lock().await;
                if inner.generation != generation {
                    return; // superseded by a stop or a newer pipeline
                }
                let Some(child) = inner.child.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let reason = format!("pipeline exited: {status}");
                        tracing::error!(%status, "Bridge pipeline died");
                        supervisor.teardown_locked(&mut inner).await;
                        drop(inner);
                        let _ = supervisor.events.send(BridgeEvent::Lost { reason }).await;
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Pipeline status poll failed");
                        return;
                    }
                }
            }
        });
    }

    /// One health check: is the output still advancing? Only meaningful
    /// while running; invoked by the health monitor on its fixed interval.
    pub async fn health_tick(&self) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, BridgeState::Running | BridgeState::Degraded) {
            return;
        }

        let snapshot = self.output.snapshot();
        let advancing = snapshot.manifest_exists && inner.last_snapshot.as_ref() != Some(&snapshot);
        inner.last_snapshot = Some(snapshot.clone());

        if advancing {
            inner.stalled_checks = 0;
            if inner.state == BridgeState::Degraded {
                inner.state = BridgeState::Running;
                tracing::info!("Bridge output advancing again, degradation cleared");
            }
            return;
        }

        inner.stalled_checks += 1;
        tracing::warn!(
            stalled = inner.stalled_checks,
            threshold = self.stall_threshold,
            manifest = snapshot.manifest_exists,
            segments = snapshot.segment_count,
            "Bridge output not advancing"
        );

        if inner.stalled_checks >= self.stall_threshold && inner.state == BridgeState::Running {
            inner.state = BridgeState::Degraded;
            let diagnostics = format!(
                "output stalled for {} consecutive checks (manifest: {}, segments: {})",
                inner.stalled_checks, snapshot.manifest_exists, snapshot.segment_count
            );
            drop(inner);
            let _ = self.events.send(BridgeEvent::Degraded { diagnostics }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mezzo_engine::{MediaKind, TransportDirection, UdpEngine};

    fn test_engine(min: u16, max: u16) -> Arc<UdpEngine> {
        Arc::new(UdpEngine::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            min,
            max,
        ))
    }

    /// A stand-in pipeline: a shell script that touches its output manifest
    /// (ffmpeg's last argument) and then idles like a live encoder.
    #[cfg(unix)]
    fn fake_pipeline(behavior: &str) -> (String, String) {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("mezzo-bridge-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("pipeline.sh");
        let body = match behavior {
            "ready" => "#!/bin/sh\nfor a; do last=$a; done\ntouch \"$last\"\nexec sleep 600\n",
            "silent" => "#!/bin/sh\nexec sleep 600\n",
            "crash" => "#!/bin/sh\nexit 1\n",
            other => panic!("unknown behavior {other}"),
        };
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (
            script.to_string_lossy().into_owned(),
            dir.join("out").to_string_lossy().into_owned(),
        )
    }

    #[cfg(unix)]
    fn test_supervisor(
        behavior: &str,
        min: u16,
        max: u16,
    ) -> (Arc<BridgeSupervisor>, mpsc::Receiver<BridgeEvent>, Arc<UdpEngine>) {
        let (bin, out) = fake_pipeline(behavior);
        let engine = test_engine(min, max);
        let cfg = BridgeConfig {
            output_dir: out,
            ffmpeg_bin: bin,
            segment_secs: 2,
            playlist_len: 5,
            start_grace_secs: 3,
            stop_grace_secs: 1,
        };
        let (supervisor, rx) = BridgeSupervisor::new(engine.clone(), cfg, 2);
        (supervisor, rx, engine)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_reaches_running_and_is_then_a_noop() {
        let (sup, _rx, _engine) = test_supervisor("ready", 21000, 21010);
        assert_eq!(sup.start().await.unwrap(), StartOutcome::Started);
        assert_eq!(sup.status().await.state, BridgeState::Running);
        assert!(sup.status().await.running);
        // Second start does not spawn a second pipeline.
        assert_eq!(sup.start().await.unwrap(), StartOutcome::AlreadyActive);
        sup.stop().await;
        assert_eq!(sup.status().await.state, BridgeState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_times_out_when_pipeline_never_writes() {
        let (sup, _rx, _engine) = test_supervisor("silent", 21020, 21030);
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, MezzoError::BridgeUnavailable { .. }));
        assert_eq!(sup.status().await.state, BridgeState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_fails_fast_when_pipeline_crashes() {
        let (sup, _rx, _engine) = test_supervisor("crash", 21040, 21050);
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, MezzoError::BridgeUnavailable { .. }));
        assert_eq!(sup.status().await.state, BridgeState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attach_is_idempotent_and_detach_releases() {
        let (sup, _rx, engine) = test_supervisor("ready", 21060, 21075);
        sup.start().await.unwrap();

        let transport = engine
            .create_transport(TransportDirection::Send)
            .await
            .unwrap();
        engine
            .connect_transport(transport.id, serde_json::json!({}))
            .await
            .unwrap();
        let producer = engine
            .produce(transport.id, MediaKind::Video, serde_json::json!({}))
            .await
            .unwrap();

        sup.attach_producer(producer).await.unwrap();
        sup.attach_producer(producer).await.unwrap();
        assert_eq!(sup.status().await.attached_producers, 1);

        sup.detach_producer(producer).await;
        assert_eq!(sup.status().await.attached_producers, 0);
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_idempotent_and_cleans_output() {
        let (sup, _rx, _engine) = test_supervisor("ready", 21080, 21090);
        sup.start().await.unwrap();
        assert!(sup.output().manifest_exists());
        sup.stop().await;
        assert!(!sup.output().manifest_exists());
        assert_eq!(sup.status().await.state, BridgeState::Idle);
        // Stopping an idle bridge is a no-op.
        sup.stop().await;
        assert_eq!(sup.status().await.state, BridgeState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attach_outside_active_states_is_rejected() {
        let (sup, _rx, _engine) = test_supervisor("ready", 21091, 21099);
        let err = sup.attach_producer(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MezzoError::BridgeUnavailable { .. }));
    }

    #[tokio::test]
    async fn failed_start_releases_the_sink_port() {
        // Two-port engine so a leaked sink shows up immediately.
        let engine = test_engine(21120, 21121);
        let dir = std::env::temp_dir().join(format!("mezzo-bridge-{}", Uuid::new_v4()));
        let cfg = BridgeConfig {
            output_dir: dir.to_string_lossy().into_owned(),
            ffmpeg_bin: dir.join("no-such-transcoder").to_string_lossy().into_owned(),
            segment_secs: 2,
            playlist_len: 5,
            start_grace_secs: 3,
            stop_grace_secs: 1,
        };
        let (sup, _rx) = BridgeSupervisor::new(engine.clone(), cfg, 2);

        // Spawn fails before the pipeline exists; the sink allocated for it
        // must be released every time.
        assert!(sup.start().await.is_err());
        assert!(sup.start().await.is_err());
        assert_eq!(sup.status().await.state, BridgeState::Idle);

        // Both ports of the range are free again for session transports.
        engine.create_transport(TransportDirection::Send).await.unwrap();
        engine.create_transport(TransportDirection::Recv).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stall_past_threshold_reports_degraded() {
        let (sup, mut rx, _engine) = test_supervisor("ready", 21100, 21110);
        sup.start().await.unwrap();

        // The fake pipeline never rewrites the manifest, so every tick after
        // the first sees a frozen snapshot.
        sup.health_tick().await;
        sup.health_tick().await;
        sup.health_tick().await;

        assert_eq!(sup.status().await.state, BridgeState::Degraded);
        match rx.try_recv().unwrap() {
            BridgeEvent::Degraded { diagnostics } => {
                assert!(diagnostics.contains("stalled"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        sup.stop().await;
    }
}
