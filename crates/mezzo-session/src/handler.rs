//! Signaling WebSocket handler.
//!
//! One socket per session. The flow:
//!
//! 1. Client connects to /ws and sends "connect"
//! 2. Server registers the session and replies with its id, the engine's
//!    capabilities, the existing producers and the bridge status
//! 3. Client negotiates transports, then produces and/or consumes
//! 4. Server pushes producer/bridge lifecycle events as the world changes
//! 5. Socket close (or error) tears the session and everything it owns down
//!
//! Requests on one socket are handled strictly in arrival order; a rejected
//! request yields an "error" message and the socket stays up.

use crate::orchestrator::Orchestrator;
use crate::protocol::{ClientRequest, ServerMessage, SessionEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use mezzo_common::{MezzoError, MezzoResult};
use std::sync::Arc;
use uuid::Uuid;

/// Build the signaling router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(orchestrator)
}

async fn ws_handler(ws: WebSocketUpgrade, State(orch): State<Arc<Orchestrator>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, orch))
}

/// Handle one signaling connection for its whole lifetime.
async fn handle_connection(socket: WebSocket, orch: Arc<Orchestrator>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before registering so no event between the two is missed.
    let mut events = orch.subscribe();
    let mut session_id: Option<Uuid> = None;

    tracing::debug!("Signaling socket opened");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let request = match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(r) => r,
                            Err(e) => {
                                send(&mut sender, &ServerMessage::Error {
                                    code: "bad_request".into(),
                                    message: format!("Invalid message: {e}"),
                                })
                                .await;
                                continue;
                            }
                        };
                        let reply = dispatch(&orch, &mut session_id, request).await;
                        let message = reply.unwrap_or_else(|e| ServerMessage::Error {
                            code: e.error_code().to_string(),
                            message: e.to_string(),
                        });
                        send(&mut sender, &message).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent { scope, message }) => {
                        // Events are only for registered sessions in scope.
                        let Some(sid) = session_id else { continue };
                        if scope.matches(sid) {
                            send(&mut sender, &message).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let Some(sid) = session_id {
        orch.disconnect(sid).await;
    }
    tracing::debug!("Signaling socket closed");
}

/// Map one request to one reply. Errors become "error" messages upstream.
async fn dispatch(
    orch: &Orchestrator,
    session_id: &mut Option<Uuid>,
    request: ClientRequest,
) -> MezzoResult<ServerMessage> {
    // Everything except the handshake itself requires a registered session.
    let require_session = |session_id: &Option<Uuid>| -> MezzoResult<Uuid> {
        session_id.ok_or_else(|| MezzoError::Validation {
            message: "connect first".into(),
        })
    };

    match request {
        ClientRequest::Connect => {
            if session_id.is_some() {
                return Err(MezzoError::Validation {
                    message: "already connected".into(),
                });
            }
            let reply = orch.connect().await;
            *session_id = Some(reply.session_id);
            Ok(ServerMessage::Connected {
                session_id: reply.session_id,
                capabilities: reply.capabilities,
                existing_producers: reply.existing_producers,
                bridge: reply.bridge,
            })
        }

        ClientRequest::GetCapabilities => {
            require_session(session_id)?;
            Ok(ServerMessage::Capabilities {
                capabilities: orch.capabilities(),
            })
        }

        ClientRequest::CreateTransport { direction } => {
            let sid = require_session(session_id)?;
            let handle = orch.create_transport(sid, direction).await?;
            Ok(ServerMessage::TransportCreated {
                transport_id: handle.id,
                params: handle.params,
            })
        }

        ClientRequest::ConnectTransport {
            transport_id,
            client_params,
        } => {
            let sid = require_session(session_id)?;
            orch.connect_transport(sid, transport_id, client_params)
                .await?;
            Ok(ServerMessage::TransportConnected { transport_id })
        }

        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let sid = require_session(session_id)?;
            let producer_id = orch.produce(sid, transport_id, kind, rtp_parameters).await?;
            Ok(ServerMessage::Produced { producer_id })
        }

        ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let sid = require_session(session_id)?;
            let consumer = orch
                .consume(sid, transport_id, producer_id, rtp_capabilities)
                .await?;
            Ok(ServerMessage::Consumed {
                consumer_id: consumer.id,
                producer_id: consumer.producer_id,
                kind: consumer.kind,
                params: consumer.params,
            })
        }

        ClientRequest::ResumeConsumer { consumer_id } => {
            let sid = require_session(session_id)?;
            orch.resume_consumer(sid, consumer_id).await?;
            Ok(ServerMessage::ConsumerResumed { consumer_id })
        }
    }
}

async fn send(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) {
    if let Ok(json) = serde_json::to_string(message) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
}
