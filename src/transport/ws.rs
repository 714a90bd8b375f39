//! Device WebSocket transport.
//!
//! One socket per device carries both control JSON (text frames) and raw
//! Opus audio (binary frames). The HTTP upgrade is always accepted so a
//! handshake failure can be reported with an application close code; the
//! checks run in order and map to codes 4001 through 4005.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::{ConnectionHandle, ConnectionRegistry, WsOutbound};
use crate::config::GatewayConfig;
use crate::core::audio::{CHANNELS, SAMPLE_RATE};
use crate::core::session::Session;
use crate::signaling::{
    AudioParams, ControlMessage, ControlPublisher, HelloAck, OutboundMessage, SignalingError,
};
use crate::state::AppState;

/// Close codes reported to devices for handshake failures.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_BAD_PROTOCOL_VERSION: u16 = 4002;
pub const CLOSE_MISSING_DEVICE_ID: u16 = 4003;
pub const CLOSE_INVALID_HELLO: u16 = 4004;
pub const CLOSE_WRONG_TRANSPORT: u16 = 4005;

const CHANNEL_BUFFER_SIZE: usize = 1024;
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long a device gets to send its hello after the upgrade.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct HandshakeReject {
    code: u16,
    reason: &'static str,
}

/// WebSocket upgrade endpoint for devices.
///
/// Header validation happens before the upgrade, but the verdict is
/// delivered after it as a close frame so devices can tell apart the
/// failure modes.
pub async fn ws_device_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let verdict = authorize(&state.config, &headers);
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_device_socket(socket, state, verdict))
}

/// Run the handshake checks in close-code order and return the device id.
fn authorize(config: &GatewayConfig, headers: &HeaderMap) -> Result<String, HandshakeReject> {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == config.access_token.expose());
    if !authorized {
        return Err(HandshakeReject {
            code: CLOSE_UNAUTHORIZED,
            reason: "invalid access token",
        });
    }

    let version_ok = headers
        .get("Protocol-Version")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok())
        .is_some_and(|version| version == config.protocol_version);
    if !version_ok {
        return Err(HandshakeReject {
            code: CLOSE_BAD_PROTOCOL_VERSION,
            reason: "unsupported protocol version",
        });
    }

    headers
        .get("Device-Id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .ok_or(HandshakeReject {
            code: CLOSE_MISSING_DEVICE_ID,
            reason: "missing device id",
        })
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn handle_device_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    verdict: Result<String, HandshakeReject>,
) {
    let (mut sender, mut receiver) = socket.split();

    let device_id = match verdict {
        Ok(device_id) => device_id,
        Err(reject) => {
            warn!(
                "Rejecting WebSocket connection: {} ({})",
                reject.reason, reject.code
            );
            let _ = sender.send(close_frame(reject.code, reject.reason)).await;
            return;
        }
    };

    if let Err(reject) = read_hello(&mut receiver).await {
        warn!(
            "Rejecting WebSocket connection from {}: {}",
            device_id, reject.reason
        );
        let _ = sender.send(close_frame(reject.code, reject.reason)).await;
        return;
    }

    let session = Session::new_websocket(device_id.clone());
    let session_id = session.session_id.clone();
    if let Some(old) = state.sessions.insert(session) {
        info!(
            "Superseding session {} for {} with a fresh connection",
            old.session_id, device_id
        );
    }

    // Writer task: the only place that touches the socket sink. Everything
    // else queues frames through the connection handle.
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let writer = tokio::spawn(write_frames(sender, outbound_rx));

    let handle = ConnectionHandle::new(device_id.clone(), session_id.clone(), outbound_tx);
    if let Some(old) = state.connections.insert(handle.clone()) {
        old.close().await;
    }

    if let Err(err) = send_server_hello(&handle, &state, &session_id).await {
        warn!("Failed to send server hello to {}: {}", device_id, err);
    } else {
        info!(
            "Session {} established for {} over websocket",
            session_id, device_id
        );
        let publisher = WsControlPublisher::new(Arc::clone(&state.connections));
        serve_connection(&state, &device_id, &session_id, &mut receiver, &publisher).await;
    }

    // Teardown in registration order. The handle is closed after the
    // registry entry is gone so queued acks still drain before the close
    // frame, then the writer exits on its own.
    state.connections.remove(&device_id, &session_id);
    state.sessions.remove(&session_id);
    if state.sessions.device_session_count(&device_id) == 0 {
        state.pipeline.abandon(&device_id);
    }
    handle.close().await;
    drop(handle);
    let _ = writer.await;
    info!("WebSocket connection for {} terminated", device_id);
}

/// First application message must be a hello declaring the websocket
/// transport, within the handshake timeout.
async fn read_hello(receiver: &mut SplitStream<WebSocket>) -> Result<(), HandshakeReject> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, receiver.next())
        .await
        .map_err(|_| HandshakeReject {
            code: CLOSE_INVALID_HELLO,
            reason: "hello timeout",
        })?;

    let Some(Ok(Message::Text(text))) = frame else {
        return Err(HandshakeReject {
            code: CLOSE_INVALID_HELLO,
            reason: "first message must be a hello",
        });
    };
    let Ok(ControlMessage::Hello(hello)) = serde_json::from_str::<ControlMessage>(&text) else {
        return Err(HandshakeReject {
            code: CLOSE_INVALID_HELLO,
            reason: "first message must be a hello",
        });
    };
    if hello.transport.as_deref() != Some("websocket") {
        return Err(HandshakeReject {
            code: CLOSE_WRONG_TRANSPORT,
            reason: "transport must be websocket",
        });
    }
    Ok(())
}

async fn send_server_hello(
    handle: &ConnectionHandle,
    state: &Arc<AppState>,
    session_id: &str,
) -> Result<(), SignalingError> {
    let ack = OutboundMessage::Hello(HelloAck {
        session_id: session_id.to_owned(),
        transport: "websocket".to_owned(),
        version: state.config.protocol_version,
        audio_params: AudioParams {
            format: "opus".to_owned(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: None,
        },
        udp: None,
    });
    let text = serde_json::to_string(&ack)?;
    handle
        .send_text(text)
        .await
        .map_err(|_| SignalingError::NoRoute(handle.device_id.clone()))
}

async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<WsOutbound>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let result = match frame {
            WsOutbound::Text(text) => sender.send(Message::Text(text.into())).await,
            WsOutbound::Binary(data) => sender.send(Message::Binary(data)).await,
            WsOutbound::Close => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        };
        if let Err(err) = result {
            debug!("WebSocket send failed: {}", err);
            break;
        }
    }
}

/// Read loop for an established connection: text frames are control
/// messages, binary frames are Opus audio for the ingest pipeline.
async fn serve_connection(
    state: &Arc<AppState>,
    device_id: &str,
    session_id: &str,
    receiver: &mut SplitStream<WebSocket>,
    publisher: &WsControlPublisher,
) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.sessions.with_session(session_id, |s| s.touch());
                let message: ControlMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Unparseable control message from {}: {}", device_id, err);
                        continue;
                    }
                };
                if matches!(message, ControlMessage::Hello(_)) {
                    warn!("Ignoring repeated hello from {}", device_id);
                    continue;
                }
                let is_goodbye = matches!(message, ControlMessage::Goodbye(_));
                if let Err(err) = state
                    .control
                    .handle_message(device_id, message, publisher)
                    .await
                {
                    warn!("Control handling failed for {}: {}", device_id, err);
                }
                if is_goodbye {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                state.sessions.with_session(session_id, |s| s.touch());
                state.pipeline.ingest(device_id, &data);
            }
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by {}", device_id);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("WebSocket receive error from {}: {}", device_id, err);
                break;
            }
        }
    }
}

/// Publishes control acknowledgements back over the device's socket.
pub struct WsControlPublisher {
    connections: Arc<ConnectionRegistry>,
}

impl WsControlPublisher {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ControlPublisher for WsControlPublisher {
    async fn publish(
        &self,
        device_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SignalingError> {
        let Some(handle) = self.connections.get(device_id) else {
            return Err(SignalingError::NoRoute(device_id.to_owned()));
        };
        let text = serde_json::to_string(message)?;
        handle
            .send_text(text)
            .await
            .map_err(|_| SignalingError::NoRoute(device_id.to_owned()))
    }
}
