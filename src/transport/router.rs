//! Outbound fan-out for reply traffic.
//!
//! A device can be reachable over its WebSocket connection, its UDP
//! session (control via MQTT, audio via UDP), or both at once. The router
//! delivers every event to each live route and reports success when at
//! least one of them took it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::registry::ConnectionRegistry;
use super::udp::UdpOutbound;
use crate::core::pipeline::{DispatchError, OutboundSink, ReplyEvent};
use crate::core::session::{SessionRegistry, TransportKind};
use crate::signaling::{ControlPublisher, OutboundMessage, TtsMessage};

pub struct OutboundRouter {
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    udp: Arc<UdpOutbound>,
    publisher: Arc<dyn ControlPublisher>,
}

impl OutboundRouter {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        sessions: Arc<SessionRegistry>,
        udp: Arc<UdpOutbound>,
        publisher: Arc<dyn ControlPublisher>,
    ) -> Self {
        Self {
            connections,
            sessions,
            udp,
            publisher,
        }
    }
}

#[async_trait]
impl OutboundSink for OutboundRouter {
    async fn send_control(
        &self,
        device_id: &str,
        session_id: &str,
        event: ReplyEvent,
    ) -> Result<(), DispatchError> {
        let message = OutboundMessage::Tts(TtsMessage::from_event(session_id, event));
        let mut sent = false;
        let mut last_err: Option<DispatchError> = None;

        if let Some(handle) = self.connections.get(device_id) {
            let text = serde_json::to_string(&message)
                .map_err(|err| DispatchError::Transport(err.to_string()))?;
            match handle.send_text(text).await {
                Ok(()) => sent = true,
                Err(err) => {
                    warn!("WebSocket control delivery to {} failed: {}", device_id, err);
                    last_err = Some(err);
                }
            }
        }

        if self.sessions.has_session(device_id, TransportKind::Udp) {
            match self.publisher.publish(device_id, &message).await {
                Ok(()) => sent = true,
                Err(err) => {
                    warn!("MQTT control delivery to {} failed: {}", device_id, err);
                    last_err = Some(DispatchError::Transport(err.to_string()));
                }
            }
        }

        if sent {
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| DispatchError::NoRoute(device_id.to_owned())))
    }

    async fn send_audio(&self, device_id: &str, frame: Bytes) -> Result<(), DispatchError> {
        let mut sent = false;
        let mut last_err: Option<DispatchError> = None;

        if let Some(handle) = self.connections.get(device_id) {
            match handle.send_audio(frame.clone()).await {
                Ok(()) => sent = true,
                Err(err) => {
                    warn!("WebSocket audio delivery to {} failed: {}", device_id, err);
                    last_err = Some(err);
                }
            }
        }

        if self.sessions.has_session(device_id, TransportKind::Udp) {
            match self.udp.send_audio(device_id, &frame).await {
                Ok(()) => sent = true,
                Err(err) => {
                    warn!("UDP audio delivery to {} failed: {}", device_id, err);
                    last_err = Some(err);
                }
            }
        }

        if sent {
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| DispatchError::NoRoute(device_id.to_owned())))
    }
}
