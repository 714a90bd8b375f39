//! Control message dispatch
//!
//! One handler serves both signaling transports: the broker loop and the
//! WebSocket text channel call [`SignalingHandler::handle_payload`] with a
//! publisher for whichever channel the device is on. Validation failures
//! are warnings that drop the message; only infrastructure failures (a
//! publish that cannot leave the process) surface as errors.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::channel::SignalingError;
use super::messages::{
    AbortRequest, AudioParams, ControlMessage, GoodbyeAck, GoodbyeRequest, HelloAck, HelloRequest,
    IotRequest, ListenRequest, ListenState, OutboundMessage, UdpEndpoint,
};
use crate::config::GatewayConfig;
use crate::core::audio::{CHANNELS, FRAME_DURATION_MS, SAMPLE_RATE};
use crate::core::crypto::ENCRYPTION_SCHEME;
use crate::core::pipeline::{AudioIngestPipeline, ReplyDispatcher};
use crate::core::session::{Session, SessionCrypto, SessionRegistry};

/// Sends outbound control messages to a device on some channel.
#[async_trait]
pub trait ControlPublisher: Send + Sync {
    async fn publish(
        &self,
        device_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SignalingError>;
}

/// Stateless-per-message control dispatcher. Shared state lives in the
/// registry and pipeline it was built with.
pub struct SignalingHandler {
    config: Arc<GatewayConfig>,
    sessions: Arc<SessionRegistry>,
    pipeline: Arc<AudioIngestPipeline>,
    dispatcher: Arc<ReplyDispatcher>,
}

impl SignalingHandler {
    pub fn new(
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionRegistry>,
        pipeline: Arc<AudioIngestPipeline>,
        dispatcher: Arc<ReplyDispatcher>,
    ) -> Self {
        Self {
            config,
            sessions,
            pipeline,
            dispatcher,
        }
    }

    /// Parse and handle one raw control payload from a device.
    pub async fn handle_payload(
        &self,
        device_id: &str,
        payload: &[u8],
        publisher: &dyn ControlPublisher,
    ) -> Result<(), SignalingError> {
        let message: ControlMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("Unparseable control message from {}: {}", device_id, err);
                return Ok(());
            }
        };
        self.handle_message(device_id, message, publisher).await
    }

    pub async fn handle_message(
        &self,
        device_id: &str,
        message: ControlMessage,
        publisher: &dyn ControlPublisher,
    ) -> Result<(), SignalingError> {
        match message {
            ControlMessage::Hello(hello) => self.handle_hello(device_id, hello, publisher).await,
            ControlMessage::Goodbye(goodbye) => {
                self.handle_goodbye(device_id, goodbye, publisher).await
            }
            ControlMessage::Listen(listen) => {
                self.handle_listen(device_id, listen);
                Ok(())
            }
            ControlMessage::Abort(abort) => {
                self.handle_abort(device_id, abort);
                Ok(())
            }
            ControlMessage::Iot(iot) => {
                self.handle_iot(device_id, iot);
                Ok(())
            }
        }
    }

    /// Validate a hello and establish a UDP session.
    ///
    /// Checks run in wire order: protocol version, transport, audio
    /// parameters. Any mismatch drops the hello with a warning and no
    /// acknowledgement, which devices treat as a handshake timeout.
    async fn handle_hello(
        &self,
        device_id: &str,
        hello: HelloRequest,
        publisher: &dyn ControlPublisher,
    ) -> Result<(), SignalingError> {
        let version = self.config.protocol_version;
        if hello.version != version {
            warn!(
                "Rejecting hello from {}: protocol version {} (supported: {})",
                device_id, hello.version, version
            );
            return Ok(());
        }
        if hello.transport.as_deref() != Some("udp") {
            warn!(
                "Rejecting hello from {}: transport {:?} (supported: udp)",
                device_id, hello.transport
            );
            return Ok(());
        }
        let params = &hello.audio_params;
        if params.format.as_deref() != Some("opus") || params.sample_rate != Some(SAMPLE_RATE) {
            warn!(
                "Rejecting hello from {}: audio params {:?}/{:?} (supported: opus/{})",
                device_id, params.format, params.sample_rate, SAMPLE_RATE
            );
            return Ok(());
        }

        let crypto = SessionCrypto::generate();
        let udp = UdpEndpoint {
            server: self.config.udp.advertise_host.clone(),
            port: self.config.udp.port,
            key: hex::encode(crypto.key),
            nonce: hex::encode(crypto.base_nonce),
            encryption: ENCRYPTION_SCHEME.to_owned(),
        };
        let session = Session::new_udp_with_crypto(device_id, crypto);
        let session_id = session.session_id.clone();

        let ack = OutboundMessage::Hello(HelloAck {
            session_id: session_id.clone(),
            transport: "udp".to_owned(),
            version,
            audio_params: AudioParams {
                format: "opus".to_owned(),
                sample_rate: SAMPLE_RATE,
                channels: CHANNELS,
                frame_duration: Some(params.frame_duration.unwrap_or(FRAME_DURATION_MS)),
            },
            udp: Some(udp),
        });

        if let Some(old) = self.sessions.insert(session) {
            info!(
                "Superseding session {} for {} with a fresh hello",
                old.session_id, device_id
            );
        }
        publisher.publish(device_id, &ack).await?;
        info!("Session {} established for {} over udp", session_id, device_id);
        Ok(())
    }

    async fn handle_goodbye(
        &self,
        device_id: &str,
        goodbye: GoodbyeRequest,
        publisher: &dyn ControlPublisher,
    ) -> Result<(), SignalingError> {
        let Some(session_id) = goodbye.session_id else {
            warn!("Ignoring goodbye from {}: no session id", device_id);
            return Ok(());
        };
        let Some(session) = self.sessions.remove(&session_id) else {
            warn!(
                "Ignoring goodbye from {}: unknown session {}",
                device_id, session_id
            );
            return Ok(());
        };

        publisher
            .publish(
                device_id,
                &OutboundMessage::Goodbye(GoodbyeAck {
                    session_id: session_id.clone(),
                }),
            )
            .await?;

        if self.sessions.device_session_count(&session.device_id) == 0 {
            self.pipeline.abandon(&session.device_id);
        }
        info!("Session {} closed for {}", session_id, device_id);
        Ok(())
    }

    fn handle_listen(&self, device_id: &str, listen: ListenRequest) {
        let Some(target) = self.resolve_device(device_id, listen.session_id.as_deref(), "listen")
        else {
            return;
        };
        match listen.state {
            ListenState::Detect => {
                info!("Wake word reported by {}: {:?}", target, listen.text);
            }
            ListenState::Start => {
                let mode = listen.mode.unwrap_or_else(|| "manual".to_owned());
                self.pipeline.set_capture(&target, true, Some(mode));
            }
            ListenState::Stop => {
                self.pipeline.set_capture(&target, false, None);
            }
        }
    }

    fn handle_abort(&self, device_id: &str, abort: AbortRequest) {
        let Some(target) = self.resolve_device(device_id, abort.session_id.as_deref(), "abort")
        else {
            return;
        };
        match abort.reason.as_deref() {
            Some("wake_word_detected") => {
                info!("Aborting reply to {}: interrupted by wake word", target);
            }
            Some(reason) => info!("Aborting reply to {}: {}", target, reason),
            None => info!("Aborting reply to {}", target),
        }
        self.dispatcher.cancel(&target);
    }

    fn handle_iot(&self, device_id: &str, iot: IotRequest) {
        let Some(session_id) = iot.session_id else {
            warn!("Ignoring iot update from {}: no session id", device_id);
            return;
        };
        let updated = self.sessions.with_session(&session_id, |session| {
            session.touch();
            session.merge_iot(iot.descriptors, iot.states);
        });
        if updated.is_none() {
            warn!(
                "Ignoring iot update from {}: unknown session {}",
                device_id, session_id
            );
        }
    }

    /// Resolve a message's session id to the owning device, touching the
    /// session so control traffic counts as activity.
    fn resolve_device(
        &self,
        device_id: &str,
        session_id: Option<&str>,
        kind: &str,
    ) -> Option<String> {
        let Some(session_id) = session_id else {
            warn!("Ignoring {} from {}: no session id", kind, device_id);
            return None;
        };
        let owner = self.sessions.with_session(session_id, |session| {
            session.touch();
            session.device_id.clone()
        });
        if owner.is_none() {
            warn!(
                "Ignoring {} from {}: unknown session {}",
                kind, device_id, session_id
            );
        }
        owner
    }
}
