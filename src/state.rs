//! Shared application state for the HTTP/WebSocket layer.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::core::pipeline::AudioIngestPipeline;
use crate::core::session::SessionRegistry;
use crate::signaling::SignalingHandler;
use crate::transport::ConnectionRegistry;

/// Everything a request handler needs, wired once at startup.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub pipeline: Arc<AudioIngestPipeline>,
    pub control: Arc<SignalingHandler>,
}

impl AppState {
    pub fn new(
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionRegistry>,
        pipeline: Arc<AudioIngestPipeline>,
        control: Arc<SignalingHandler>,
    ) -> Self {
        Self {
            config,
            sessions,
            connections,
            pipeline,
            control,
        }
    }
}
