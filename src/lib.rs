//! Voxgate: a real-time gateway between embedded voice-assistant devices
//! and backend speech services.
//!
//! Devices signal over MQTT, stream encrypted Opus audio over UDP or a
//! WebSocket, and receive synthesized replies back over whichever routes
//! they hold. The crate is organized around that flow:
//!
//! - [`signaling`]: MQTT control plane (hello/goodbye/listen/abort/iot)
//! - [`transport`]: encrypted UDP audio, device WebSockets, outbound fan-out
//! - [`core`]: sessions, packet crypto, codecs, VAD and the ingest pipeline
//! - [`config`]: environment and YAML configuration

pub mod config;
pub mod core;
pub mod errors;
pub mod routes;
pub mod signaling;
pub mod state;
pub mod transport;

// Re-export commonly used items for convenience
pub use config::GatewayConfig;
pub use errors::{GatewayError, GatewayResult};
pub use state::AppState;
