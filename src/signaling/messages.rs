//! Control-plane message types
//!
//! JSON messages exchanged with devices over the signaling topics and the
//! WebSocket text channel. Field names and shapes are part of the device
//! protocol; change them only with firmware coordination.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::pipeline::ReplyEvent;

/// Maximum accepted control payload (64 KB)
pub const MAX_CONTROL_PAYLOAD_SIZE: usize = 64 * 1024;

// =============================================================================
// Topics
// =============================================================================

/// Topic prefix all device control traffic lives under.
pub const DEVICE_TOPIC_PREFIX: &str = "esp32/device";

/// Direction encoded in the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicDirection {
    /// Device to server
    In,
    /// Server to device
    Out,
}

/// Device-to-server topic for one device.
pub fn device_in_topic(device_id: &str) -> String {
    format!("{DEVICE_TOPIC_PREFIX}/{device_id}/in")
}

/// Server-to-device topic for one device.
pub fn device_out_topic(device_id: &str) -> String {
    format!("{DEVICE_TOPIC_PREFIX}/{device_id}/out")
}

/// Split a control topic into device id and direction.
///
/// Topics have exactly four segments: `esp32/device/{device_id}/{in|out}`.
pub fn parse_device_topic(topic: &str) -> Option<(&str, TopicDirection)> {
    let mut parts = topic.split('/');
    let (root, scope, device_id, direction) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || root != "esp32" || scope != "device" || device_id.is_empty() {
        return None;
    }
    match direction {
        "in" => Some((device_id, TopicDirection::In)),
        "out" => Some((device_id, TopicDirection::Out)),
        _ => None,
    }
}

// =============================================================================
// Incoming Messages (Device -> Server)
// =============================================================================

/// Control messages devices send, dispatched on the `type` field.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Session handshake
    #[serde(rename = "hello")]
    Hello(HelloRequest),

    /// Session teardown
    #[serde(rename = "goodbye")]
    Goodbye(GoodbyeRequest),

    /// Capture control and wake-word notification
    #[serde(rename = "listen")]
    Listen(ListenRequest),

    /// Cancel the in-flight reply stream
    #[serde(rename = "abort")]
    Abort(AbortRequest),

    /// Device capability/state snapshot
    #[serde(rename = "iot")]
    Iot(IotRequest),
}

/// `hello` payload. Devices that omit the version are speaking protocol 1.
#[derive(Debug, Deserialize, Serialize)]
pub struct HelloRequest {
    #[serde(default = "default_hello_version")]
    pub version: u32,

    #[serde(default)]
    pub transport: Option<String>,

    #[serde(default)]
    pub audio_params: HelloAudioParams,
}

fn default_hello_version() -> u32 {
    1
}

/// Audio parameters a device declares in its hello.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HelloAudioParams {
    #[serde(default)]
    pub format: Option<String>,

    #[serde(default)]
    pub sample_rate: Option<u32>,

    #[serde(default)]
    pub channels: Option<u32>,

    /// Frame duration in ms; echoed back in the acknowledgement
    #[serde(default)]
    pub frame_duration: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GoodbyeRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Capture sub-states of a `listen` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    /// Wake word spotted on-device, informational
    Detect,
    Start,
    Stop,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListenRequest {
    #[serde(default)]
    pub session_id: Option<String>,

    pub state: ListenState,

    /// Wake word text for `detect`
    #[serde(default)]
    pub text: Option<String>,

    /// Capture mode for `start`, defaults to manual
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IotRequest {
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub descriptors: Option<Value>,

    #[serde(default)]
    pub states: Option<Value>,
}

// =============================================================================
// Outgoing Messages (Server -> Device)
// =============================================================================

/// Messages the gateway publishes to a device's output channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "hello")]
    Hello(HelloAck),

    #[serde(rename = "goodbye")]
    Goodbye(GoodbyeAck),

    #[serde(rename = "tts")]
    Tts(TtsMessage),
}

/// Server hello acknowledging a validated handshake.
#[derive(Debug, Serialize, Deserialize)]
pub struct HelloAck {
    pub session_id: String,
    pub transport: String,
    pub version: u32,
    pub audio_params: AudioParams,

    /// Present only for UDP sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpEndpoint>,
}

/// Audio parameters the server commits to.
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_duration: Option<u32>,
}

/// Where and how to send encrypted audio datagrams.
#[derive(Debug, Serialize, Deserialize)]
pub struct UdpEndpoint {
    pub server: String,
    pub port: u16,
    /// Session key, hex
    pub key: String,
    /// Session base nonce, hex
    pub nonce: String,
    pub encryption: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoodbyeAck {
    pub session_id: String,
}

/// Reply stream phases, mirroring [`ReplyEvent`] on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsState {
    Start,
    Sentence,
    Stop,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TtsMessage {
    pub session_id: String,
    pub state: TtsState,

    /// Reply text for `sentence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Failure description for `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TtsMessage {
    pub fn from_event(session_id: &str, event: ReplyEvent) -> Self {
        let session_id = session_id.to_owned();
        match event {
            ReplyEvent::Start => Self {
                session_id,
                state: TtsState::Start,
                text: None,
                message: None,
            },
            ReplyEvent::Sentence(text) => Self {
                session_id,
                state: TtsState::Sentence,
                text: Some(text),
                message: None,
            },
            ReplyEvent::Stop => Self {
                session_id,
                state: TtsState::Stop,
                text: None,
                message: None,
            },
            ReplyEvent::Error(message) => Self {
                session_id,
                state: TtsState::Error,
                text: None,
                message: Some(message),
            },
        }
    }
}
