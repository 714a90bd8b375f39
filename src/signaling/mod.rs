//! Device control plane.
//!
//! Devices exchange JSON control messages with the gateway over MQTT
//! topics under `esp32/device/{device_id}`. This module owns the wire
//! message definitions, the per-message handler logic, and the broker
//! connection loop that feeds it.

pub mod channel;
pub mod handler;
pub mod messages;

pub use channel::{
    MqttPublisher, ReconnectPolicy, SignalingChannel, SignalingError, mqtt_client,
};
pub use handler::{ControlPublisher, SignalingHandler};
pub use messages::{
    AbortRequest, AudioParams, ControlMessage, GoodbyeAck, GoodbyeRequest, HelloAck,
    HelloAudioParams, HelloRequest, IotRequest, ListenRequest, ListenState, OutboundMessage,
    TopicDirection, TtsMessage, TtsState, UdpEndpoint, device_in_topic, device_out_topic,
    parse_device_topic,
};
