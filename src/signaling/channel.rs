//! Broker connection and control receive loop
//!
//! One MQTT connection carries all device control traffic. The loop
//! processes messages in arrival order; a disconnect triggers bounded
//! exponential backoff, and exhausting the retries is fatal so a
//! supervisor can restart the process with fresh state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{ControlPublisher, SignalingHandler};
use super::messages::{
    DEVICE_TOPIC_PREFIX, MAX_CONTROL_PAYLOAD_SIZE, OutboundMessage, TopicDirection,
    device_out_topic, parse_device_topic,
};
use crate::config::MqttConfig;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Broker client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No signaling route to device '{0}'")]
    NoRoute(String),

    #[error("Broker connection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Bounded exponential backoff: base delay doubling per attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Build the broker client pair from configuration. The connection itself
/// is established lazily by the event loop.
pub fn mqtt_client(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.expose().to_owned());
    }
    AsyncClient::new(options, 64)
}

/// Publishes control messages to a device's output topic.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPublisher for MqttPublisher {
    async fn publish(
        &self,
        device_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SignalingError> {
        let payload = serde_json::to_vec(message)?;
        self.client
            .publish(
                device_out_topic(device_id),
                QoS::ExactlyOnce,
                false,
                payload,
            )
            .await?;
        Ok(())
    }
}

/// The control-plane receive loop.
pub struct SignalingChannel {
    client: AsyncClient,
    eventloop: EventLoop,
    handler: Arc<SignalingHandler>,
    publisher: Arc<dyn ControlPublisher>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

impl SignalingChannel {
    pub fn new(
        client: AsyncClient,
        eventloop: EventLoop,
        handler: Arc<SignalingHandler>,
        publisher: Arc<dyn ControlPublisher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            eventloop,
            handler,
            publisher,
            policy: ReconnectPolicy::default(),
            shutdown,
        }
    }

    /// Poll the broker until shutdown or retry exhaustion.
    ///
    /// Control messages are handled one at a time in arrival order;
    /// handler failures are logged here and do not stop the loop.
    pub async fn run(mut self) -> Result<(), SignalingError> {
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Signaling channel shutting down");
                    let _ = self.client.disconnect().await;
                    return Ok(());
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempts = 0;
                        info!("Connected to broker, subscribing to device topics");
                        self.subscribe().await?;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Err(err) = self
                            .handle_publish(&publish.topic, &publish.payload)
                            .await
                        {
                            warn!("Control handling failed on {}: {}", publish.topic, err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if self.policy.exhausted(attempts) {
                            error!(
                                "Giving up on broker after {} reconnect attempts: {}",
                                attempts, err
                            );
                            return Err(SignalingError::ReconnectExhausted { attempts });
                        }
                        let delay = self.policy.delay_for(attempts);
                        attempts += 1;
                        warn!(
                            "Broker connection lost ({}), reconnect attempt {} in {:?}",
                            err, attempts, delay
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn subscribe(&mut self) -> Result<(), SignalingError> {
        self.client
            .subscribe(format!("{DEVICE_TOPIC_PREFIX}/+/in"), QoS::ExactlyOnce)
            .await?;
        self.client
            .subscribe(format!("{DEVICE_TOPIC_PREFIX}/+/out"), QoS::ExactlyOnce)
            .await?;
        Ok(())
    }

    async fn handle_publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SignalingError> {
        let Some((device_id, direction)) = parse_device_topic(topic) else {
            debug!("Ignoring message on unrecognized topic {}", topic);
            return Ok(());
        };
        // Our own publishes come back on the /out side of the wildcard.
        if direction != TopicDirection::In {
            return Ok(());
        }
        if payload.len() > MAX_CONTROL_PAYLOAD_SIZE {
            warn!(
                "Dropping oversized control payload from {} ({} bytes)",
                device_id,
                payload.len()
            );
            return Ok(());
        }
        self.handler
            .handle_payload(device_id, payload, self.publisher.as_ref())
            .await
    }
}
