//! Encrypted UDP audio transport.
//!
//! Devices stream AES-128-CTR encrypted Opus frames to one shared socket.
//! Packets are matched to sessions by the nonce advertised in the hello
//! ack; the peer address is learned from traffic, so devices behind NAT
//! need no port configuration. Decrypted frames feed the ingest pipeline,
//! or bounce straight back as ack packets when echo mode is on.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::crypto::{apply_keystream, seal_packet};
use crate::core::packet::{PACKET_TYPE_AUDIO_ACK, PacketHeader};
use crate::core::pipeline::{AudioIngestPipeline, DispatchError};
use crate::core::session::{SequenceOutcome, SessionRegistry, TransportKind};

/// Largest datagram the receive loop will read. A 60ms Opus frame is a few
/// hundred bytes, so this leaves generous headroom.
const MAX_DATAGRAM_SIZE: usize = 4096;

enum DatagramVerdict {
    /// No session owns the nonce, or the session has no crypto material.
    Unknown,
    /// Sequence number is behind the accepted window.
    Stale { current: u32 },
    Accepted {
        device_id: String,
        key: [u8; 16],
        gap: bool,
        expected: u32,
    },
}

/// Receive loop for the device audio socket.
pub struct UdpAudioServer {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionRegistry>,
    pipeline: Arc<AudioIngestPipeline>,
    echo_mode: bool,
    shutdown: CancellationToken,
}

impl UdpAudioServer {
    pub fn new(
        socket: Arc<UdpSocket>,
        sessions: Arc<SessionRegistry>,
        pipeline: Arc<AudioIngestPipeline>,
        echo_mode: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            socket,
            sessions,
            pipeline,
            echo_mode,
            shutdown,
        }
    }

    /// Read datagrams until shutdown. Malformed or unroutable packets are
    /// logged and dropped; only socket-level failures bubble up.
    pub async fn run(self) -> std::io::Result<()> {
        info!(
            "UDP audio server listening on {} (echo_mode: {})",
            self.socket.local_addr()?,
            self.echo_mode
        );
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("UDP audio server shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.process_datagram(&buf[..len], peer).await,
                    Err(err) => warn!("UDP receive error: {}", err),
                }
            }
        }
    }

    async fn process_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        let (header, ciphertext) = match PacketHeader::parse(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Dropping malformed datagram from {}: {}", peer, err);
                return;
            }
        };

        let verdict = self
            .sessions
            .with_session_by_nonce(&header.nonce, |session| {
                let Some(crypto) = &session.crypto else {
                    return DatagramVerdict::Unknown;
                };
                let key = crypto.key;
                match session.accept_sequence(header.sequence) {
                    SequenceOutcome::Stale { current } => DatagramVerdict::Stale { current },
                    SequenceOutcome::Accepted { gap, expected } => {
                        session.remote_addr = Some(peer);
                        session.touch();
                        DatagramVerdict::Accepted {
                            device_id: session.device_id.clone(),
                            key,
                            gap,
                            expected,
                        }
                    }
                }
            })
            .unwrap_or(DatagramVerdict::Unknown);

        let (device_id, key) = match verdict {
            DatagramVerdict::Unknown => {
                warn!("Dropping datagram from {} with unknown nonce", peer);
                return;
            }
            DatagramVerdict::Stale { current } => {
                warn!(
                    "Dropping stale packet from {}: sequence {} behind window {}",
                    peer, header.sequence, current
                );
                return;
            }
            DatagramVerdict::Accepted {
                device_id,
                key,
                gap,
                expected,
            } => {
                if gap {
                    warn!(
                        "Sequence gap from {}: expected {}, got {}",
                        device_id, expected, header.sequence
                    );
                }
                (device_id, key)
            }
        };

        let mut plaintext = ciphertext.to_vec();
        apply_keystream(&key, &header.counter_block, &mut plaintext);

        if self.echo_mode {
            self.echo(&key, &header, &plaintext, peer).await;
            return;
        }
        self.pipeline.ingest(&device_id, &plaintext);
    }

    /// Bounce the decrypted payload back as an ack packet, re-encrypted
    /// under the device's own nonce and sequence.
    async fn echo(&self, key: &[u8; 16], header: &PacketHeader, plaintext: &[u8], peer: SocketAddr) {
        match seal_packet(
            key,
            PACKET_TYPE_AUDIO_ACK,
            &header.nonce,
            header.sequence,
            plaintext,
        ) {
            Ok(datagram) => {
                if let Err(err) = self.socket.send_to(&datagram, peer).await {
                    warn!("Echo reply to {} failed: {}", peer, err);
                }
            }
            Err(err) => warn!("Echo reply to {} not built: {}", peer, err),
        }
    }
}

/// Sends server-originated audio to devices over their UDP sessions.
pub struct UdpOutbound {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionRegistry>,
}

impl UdpOutbound {
    pub fn new(socket: Arc<UdpSocket>, sessions: Arc<SessionRegistry>) -> Self {
        Self { socket, sessions }
    }

    /// Encrypt one frame under the session's key and base nonce with a
    /// fresh local sequence number, and send it to the learned peer
    /// address. Fails with `NoRoute` until the device has sent at least
    /// one packet.
    pub async fn send_audio(&self, device_id: &str, frame: &[u8]) -> Result<(), DispatchError> {
        let route = self
            .sessions
            .with_device_session(device_id, TransportKind::Udp, |session| {
                let crypto = session.crypto.as_ref()?;
                let peer = session.remote_addr?;
                let key = crypto.key;
                let nonce = crypto.base_nonce;
                Some((key, nonce, session.next_local_sequence(), peer))
            });
        let Some(Some((key, nonce, sequence, peer))) = route else {
            return Err(DispatchError::NoRoute(device_id.to_string()));
        };

        let datagram = seal_packet(&key, PACKET_TYPE_AUDIO_ACK, &nonce, sequence, frame)
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        self.socket
            .send_to(&datagram, peer)
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        Ok(())
    }
}
