//! UDP audio packet wire format.
//!
//! Every datagram starts with a 16-byte header, followed by the ciphertext.
//! The header bytes double as the AES-CTR counter block for the payload:
//!
//! | bytes | field                                        |
//! |-------|----------------------------------------------|
//! | 0     | packet type (`0x01` audio, `0x02` audio ack) |
//! | 1     | reserved, zero                               |
//! | 2-3   | ciphertext length, big-endian u16            |
//! | 4-11  | session base nonce                           |
//! | 12-15 | sequence number, big-endian u32              |

use thiserror::Error;

/// Device-to-server audio packet.
pub const PACKET_TYPE_AUDIO: u8 = 0x01;

/// Server-to-device audio packet.
pub const PACKET_TYPE_AUDIO_ACK: u8 = 0x02;

/// Size of the wire header, which is also the CTR counter block size.
pub const HEADER_LEN: usize = 16;

/// Number of base-nonce bytes carried in the header.
pub const NONCE_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported packet type 0x{0:02x}")]
    UnsupportedType(u8),

    #[error("length mismatch: header declares {declared} bytes, payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload of {0} bytes does not fit the u16 length field")]
    PayloadTooLarge(usize),
}

/// One parsed datagram header.
///
/// `counter_block` preserves the first 16 wire bytes verbatim; decryption
/// must use these rather than a re-encoded header, since the sender controls
/// the reserved byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub length: u16,
    pub nonce: [u8; NONCE_LEN],
    pub sequence: u32,
    pub counter_block: [u8; HEADER_LEN],
}

impl PacketHeader {
    /// Parse and validate the header of a received datagram.
    ///
    /// Checks run in wire order: minimum size, packet type, declared length
    /// against the actual ciphertext length. Returns the header and the
    /// ciphertext slice.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::TooShort(datagram.len()));
        }

        let packet_type = datagram[0];
        if packet_type != PACKET_TYPE_AUDIO {
            return Err(PacketError::UnsupportedType(packet_type));
        }

        let length = u16::from_be_bytes([datagram[2], datagram[3]]);
        let payload = &datagram[HEADER_LEN..];
        if usize::from(length) != payload.len() {
            return Err(PacketError::LengthMismatch {
                declared: usize::from(length),
                actual: payload.len(),
            });
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&datagram[4..12]);

        let sequence = u32::from_be_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]);

        let mut counter_block = [0u8; HEADER_LEN];
        counter_block.copy_from_slice(&datagram[..HEADER_LEN]);

        Ok((
            Self {
                packet_type,
                length,
                nonce,
                sequence,
                counter_block,
            },
            payload,
        ))
    }
}

/// Assemble the header for a server-originated packet.
///
/// The returned bytes are both the wire header and the CTR counter block
/// under which the payload must be encrypted.
pub fn build_header(
    packet_type: u8,
    nonce: &[u8; NONCE_LEN],
    sequence: u32,
    payload_len: usize,
) -> Result<[u8; HEADER_LEN], PacketError> {
    let length =
        u16::try_from(payload_len).map_err(|_| PacketError::PayloadTooLarge(payload_len))?;

    let mut header = [0u8; HEADER_LEN];
    header[0] = packet_type;
    header[2..4].copy_from_slice(&length.to_be_bytes());
    header[4..12].copy_from_slice(nonce);
    header[12..16].copy_from_slice(&sequence.to_be_bytes());
    Ok(header)
}
