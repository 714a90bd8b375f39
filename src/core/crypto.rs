//! AES-128-CTR packet encryption.
//!
//! The 16-byte packet header is the CTR counter block, so every packet uses
//! a distinct keystream as long as the (nonce, sequence) pair never repeats.
//! Encryption and decryption are the same keystream XOR.

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};

use super::packet::{self, HEADER_LEN, NONCE_LEN, PacketError};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Scheme identifier advertised to devices in the hello ack.
pub const ENCRYPTION_SCHEME: &str = "aes-128-ctr";

/// XOR `data` in place with the AES-128-CTR keystream for `counter_block`.
///
/// Call with the verbatim header bytes of a received packet to decrypt, or
/// with a freshly built header to encrypt.
pub fn apply_keystream(key: &[u8; 16], counter_block: &[u8; HEADER_LEN], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), counter_block.into());
    cipher.apply_keystream(data);
}

/// Build a complete outgoing datagram: header followed by the encrypted
/// payload, with the header itself as the counter block.
pub fn seal_packet(
    key: &[u8; 16],
    packet_type: u8,
    nonce: &[u8; NONCE_LEN],
    sequence: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let header = packet::build_header(packet_type, nonce, sequence, plaintext.len())?;

    let mut datagram = Vec::with_capacity(HEADER_LEN + plaintext.len());
    datagram.extend_from_slice(&header);
    datagram.extend_from_slice(plaintext);
    apply_keystream(key, &header, &mut datagram[HEADER_LEN..]);
    Ok(datagram)
}
