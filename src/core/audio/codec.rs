//! Frame codecs for the audio path.
//!
//! The gateway works in fixed 60 ms blocks of 16 kHz mono PCM. Codecs are
//! created per device through a [`CodecFactory`] because Opus coder state is
//! stateful and not shareable across streams.

use std::sync::Arc;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use thiserror::Error;

/// Sample rate every stream runs at.
pub const SAMPLE_RATE: u32 = 16_000;

/// Mono only.
pub const CHANNELS: u32 = 1;

/// Duration of one audio frame in milliseconds.
pub const FRAME_DURATION_MS: u32 = 60;

/// PCM samples in one frame: 16 kHz * 60 ms.
pub const FRAME_SAMPLES: usize = 960;

/// Bytes in one frame of 16-bit PCM.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Largest encoded frame the encoder may produce.
const MAX_ENCODED_FRAME: usize = 4000;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    Init(audiopus::Error),

    #[error("Frame decode failed: {0}")]
    Decode(audiopus::Error),

    #[error("Frame encode failed: {0}")]
    Encode(audiopus::Error),

    #[error("Frame has {0} samples, expected {FRAME_SAMPLES}")]
    BadFrameSize(usize),
}

/// Decode and encode one 60 ms frame at a time.
///
/// `decode_frame` must yield exactly [`FRAME_SAMPLES`] samples and
/// `encode_frame` must be fed exactly that many; anything else is a device
/// speaking the wrong frame duration.
pub trait FrameCodec: Send {
    fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError>;
    fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Builds a fresh codec for each device stream.
pub type CodecFactory = Arc<dyn Fn() -> Result<Box<dyn FrameCodec>, CodecError> + Send + Sync>;

// ===== Opus =====

/// Opus coder pair pinned to 16 kHz mono voice settings.
pub struct OpusCodec {
    decoder: Decoder,
    encoder: Encoder,
}

impl OpusCodec {
    pub fn new() -> Result<Self, CodecError> {
        let decoder =
            Decoder::new(SampleRate::Hz16000, Channels::Mono).map_err(CodecError::Init)?;
        let encoder = Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Voip)
            .map_err(CodecError::Init)?;
        Ok(Self { decoder, encoder })
    }
}

impl FrameCodec for OpusCodec {
    fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(Some(payload), &mut pcm[..], false)
            .map_err(CodecError::Decode)?;
        if decoded != FRAME_SAMPLES {
            return Err(CodecError::BadFrameSize(decoded));
        }
        Ok(pcm)
    }

    fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(CodecError::BadFrameSize(pcm.len()));
        }
        let mut encoded = vec![0u8; MAX_ENCODED_FRAME];
        let written = self
            .encoder
            .encode(pcm, &mut encoded)
            .map_err(CodecError::Encode)?;
        encoded.truncate(written);
        Ok(encoded)
    }
}

// ===== PCM passthrough =====

/// Identity codec that treats payloads as raw little-endian 16-bit PCM.
/// Useful for diagnostics and tests where Opus framing is noise.
#[derive(Default)]
pub struct PcmCodec;

impl PcmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for PcmCodec {
    fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        if payload.len() != FRAME_BYTES {
            return Err(CodecError::BadFrameSize(payload.len() / 2));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(CodecError::BadFrameSize(pcm.len()));
        }
        let mut payload = Vec::with_capacity(FRAME_BYTES);
        for sample in pcm {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(payload)
    }
}
