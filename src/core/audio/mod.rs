//! Audio frame handling.

pub mod codec;

pub use codec::{
    CHANNELS, CodecError, CodecFactory, FRAME_BYTES, FRAME_DURATION_MS, FRAME_SAMPLES, FrameCodec,
    OpusCodec, PcmCodec, SAMPLE_RATE,
};
