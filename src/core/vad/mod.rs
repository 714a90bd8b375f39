//! Voice Activity Detection (VAD) module
//!
//! Acoustic speech detection over decoded PCM. Detection runs on 20 ms
//! sub-frames of each 60 ms block; segmentation of block decisions into
//! utterances happens in the ingest pipeline, not here.
//!
//! # Example
//!
//! ```rust,ignore
//! use voxgate::core::vad::{AggregationPolicy, EnergyVad, classify_block};
//!
//! let mut vad = EnergyVad::new(0.02);
//! let speaking = classify_block(&mut vad, &pcm_block, AggregationPolicy::AllPositive);
//! ```

pub mod config;
pub mod detector;

pub use config::{AggregationPolicy, VadConfig};
pub use detector::{
    DetectorFactory, EnergyVad, SUB_FRAME_BYTES, SUB_FRAME_SAMPLES, SUB_FRAMES_PER_BLOCK,
    VoiceActivityDetector, classify_block,
};
