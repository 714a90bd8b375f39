//! Sub-frame speech detection
//!
//! Each decoded 60 ms block is split into three 20 ms sub-frames and every
//! sub-frame is classified independently. The block decision comes from the
//! configured [`AggregationPolicy`].

use std::sync::Arc;

use super::config::AggregationPolicy;
use crate::core::audio::FRAME_SAMPLES;

/// Sub-frames per 60 ms block.
pub const SUB_FRAMES_PER_BLOCK: usize = 3;

/// Samples in one 20 ms sub-frame at 16 kHz.
pub const SUB_FRAME_SAMPLES: usize = FRAME_SAMPLES / SUB_FRAMES_PER_BLOCK;

/// Bytes in one sub-frame of 16-bit PCM.
pub const SUB_FRAME_BYTES: usize = SUB_FRAME_SAMPLES * 2;

/// Trait for voice activity detector implementations.
///
/// Detectors are stateful per stream; one instance per device lane.
pub trait VoiceActivityDetector: Send {
    /// Classify a single 20 ms sub-frame of 16-bit PCM
    fn is_speech(&mut self, sub_frame: &[i16]) -> bool;

    /// Reset internal state (call when starting a new utterance)
    fn reset(&mut self);
}

/// Builds a fresh detector for each device stream.
pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn VoiceActivityDetector> + Send + Sync>;

/// Classify one decoded block by splitting it into sub-frames and folding
/// the per-sub-frame decisions under `policy`.
pub fn classify_block(
    detector: &mut dyn VoiceActivityDetector,
    pcm: &[i16],
    policy: AggregationPolicy,
) -> bool {
    let mut any = false;
    let mut all = true;
    for sub_frame in pcm.chunks(SUB_FRAME_SAMPLES) {
        if detector.is_speech(sub_frame) {
            any = true;
        } else {
            all = false;
        }
    }
    match policy {
        AggregationPolicy::AllPositive => any && all,
        AggregationPolicy::AnyPositive => any,
    }
}

/// RMS threshold detector.
///
/// Energy is the root mean square of samples normalized to [-1.0, 1.0], so
/// thresholds are independent of integer sample width.
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn rms(sub_frame: &[i16]) -> f32 {
        if sub_frame.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = sub_frame
            .iter()
            .map(|&sample| {
                let normalized = f64::from(sample) / f64::from(i16::MAX);
                normalized * normalized
            })
            .sum();
        (sum_squares / sub_frame.len() as f64).sqrt() as f32
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, sub_frame: &[i16]) -> bool {
        Self::rms(sub_frame) >= self.threshold
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_sub_frame() -> Vec<i16> {
        (0..SUB_FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                (0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin() * f32::from(i16::MAX)) as i16
            })
            .collect()
    }

    fn quiet_sub_frame() -> Vec<i16> {
        vec![3i16; SUB_FRAME_SAMPLES]
    }

    #[test]
    fn test_block_geometry() {
        assert_eq!(SUB_FRAME_SAMPLES, 320);
        assert_eq!(SUB_FRAME_BYTES, 640);
        assert_eq!(SUB_FRAME_SAMPLES * SUB_FRAMES_PER_BLOCK, FRAME_SAMPLES);
    }

    #[test]
    fn test_energy_detector_separates_speech_from_silence() {
        let mut vad = EnergyVad::new(0.02);
        assert!(vad.is_speech(&loud_sub_frame()));
        assert!(!vad.is_speech(&quiet_sub_frame()));
        assert!(!vad.is_speech(&vec![0i16; SUB_FRAME_SAMPLES]));
    }

    #[test]
    fn test_all_positive_rejects_mixed_block() {
        let mut vad = EnergyVad::new(0.02);
        let mut block = loud_sub_frame();
        block.extend_from_slice(&loud_sub_frame());
        block.extend_from_slice(&quiet_sub_frame());

        assert!(!classify_block(
            &mut vad,
            &block,
            AggregationPolicy::AllPositive
        ));
        assert!(classify_block(
            &mut vad,
            &block,
            AggregationPolicy::AnyPositive
        ));
    }

    #[test]
    fn test_uniform_blocks_agree_under_both_policies() {
        let mut vad = EnergyVad::new(0.02);
        let speech: Vec<i16> = std::iter::repeat_with(loud_sub_frame)
            .take(SUB_FRAMES_PER_BLOCK)
            .flatten()
            .collect();
        let silence = vec![0i16; FRAME_SAMPLES];

        for policy in [AggregationPolicy::AllPositive, AggregationPolicy::AnyPositive] {
            assert!(classify_block(&mut vad, &speech, policy));
            assert!(!classify_block(&mut vad, &silence, policy));
        }
    }
}
