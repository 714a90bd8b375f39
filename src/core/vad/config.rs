//! VAD configuration types

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::audio::FRAME_DURATION_MS;

/// How per-sub-frame decisions combine into one 60 ms block decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationPolicy {
    /// Block counts as speech only when every sub-frame is speech.
    /// Conservative: trailing silence inside a block ends the run.
    #[default]
    AllPositive,
    /// Block counts as speech when at least one sub-frame is speech
    AnyPositive,
}

impl std::fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationPolicy::AllPositive => write!(f, "all-positive"),
            AggregationPolicy::AnyPositive => write!(f, "any-positive"),
        }
    }
}

/// Configuration for voice activity detection and utterance segmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Normalized RMS energy threshold (0.0 - 1.0)
    /// Sub-frames with energy above this count as speech
    pub energy_threshold: f32,

    /// Sub-frame aggregation policy for the block decision
    pub aggregation: AggregationPolicy,

    /// Consecutive silent blocks after speech before the utterance flushes
    pub silence_hang_blocks: u32,

    /// Absolute silence deadline (ms) since the last speech block
    /// Flushes a pending utterance even when no further packets arrive
    pub utterance_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            aggregation: AggregationPolicy::AllPositive,
            silence_hang_blocks: 15,
            utterance_timeout_ms: 2000,
        }
    }
}

impl VadConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.energy_threshold <= 0.0 || self.energy_threshold > 1.0 {
            anyhow::bail!("VAD energy_threshold must be in (0.0, 1.0]");
        }
        if self.silence_hang_blocks == 0 {
            anyhow::bail!("VAD silence_hang_blocks must be at least 1");
        }
        if self.utterance_timeout_ms < u64::from(FRAME_DURATION_MS) {
            anyhow::bail!(
                "VAD utterance_timeout_ms must cover at least one {}ms block",
                FRAME_DURATION_MS
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VadConfig::default();
        assert_eq!(config.energy_threshold, 0.02);
        assert_eq!(config.aggregation, AggregationPolicy::AllPositive);
        assert_eq!(config.silence_hang_blocks, 15);
        assert_eq!(config.utterance_timeout_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_threshold() {
        let mut config = VadConfig::default();

        config.energy_threshold = 0.0;
        assert!(config.validate().is_err());

        config.energy_threshold = 1.0;
        assert!(config.validate().is_ok());

        config.energy_threshold = 1.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hang_and_timeout() {
        let mut config = VadConfig::default();

        config.silence_hang_blocks = 0;
        assert!(config.validate().is_err());

        config.silence_hang_blocks = 1;
        config.utterance_timeout_ms = 30;
        assert!(config.validate().is_err());

        config.utterance_timeout_ms = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_aggregation_serde_names() {
        let all: AggregationPolicy = serde_json::from_str("\"all-positive\"").unwrap();
        assert_eq!(all, AggregationPolicy::AllPositive);
        let any: AggregationPolicy = serde_json::from_str("\"any-positive\"").unwrap();
        assert_eq!(any, AggregationPolicy::AnyPositive);
        assert_eq!(format!("{}", AggregationPolicy::AllPositive), "all-positive");
    }
}
