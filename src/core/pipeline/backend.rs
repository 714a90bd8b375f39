//! Downstream reply backends.
//!
//! When the pipeline closes an utterance it hands the captured PCM to a
//! [`ReplyBackend`], which turns speech into a spoken reply. The default
//! deployment chains recognition, reply generation, and synthesis; the
//! loopback backend short-circuits all three for wiring checks.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Speech recognition failed: {0}")]
    Recognition(String),

    #[error("Reply generation failed: {0}")]
    Reply(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A finished reply: the sentence to announce and the PCM to speak.
#[derive(Debug, Clone)]
pub struct SynthesizedReply {
    pub text: String,
    pub pcm: Vec<i16>,
}

/// Produces a spoken reply for one captured utterance.
#[async_trait]
pub trait ReplyBackend: Send + Sync {
    /// Process a complete utterance of 16 kHz mono PCM.
    async fn process(&self, device_id: &str, utterance: Vec<i16>) -> BackendResult<SynthesizedReply>;
}

// ===== Stage traits =====

/// Speech to text.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(&self, pcm: &[i16]) -> BackendResult<String>;
}

/// Transcript to reply text.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn reply(&self, device_id: &str, transcript: &str) -> BackendResult<String>;
}

/// Reply text to PCM.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> BackendResult<Vec<i16>>;
}

/// Recognize, generate, synthesize, in that order.
pub struct ChainBackend {
    recognizer: Arc<dyn SpeechRecognizer>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl ChainBackend {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            recognizer,
            generator,
            synthesizer,
        }
    }
}

#[async_trait]
impl ReplyBackend for ChainBackend {
    async fn process(&self, device_id: &str, utterance: Vec<i16>) -> BackendResult<SynthesizedReply> {
        let transcript = self.recognizer.transcribe(&utterance).await?;
        let text = self.generator.reply(device_id, &transcript).await?;
        let pcm = self.synthesizer.synthesize(&text).await?;
        Ok(SynthesizedReply { text, pcm })
    }
}

/// Echoes the captured utterance back with a fixed announcement.
pub struct LoopbackBackend {
    text: String,
}

impl LoopbackBackend {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new("playing back what I heard")
    }
}

#[async_trait]
impl ReplyBackend for LoopbackBackend {
    async fn process(&self, _device_id: &str, utterance: Vec<i16>) -> BackendResult<SynthesizedReply> {
        Ok(SynthesizedReply {
            text: self.text.clone(),
            pcm: utterance,
        })
    }
}
