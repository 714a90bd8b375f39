pub mod audio;
pub mod crypto;
pub mod packet;
pub mod pipeline;
pub mod session;
pub mod vad;

// Re-export commonly used types for convenience
pub use audio::{CodecError, CodecFactory, FrameCodec, OpusCodec, PcmCodec};
pub use packet::{PACKET_TYPE_AUDIO, PACKET_TYPE_AUDIO_ACK, PacketError, PacketHeader};
pub use pipeline::{
    AudioIngestPipeline, BackendError, ChainBackend, DispatchError, LoopbackBackend, OutboundSink,
    ReplyBackend, ReplyDispatcher, ReplyEvent, SynthesizedReply,
};
pub use session::{Session, SessionCrypto, SessionRegistry, SequenceOutcome, TransportKind};
pub use vad::{AggregationPolicy, DetectorFactory, EnergyVad, VadConfig, VoiceActivityDetector};
