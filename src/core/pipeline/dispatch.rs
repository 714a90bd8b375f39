//! Reply dispatch back to devices.
//!
//! A synthesized reply goes out as a control sequence (`start`, one
//! `sentence`, `stop`) with encoded audio frames in between, paced at the
//! frame cadence so devices can play while receiving. Each device has at
//! most one active stream; `abort` cancels it between frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backend::SynthesizedReply;
use crate::core::audio::{CodecError, CodecFactory, FRAME_DURATION_MS, FRAME_SAMPLES};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No route to device '{0}'")]
    NoRoute(String),

    #[error("Audio encode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport send failed: {0}")]
    Transport(String),
}

/// Control events in a reply stream, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    Start,
    Sentence(String),
    Stop,
    Error(String),
}

/// Where dispatched replies go. Implemented by the transport router, which
/// picks the right channel per device.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_control(
        &self,
        device_id: &str,
        session_id: &str,
        event: ReplyEvent,
    ) -> Result<(), DispatchError>;

    async fn send_audio(&self, device_id: &str, frame: Bytes) -> Result<(), DispatchError>;
}

/// Streams replies to devices and tracks the cancellation handle per device.
pub struct ReplyDispatcher {
    sink: Arc<dyn OutboundSink>,
    codec_factory: CodecFactory,
    cancellations: DashMap<String, CancellationToken>,
}

impl ReplyDispatcher {
    pub fn new(sink: Arc<dyn OutboundSink>, codec_factory: CodecFactory) -> Self {
        Self {
            sink,
            codec_factory,
            cancellations: DashMap::new(),
        }
    }

    /// Stream one reply to a device. Serialized per device by the caller's
    /// processing lock, so a plain insert cannot clobber a live stream.
    pub async fn dispatch(
        &self,
        device_id: &str,
        session_id: &str,
        reply: SynthesizedReply,
    ) -> Result<(), DispatchError> {
        let token = CancellationToken::new();
        self.cancellations
            .insert(device_id.to_owned(), token.clone());

        let result = self.stream_reply(device_id, session_id, reply, &token).await;
        self.cancellations.remove(device_id);

        if let Err(err) = &result {
            // Let the device know the stream died; delivery is best effort
            // since the route may be the thing that failed.
            let _ = self
                .sink
                .send_control(device_id, session_id, ReplyEvent::Error(err.to_string()))
                .await;
        }
        result
    }

    async fn stream_reply(
        &self,
        device_id: &str,
        session_id: &str,
        reply: SynthesizedReply,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let mut codec = (self.codec_factory)()?;

        self.sink
            .send_control(device_id, session_id, ReplyEvent::Start)
            .await?;
        self.sink
            .send_control(device_id, session_id, ReplyEvent::Sentence(reply.text))
            .await?;

        let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(FRAME_DURATION_MS)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent = 0usize;
        let mut cancelled = false;
        for chunk in reply.pcm.chunks(FRAME_SAMPLES) {
            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            let frame = if chunk.len() == FRAME_SAMPLES {
                codec.encode_frame(chunk)?
            } else {
                // Final partial block is zero-padded to a full frame.
                let mut padded = chunk.to_vec();
                padded.resize(FRAME_SAMPLES, 0);
                codec.encode_frame(&padded)?
            };
            self.sink.send_audio(device_id, Bytes::from(frame)).await?;
            sent += 1;
        }

        if cancelled {
            debug!("Reply stream to {} cancelled after {} frames", device_id, sent);
        } else {
            debug!("Reply stream to {} finished: {} frames", device_id, sent);
        }

        self.sink
            .send_control(device_id, session_id, ReplyEvent::Stop)
            .await?;
        Ok(())
    }

    /// Cancel the device's active reply stream, if any. The stream stops at
    /// the next frame boundary and still sends its `stop` event.
    pub fn cancel(&self, device_id: &str) {
        if let Some(token) = self.cancellations.get(device_id) {
            token.cancel();
        }
    }

    /// Tell a device its utterance could not be processed.
    pub async fn report_error(&self, device_id: &str, session_id: &str, message: &str) {
        if let Err(err) = self
            .sink
            .send_control(device_id, session_id, ReplyEvent::Error(message.to_owned()))
            .await
        {
            debug!("Failed to deliver error event to {}: {}", device_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::PcmCodec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ReplyEvent>>,
        frames: Mutex<Vec<Bytes>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<ReplyEvent> {
            self.events.lock().unwrap().clone()
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_control(
            &self,
            _device_id: &str,
            _session_id: &str,
            event: ReplyEvent,
        ) -> Result<(), DispatchError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        async fn send_audio(&self, _device_id: &str, frame: Bytes) -> Result<(), DispatchError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn pcm_factory() -> CodecFactory {
        Arc::new(|| Ok(Box::new(PcmCodec::new())))
    }

    fn dispatcher(sink: Arc<RecordingSink>) -> Arc<ReplyDispatcher> {
        Arc::new(ReplyDispatcher::new(sink, pcm_factory()))
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_emits_start_sentence_frames_stop() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        // Two full frames plus a half frame that must be padded.
        let reply = SynthesizedReply {
            text: "hello there".into(),
            pcm: vec![100i16; FRAME_SAMPLES * 2 + FRAME_SAMPLES / 2],
        };
        dispatcher.dispatch("dev-1", "sess-1", reply).await.unwrap();

        assert_eq!(
            sink.events(),
            vec![
                ReplyEvent::Start,
                ReplyEvent::Sentence("hello there".into()),
                ReplyEvent::Stop,
            ]
        );
        assert_eq!(sink.frame_count(), 3);

        // Padded tail: half the samples carry signal, the rest are zero.
        let frames = sink.frames.lock().unwrap();
        let last = &frames[2];
        assert_eq!(&last[FRAME_SAMPLES..], vec![0u8; FRAME_SAMPLES].as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_still_brackets_with_start_and_stop() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        let reply = SynthesizedReply {
            text: "nothing to say".into(),
            pcm: Vec::new(),
        };
        dispatcher.dispatch("dev-1", "sess-1", reply).await.unwrap();

        assert_eq!(sink.frame_count(), 0);
        assert_eq!(
            sink.events(),
            vec![
                ReplyEvent::Start,
                ReplyEvent::Sentence("nothing to say".into()),
                ReplyEvent::Stop,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_frame_stream() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        let reply = SynthesizedReply {
            text: "long reply".into(),
            pcm: vec![7i16; FRAME_SAMPLES * 50],
        };
        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch("dev-1", "sess-1", reply).await }
        });

        // Let the stream get going, then abort it.
        while sink.frame_count() == 0 {
            tokio::task::yield_now().await;
        }
        dispatcher.cancel("dev-1");
        task.await.unwrap().unwrap();

        assert!(sink.frame_count() < 50, "cancel did not stop the stream");
        assert_eq!(sink.events().last(), Some(&ReplyEvent::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn error_report_reaches_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        dispatcher
            .report_error("dev-1", "sess-1", "backend unavailable")
            .await;

        assert_eq!(
            sink.events(),
            vec![ReplyEvent::Error("backend unavailable".into())]
        );
    }
}
