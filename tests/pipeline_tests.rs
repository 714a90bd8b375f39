//! Utterance segmentation through the ingest pipeline.
//!
//! These tests drive encoded frames straight into the pipeline and observe
//! what the reply backend receives, covering silence-hang flushing, the
//! absolute timeout, aggregation policies, capture control, and the
//! drop-newest backpressure rule.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use voxgate::core::audio::{CodecFactory, FRAME_SAMPLES, PcmCodec, SAMPLE_RATE};
use voxgate::core::pipeline::{
    AudioIngestPipeline, BackendResult, DispatchError, OutboundSink, ReplyBackend,
    ReplyDispatcher, ReplyEvent, SynthesizedReply,
};
use voxgate::core::session::SessionRegistry;
use voxgate::core::vad::{AggregationPolicy, DetectorFactory, EnergyVad, VadConfig};

struct NullSink;

#[async_trait]
impl OutboundSink for NullSink {
    async fn send_control(
        &self,
        _device_id: &str,
        _session_id: &str,
        _event: ReplyEvent,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn send_audio(&self, _device_id: &str, _frame: Bytes) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Records every utterance handed downstream. `notify` carries a permit per
/// processed utterance so tests can await delivery without polling.
#[derive(Default)]
struct RecordingBackend {
    utterances: Mutex<Vec<Vec<i16>>>,
    notify: Notify,
}

#[async_trait]
impl ReplyBackend for RecordingBackend {
    async fn process(&self, _device_id: &str, utterance: Vec<i16>) -> BackendResult<SynthesizedReply> {
        self.utterances.lock().push(utterance);
        self.notify.notify_one();
        Ok(SynthesizedReply {
            text: String::new(),
            pcm: Vec::new(),
        })
    }
}

/// Counts calls and then never finishes, keeping the device's processing
/// slot occupied.
#[derive(Default)]
struct StallingBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl ReplyBackend for StallingBackend {
    async fn process(&self, _device_id: &str, _utterance: Vec<i16>) -> BackendResult<SynthesizedReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }
}

fn pcm_factory() -> CodecFactory {
    Arc::new(|| Ok(Box::new(PcmCodec::new())))
}

fn energy_factory() -> DetectorFactory {
    Arc::new(|| Box::new(EnergyVad::new(0.02)))
}

fn pipeline_with(config: VadConfig, backend: Arc<dyn ReplyBackend>) -> Arc<AudioIngestPipeline> {
    let sessions = Arc::new(SessionRegistry::new());
    let dispatcher = Arc::new(ReplyDispatcher::new(Arc::new(NullSink), pcm_factory()));
    Arc::new(AudioIngestPipeline::new(
        config,
        pcm_factory(),
        energy_factory(),
        backend,
        dispatcher,
        sessions,
    ))
}

fn pcm_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// One 60 ms frame of 300 Hz sine, loud enough for every sub-frame.
fn speech_frame() -> Vec<u8> {
    let pcm: Vec<i16> = (0..FRAME_SAMPLES)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (0.3 * (2.0 * std::f32::consts::PI * 300.0 * t).sin() * f32::from(i16::MAX)) as i16
        })
        .collect();
    pcm_bytes(&pcm)
}

fn silence_frame() -> Vec<u8> {
    vec![0u8; FRAME_SAMPLES * 2]
}

/// Two loud sub-frames followed by one silent sub-frame.
fn mixed_frame() -> Vec<u8> {
    let speech = speech_frame();
    let mut frame = speech[..FRAME_SAMPLES * 2 * 2 / 3].to_vec();
    frame.resize(FRAME_SAMPLES * 2, 0);
    frame
}

const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

#[tokio::test]
async fn silence_hang_closes_exactly_one_utterance() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = pipeline_with(VadConfig::default(), backend.clone());

    for _ in 0..10 {
        pipeline.ingest(DEVICE, &speech_frame());
    }
    for _ in 0..15 {
        pipeline.ingest(DEVICE, &silence_frame());
    }

    timeout(Duration::from_secs(1), backend.notify.notified())
        .await
        .expect("utterance was not processed");

    // Trailing silence must not produce a second flush.
    for _ in 0..10 {
        pipeline.ingest(DEVICE, &silence_frame());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let utterances = backend.utterances.lock();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].len(), 10 * FRAME_SAMPLES);
    drop(utterances);

    assert_eq!(pipeline.lane_count(), 1);
    pipeline.abandon(DEVICE);
    assert_eq!(pipeline.lane_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_flushes_when_the_device_goes_quiet() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = pipeline_with(VadConfig::default(), backend.clone());

    for _ in 0..3 {
        pipeline.ingest(DEVICE, &speech_frame());
    }

    // Before the deadline the sweep leaves the run open.
    tokio::time::advance(Duration::from_millis(1000)).await;
    pipeline.sweep_timeouts();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(backend.utterances.lock().is_empty());

    tokio::time::advance(Duration::from_millis(1100)).await;
    pipeline.sweep_timeouts();
    timeout(Duration::from_secs(1), backend.notify.notified())
        .await
        .expect("timeout flush did not happen");

    let utterances = backend.utterances.lock();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].len(), 3 * FRAME_SAMPLES);
}

#[tokio::test]
async fn any_positive_keeps_mixed_blocks_in_the_utterance() {
    let backend = Arc::new(RecordingBackend::default());
    let config = VadConfig {
        aggregation: AggregationPolicy::AnyPositive,
        silence_hang_blocks: 1,
        ..VadConfig::default()
    };
    let pipeline = pipeline_with(config, backend.clone());

    pipeline.ingest(DEVICE, &mixed_frame());
    pipeline.ingest(DEVICE, &silence_frame());

    timeout(Duration::from_secs(1), backend.notify.notified())
        .await
        .expect("mixed block did not open an utterance");
    assert_eq!(backend.utterances.lock()[0].len(), FRAME_SAMPLES);
}

#[tokio::test]
async fn all_positive_treats_mixed_blocks_as_silence() {
    let backend = Arc::new(RecordingBackend::default());
    let config = VadConfig {
        aggregation: AggregationPolicy::AllPositive,
        silence_hang_blocks: 1,
        ..VadConfig::default()
    };
    let pipeline = pipeline_with(config, backend.clone());

    for _ in 0..5 {
        pipeline.ingest(DEVICE, &mixed_frame());
    }
    pipeline.ingest(DEVICE, &silence_frame());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(backend.utterances.lock().is_empty());
}

#[tokio::test]
async fn disabling_capture_discards_partial_speech() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = pipeline_with(VadConfig::default(), backend.clone());

    for _ in 0..5 {
        pipeline.ingest(DEVICE, &speech_frame());
    }
    pipeline.set_capture(DEVICE, false, None);
    pipeline.set_capture(DEVICE, true, Some("auto".to_owned()));

    // Frames captured before the stop are gone; only silence follows, so
    // nothing can flush.
    for _ in 0..20 {
        pipeline.ingest(DEVICE, &silence_frame());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(backend.utterances.lock().is_empty());
}

#[tokio::test]
async fn second_utterance_is_dropped_while_first_still_processing() {
    let backend = Arc::new(StallingBackend::default());
    let pipeline = pipeline_with(VadConfig::default(), backend.clone());

    for _ in 0..5 {
        pipeline.ingest(DEVICE, &speech_frame());
    }
    for _ in 0..15 {
        pipeline.ingest(DEVICE, &silence_frame());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    for _ in 0..5 {
        pipeline.ingest(DEVICE, &speech_frame());
    }
    for _ in 0..15 {
        pipeline.ingest(DEVICE, &silence_frame());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The stalled backend still owns the processing slot, so the second
    // utterance was discarded instead of queued.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undecodable_frames_are_dropped_without_killing_the_lane() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = pipeline_with(VadConfig::default(), backend.clone());

    pipeline.ingest(DEVICE, &[0u8; 7]);
    for _ in 0..3 {
        pipeline.ingest(DEVICE, &speech_frame());
    }
    pipeline.ingest(DEVICE, b"garbage");
    for _ in 0..15 {
        pipeline.ingest(DEVICE, &silence_frame());
    }

    timeout(Duration::from_secs(1), backend.notify.notified())
        .await
        .expect("utterance was not processed");
    assert_eq!(backend.utterances.lock()[0].len(), 3 * FRAME_SAMPLES);
}
