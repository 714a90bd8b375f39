//! Audio ingest pipeline
//!
//! Turns the continuous per-device frame stream into discrete utterances:
//! decode, classify, segment, then hand the captured PCM to the reply
//! backend on a task of its own so classification never waits on remote
//! services. Each device gets one lane holding its codec, detector, and
//! speech state.

pub mod backend;
pub mod dispatch;

pub use backend::{
    BackendError, BackendResult, ChainBackend, LoopbackBackend, ReplyBackend, ReplyGenerator,
    SpeechRecognizer, SpeechSynthesizer, SynthesizedReply,
};
pub use dispatch::{DispatchError, OutboundSink, ReplyDispatcher, ReplyEvent};

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audio::{CodecError, CodecFactory, FrameCodec};
use super::session::SessionRegistry;
use super::vad::{DetectorFactory, VadConfig, VoiceActivityDetector, classify_block};

/// How often the sweeper looks for speech runs that went quiet.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Silence,
    Timeout,
}

struct UtteranceState {
    is_speaking: bool,
    silence_run: u32,
    last_speech_time: Instant,
    buffer: Vec<i16>,
}

impl UtteranceState {
    fn new() -> Self {
        Self {
            is_speaking: false,
            silence_run: 0,
            last_speech_time: Instant::now(),
            buffer: Vec::new(),
        }
    }
}

/// Per-device decode and segmentation state.
struct DeviceLane {
    codec: Box<dyn FrameCodec>,
    detector: Box<dyn VoiceActivityDetector>,
    utterance: UtteranceState,
    capture_enabled: bool,
    listen_mode: Option<String>,
    /// Held by the downstream task while an utterance is being processed.
    processing: Arc<tokio::sync::Mutex<()>>,
}

impl DeviceLane {
    fn new(codec: Box<dyn FrameCodec>, detector: Box<dyn VoiceActivityDetector>) -> Self {
        Self {
            codec,
            detector,
            utterance: UtteranceState::new(),
            capture_enabled: true,
            listen_mode: None,
            processing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// The segmentation engine shared by all transports.
pub struct AudioIngestPipeline {
    lanes: DashMap<String, Arc<Mutex<DeviceLane>>>,
    codec_factory: CodecFactory,
    detector_factory: DetectorFactory,
    backend: Arc<dyn ReplyBackend>,
    dispatcher: Arc<ReplyDispatcher>,
    sessions: Arc<SessionRegistry>,
    config: VadConfig,
}

impl AudioIngestPipeline {
    pub fn new(
        config: VadConfig,
        codec_factory: CodecFactory,
        detector_factory: DetectorFactory,
        backend: Arc<dyn ReplyBackend>,
        dispatcher: Arc<ReplyDispatcher>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            lanes: DashMap::new(),
            codec_factory,
            detector_factory,
            backend,
            dispatcher,
            sessions,
            config,
        }
    }

    /// Feed one encoded 60 ms frame from a device.
    ///
    /// Never blocks on downstream work and never fails the caller: bad
    /// frames are dropped with a warning.
    pub fn ingest(self: &Arc<Self>, device_id: &str, payload: &[u8]) {
        let lane = match self.lane(device_id) {
            Ok(lane) => lane,
            Err(err) => {
                warn!("Cannot open audio lane for {}: {}", device_id, err);
                return;
            }
        };
        let mut lane = lane.lock();
        if !lane.capture_enabled {
            return;
        }

        let pcm = match lane.codec.decode_frame(payload) {
            Ok(pcm) => pcm,
            Err(err) => {
                warn!("Dropping undecodable frame from {}: {}", device_id, err);
                return;
            }
        };

        let speaking = classify_block(lane.detector.as_mut(), &pcm, self.config.aggregation);
        if speaking {
            if !lane.utterance.is_speaking {
                lane.utterance.is_speaking = true;
                lane.utterance.buffer.clear();
                debug!("Speech started for {}", device_id);
            }
            lane.utterance.silence_run = 0;
            lane.utterance.last_speech_time = Instant::now();
            lane.utterance.buffer.extend_from_slice(&pcm);
        } else if lane.utterance.is_speaking {
            lane.utterance.silence_run += 1;
            if lane.utterance.silence_run >= self.config.silence_hang_blocks {
                self.flush_lane(device_id, &mut lane, FlushReason::Silence);
            }
        }
    }

    /// Close the lane's pending utterance and hand it downstream.
    ///
    /// Drop-newest backpressure: when the device's previous utterance is
    /// still processing, the new one is discarded rather than queued.
    fn flush_lane(self: &Arc<Self>, device_id: &str, lane: &mut DeviceLane, reason: FlushReason) {
        let utterance = mem::take(&mut lane.utterance.buffer);
        lane.utterance.is_speaking = false;
        lane.utterance.silence_run = 0;
        lane.detector.reset();
        if utterance.is_empty() {
            return;
        }

        let guard = match lane.processing.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    "Dropping utterance from {} ({} samples): previous one still processing",
                    device_id,
                    utterance.len()
                );
                return;
            }
        };

        info!(
            "Utterance closed for {}: {} samples, reason {:?}, mode {:?}",
            device_id,
            utterance.len(),
            reason,
            lane.listen_mode
        );

        let pipeline = Arc::clone(self);
        let device_id = device_id.to_owned();
        tokio::spawn(async move {
            pipeline.process_utterance(device_id, utterance, guard).await;
        });
    }

    async fn process_utterance(
        self: Arc<Self>,
        device_id: String,
        utterance: Vec<i16>,
        _processing: OwnedMutexGuard<()>,
    ) {
        let reply = match self.backend.process(&device_id, utterance).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Utterance processing failed for {}: {}", device_id, err);
                if let Some(session_id) = self.sessions.primary_session_for_device(&device_id) {
                    self.dispatcher
                        .report_error(&device_id, &session_id, &err.to_string())
                        .await;
                }
                return;
            }
        };

        // The device may have said goodbye while the backend was working.
        let Some(session_id) = self.sessions.primary_session_for_device(&device_id) else {
            debug!("Discarding reply for {}: no live session", device_id);
            return;
        };
        if let Err(err) = self.dispatcher.dispatch(&device_id, &session_id, reply).await {
            warn!("Reply dispatch to {} failed: {}", device_id, err);
        }
    }

    /// Flush lanes whose speech run has been silent past the absolute
    /// deadline. Runs from the sweeper, so it fires even when a device
    /// stops sending entirely.
    pub fn sweep_timeouts(self: &Arc<Self>) {
        let deadline = Duration::from_millis(self.config.utterance_timeout_ms);
        let lanes: Vec<(String, Arc<Mutex<DeviceLane>>)> = self
            .lanes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (device_id, lane) in lanes {
            let mut lane = lane.lock();
            if lane.utterance.is_speaking && lane.utterance.last_speech_time.elapsed() >= deadline {
                self.flush_lane(&device_id, &mut lane, FlushReason::Timeout);
            }
        }
    }

    /// Periodic timeout sweep until shutdown.
    pub async fn run_timeout_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep_timeouts(),
            }
        }
        debug!("Timeout sweeper stopped");
    }

    /// Capture-control hook for `listen` messages.
    ///
    /// Disabling capture discards any partially captured speech so it
    /// cannot flush later as a phantom utterance.
    pub fn set_capture(&self, device_id: &str, enabled: bool, mode: Option<String>) {
        let lane = match self.lane(device_id) {
            Ok(lane) => lane,
            Err(err) => {
                warn!("Cannot open audio lane for {}: {}", device_id, err);
                return;
            }
        };
        let mut lane = lane.lock();
        lane.capture_enabled = enabled;
        if let Some(mode) = mode {
            lane.listen_mode = Some(mode);
        }
        if !enabled {
            lane.utterance.buffer.clear();
            lane.utterance.is_speaking = false;
            lane.utterance.silence_run = 0;
            lane.detector.reset();
        }
        debug!(
            "Capture {} for {} (mode {:?})",
            if enabled { "enabled" } else { "disabled" },
            device_id,
            lane.listen_mode
        );
    }

    /// Drop all per-device state and cancel any reply stream in flight.
    /// Called when the device's last session or connection goes away.
    pub fn abandon(&self, device_id: &str) {
        self.dispatcher.cancel(device_id);
        if self.lanes.remove(device_id).is_some() {
            debug!("Abandoned audio lane for {}", device_id);
        }
    }

    /// Number of devices with live lane state.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane(&self, device_id: &str) -> Result<Arc<Mutex<DeviceLane>>, CodecError> {
        match self.lanes.entry(device_id.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let codec = (self.codec_factory)()?;
                let detector = (self.detector_factory)();
                let lane = Arc::new(Mutex::new(DeviceLane::new(codec, detector)));
                entry.insert(Arc::clone(&lane));
                Ok(lane)
            }
        }
    }
}
