//! The inference-cycle driver.
//!
//! A [`Pipeline`] owns one session: the ref id counter, the crop cache and the
//! latency history. The event gate lives behind an `Arc<Mutex<_>>` so the
//! timeout sweeper can share it. Cycles must be serialized by the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::crop::{CropCache, Evidence, ImageJpegEncoder, JpegEncode};
use crate::detect::{suppress, BoxDecoder, Detection, InferenceBackend, Normalizer, RefIdCounter};
use crate::epoch_ms;
use crate::events::{
    crop_topic, detection_topic, detections_payload, publish_state_changes, window_size_for,
    CropPayload, EventGate, EventSink, StateChange,
};
use crate::frame::RgbFrame;

/// Number of inference latencies averaged for the rolling window size.
pub const LATENCY_SAMPLES: usize = 16;

/// Rolling mean of the most recent inference latencies.
#[derive(Clone, Debug, Default)]
pub struct LatencyTracker {
    samples: VecDeque<f64>,
}

impl LatencyTracker {
    pub fn record(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        if self.samples.len() == LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Process-wide mutable state of one pipeline run.
#[derive(Debug)]
struct Session {
    ref_ids: RefIdCounter,
    crops: CropCache,
    latency: LatencyTracker,
    last_detections_empty: bool,
    last_crop_export_ms: Option<u64>,
}

impl Session {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            ref_ids: RefIdCounter::new(),
            crops: CropCache::new(config.cropping.crop_settings()),
            latency: LatencyTracker::default(),
            last_detections_empty: false,
            last_crop_export_ms: None,
        }
    }
}

/// What one cycle produced.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// Surviving detections in the public coordinate space.
    pub detections: Vec<Detection>,
    /// Rising edges raised by this cycle.
    pub changes: Vec<StateChange>,
    pub detections_published: bool,
    pub crops_published: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    decoder: BoxDecoder,
    normalizer: Normalizer,
    gate: Arc<Mutex<EventGate>>,
    sink: Arc<dyn EventSink>,
    encoder: Box<dyn JpegEncode>,
    session: Session,
    errors_left: u32,
    running: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        if config.model.boxes == 0 || config.model.classes == 0 {
            return Err(anyhow!("model layout must have at least one box and one class"));
        }
        if config.max_inference_errors == 0 {
            return Err(anyhow!("inference error budget must be greater than zero"));
        }
        let decoder = config.model.decoder();
        let normalizer = config.model.normalizer();
        let gate = Arc::new(Mutex::new(EventGate::new(config.gate)));
        let session = Session::new(&config);
        let errors_left = config.max_inference_errors;
        info!(
            "pipeline ready: {}x{} model, {} boxes, {} classes, {} mode",
            config.model.model_width,
            config.model.model_height,
            config.model.boxes,
            config.model.classes,
            config.gate.prioritize.as_str()
        );
        Ok(Self {
            config,
            decoder,
            normalizer,
            gate,
            sink,
            encoder: Box::new(ImageJpegEncoder),
            session,
            errors_left,
            running: true,
        })
    }

    pub fn with_encoder(mut self, encoder: Box<dyn JpegEncode>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The event gate, shared with the timeout sweeper.
    pub fn gate(&self) -> Arc<Mutex<EventGate>> {
        Arc::clone(&self.gate)
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn errors_left(&self) -> u32 {
        self.errors_left
    }

    /// Next ref id the decoder will hand out.
    pub fn next_ref_id(&self) -> u64 {
        self.session.ref_ids.peek()
    }

    pub fn record_latency(&mut self, latency_ms: f64) {
        self.session.latency.record(latency_ms);
    }

    pub fn average_latency(&self) -> Option<f64> {
        self.session.latency.average()
    }

    /// Rolling window size for the current latency history.
    pub fn window_size(&self) -> usize {
        window_size_for(self.config.gate.window_ms, self.session.latency.average())
    }

    /// Run one full inference cycle against `backend`.
    ///
    /// A failed preprocessing or inference job consumes one unit of the error
    /// budget and returns the error with nothing published.
    pub fn run_cycle(
        &mut self,
        backend: &mut dyn InferenceBackend,
        frame: Option<&RgbFrame>,
    ) -> Result<CycleReport> {
        self.ensure_running()?;

        if let Err(e) = backend.run_preprocessing() {
            return Err(self.record_failure("preprocessing", backend.name(), e));
        }
        let started = Instant::now();
        if let Err(e) = backend.run_inference() {
            return Err(self.record_failure("inference", backend.name(), e));
        }
        self.record_latency(started.elapsed().as_secs_f64() * 1000.0);
        self.errors_left = self.config.max_inference_errors;

        self.process_output(backend.output_tensor(), frame, epoch_ms())
    }

    /// Decode, suppress, normalize, gate and publish one output tensor.
    ///
    /// Crop evidence from the previous output is dropped first.
    pub fn process_output(
        &mut self,
        tensor: &[u8],
        frame: Option<&RgbFrame>,
        now_ms: u64,
    ) -> Result<CycleReport> {
        self.ensure_running()?;
        self.session.crops.reset();

        let decoded = self
            .decoder
            .decode(tensor, &mut self.session.ref_ids, now_ms);
        let mut detections = suppress(decoded, self.config.model.nms);
        self.normalizer.apply_all(&mut detections);

        let window_size = self.window_size();
        let changes = {
            let mut gate = self.lock_gate()?;
            let changes = gate.observe(&mut detections, now_ms, window_size);
            publish_state_changes(self.sink.as_ref(), &self.config.serial, &changes);
            changes
        };

        let detections_published = self.publish_detections(&detections);
        let crops_published = self.export_crops(&detections, frame, now_ms);

        debug!(
            "cycle: {} detections, {} rising, window {}",
            detections.len(),
            changes.len(),
            window_size
        );
        Ok(CycleReport {
            detections,
            changes,
            detections_published,
            crops_published,
        })
    }

    /// Crop evidence for a detection of the current cycle.
    pub fn evidence(&mut self, detection: &Detection, frame: Option<&RgbFrame>) -> Option<Arc<Evidence>> {
        self.session
            .crops
            .get_evidence(detection, frame, self.encoder.as_ref())
    }

    /// Drop all cached crop evidence.
    pub fn reset_crops(&mut self) {
        self.session.crops.reset();
    }

    /// Stop the pipeline and discard its session.
    pub fn stop(&mut self) {
        if self.running {
            info!("pipeline stopped");
        }
        self.running = false;
        self.clear_session();
    }

    /// Re-initialize the session and accept cycles again.
    pub fn restart(&mut self) {
        self.clear_session();
        self.errors_left = self.config.max_inference_errors;
        self.running = true;
        info!("pipeline restarted");
    }

    fn clear_session(&mut self) {
        self.session = Session::new(&self.config);
        match self.gate.lock() {
            Ok(mut gate) => gate.reset(),
            Err(_) => warn!("event gate lock poisoned; label table not cleared"),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(anyhow!("pipeline stopped; restart required"))
        }
    }

    fn lock_gate(&self) -> Result<MutexGuard<'_, EventGate>> {
        self.gate
            .lock()
            .map_err(|_| anyhow!("event gate lock poisoned"))
    }

    fn record_failure(&mut self, stage: &str, backend: &str, err: anyhow::Error) -> anyhow::Error {
        self.errors_left = self.errors_left.saturating_sub(1);
        warn!(
            "{} job failed on {} backend: {} ({} attempts left)",
            stage, backend, err, self.errors_left
        );
        if self.errors_left == 0 {
            warn!("too many inference errors; pipeline stopped");
            self.stop();
        }
        err.context(format!("{} job failed", stage))
    }

    /// Non-empty lists are always published; an empty list only once after a
    /// non-empty one.
    fn publish_detections(&mut self, detections: &[Detection]) -> bool {
        let empty = detections.is_empty();
        let publish = !empty || !self.session.last_detections_empty;
        self.session.last_detections_empty = empty;
        if !publish {
            return false;
        }

        let topic = detection_topic(&self.config.serial);
        let result = detections_payload(detections).and_then(|payload| self.sink.publish(&topic, &payload));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to publish {}: {}", topic, e);
                false
            }
        }
    }

    fn export_crops(&mut self, detections: &[Detection], frame: Option<&RgbFrame>, now_ms: u64) -> usize {
        let cropping = self.config.cropping;
        if !cropping.active || !cropping.mqtt_export || frame.is_none() {
            return 0;
        }

        let topic = crop_topic(&self.config.serial);
        let mut published = 0;
        for detection in detections {
            let throttled = self
                .session
                .last_crop_export_ms
                .map(|last| now_ms.saturating_sub(last) <= cropping.throttle_ms)
                .unwrap_or(false);
            if throttled {
                break;
            }
            let Some(evidence) = self.evidence(detection, frame) else {
                continue;
            };
            let payload = CropPayload::new(detection, &evidence);
            match payload.to_value().and_then(|value| self.sink.publish(&topic, &value)) {
                Ok(()) => {
                    self.session.last_crop_export_ms = Some(now_ms);
                    published += 1;
                }
                Err(e) => warn!("failed to publish {}: {}", topic, e),
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ReplayBackend, ReplayStep};
    use crate::events::{LabelState, MemorySink, Prioritize};

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.model.boxes = 2;
        config.model.classes = 2;
        config.model.quant = 0.01;
        config.model.nms = 0.5;
        config.model.labels = vec!["cat".into(), "person".into()];
        config.gate.prioritize = Prioritize::Speed;
        config.serial = "SERIAL".into();
        config
    }

    /// One row: center (50,50) size (20,20) in [0,100] units of 0.01.
    fn row(cx: u8, cy: u8, w: u8, h: u8, objectness: u8, classes: [u8; 2]) -> Vec<u8> {
        vec![cx, cy, w, h, objectness, classes[0], classes[1]]
    }

    fn tensor(rows: &[Vec<u8>]) -> Vec<u8> {
        rows.concat()
    }

    fn pipeline() -> (Pipeline, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let pipeline = Pipeline::new(config(), sink.clone()).unwrap();
        (pipeline, sink)
    }

    #[test]
    fn latency_tracker_keeps_last_samples() {
        let mut tracker = LatencyTracker::default();
        assert_eq!(tracker.average(), None);
        for _ in 0..LATENCY_SAMPLES {
            tracker.record(100.0);
        }
        tracker.record(260.0);
        assert_eq!(tracker.len(), LATENCY_SAMPLES);
        assert_eq!(tracker.average(), Some(110.0));
        tracker.record(f64::NAN);
        assert_eq!(tracker.len(), LATENCY_SAMPLES);
    }

    #[test]
    fn window_size_follows_recorded_latency() {
        let (mut pipeline, _) = pipeline();
        assert_eq!(pipeline.window_size(), 16);
        for _ in 0..4 {
            pipeline.record_latency(250.0);
        }
        assert_eq!(pipeline.window_size(), 4);
    }

    #[test]
    fn cycle_publishes_rising_event_and_detections() {
        let (mut pipeline, sink) = pipeline();
        let data = tensor(&[
            row(50, 50, 20, 20, 100, [0, 90]),
            row(10, 10, 4, 4, 10, [90, 0]),
        ]);
        let report = pipeline.process_output(&data, None, 1_000).unwrap();

        assert_eq!(report.detections.len(), 1);
        let det = &report.detections[0];
        assert_eq!(det.label, "person");
        assert_eq!(det.confidence, 90.0);
        assert_eq!(det.state, Some(true));
        assert!(report.detections_published);

        let topics = sink.topics();
        assert_eq!(topics, vec!["event/SERIAL/person/true", "detection/SERIAL"]);
        let published = sink.published();
        assert_eq!(published[1].payload["detections"][0]["state"], true);
    }

    #[test]
    fn empty_detection_list_is_published_once() {
        let (mut pipeline, sink) = pipeline();
        let nothing = tensor(&[row(0, 0, 0, 0, 0, [0, 0]), row(0, 0, 0, 0, 0, [0, 0])]);
        let something = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);

        assert!(pipeline.process_output(&nothing, None, 0).unwrap().detections_published);
        assert!(!pipeline.process_output(&nothing, None, 1).unwrap().detections_published);
        assert!(pipeline.process_output(&something, None, 2).unwrap().detections_published);
        assert!(pipeline.process_output(&nothing, None, 3).unwrap().detections_published);
        assert!(!pipeline.process_output(&nothing, None, 4).unwrap().detections_published);

        assert_eq!(sink.with_prefix("detection/").len(), 3);
    }

    #[test]
    fn ref_ids_persist_across_cycles() {
        let (mut pipeline, _) = pipeline();
        let data = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);
        let first = pipeline.process_output(&data, None, 0).unwrap();
        let second = pipeline.process_output(&data, None, 1).unwrap();
        assert_eq!(first.detections[0].ref_id, Some(1));
        assert_eq!(second.detections[0].ref_id, Some(2));
    }

    #[test]
    fn failures_consume_budget_and_stop_pipeline() {
        let (mut pipeline, sink) = pipeline();
        let mut backend = ReplayBackend::new(vec![
            ReplayStep::InferenceFailure,
            ReplayStep::PreprocessingFailure,
            ReplayStep::InferenceFailure,
            ReplayStep::InferenceFailure,
            ReplayStep::InferenceFailure,
        ]);
        for left in (0..5).rev() {
            assert!(pipeline.run_cycle(&mut backend, None).is_err());
            assert_eq!(pipeline.errors_left(), left);
        }
        assert!(!pipeline.is_running());
        assert!(sink.published().is_empty());

        backend.push(ReplayStep::Tensor(vec![0; 14]));
        assert!(pipeline.run_cycle(&mut backend, None).is_err());
        assert_eq!(backend.remaining(), 1);

        pipeline.restart();
        assert!(pipeline.is_running());
        assert_eq!(pipeline.errors_left(), 5);
        assert!(pipeline.run_cycle(&mut backend, None).is_ok());
    }

    #[test]
    fn success_refills_error_budget() {
        let (mut pipeline, _) = pipeline();
        let mut backend = ReplayBackend::new(vec![
            ReplayStep::InferenceFailure,
            ReplayStep::InferenceFailure,
            ReplayStep::Tensor(vec![0; 14]),
        ]);
        let _ = pipeline.run_cycle(&mut backend, None);
        let _ = pipeline.run_cycle(&mut backend, None);
        assert_eq!(pipeline.errors_left(), 3);
        pipeline.run_cycle(&mut backend, None).unwrap();
        assert_eq!(pipeline.errors_left(), 5);
        assert_eq!(pipeline.average_latency().map(|avg| avg >= 0.0), Some(true));
    }

    #[test]
    fn stop_clears_session_state() {
        let (mut pipeline, _) = pipeline();
        let data = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);
        pipeline.process_output(&data, None, 0).unwrap();
        assert_eq!(pipeline.next_ref_id(), 2);

        pipeline.stop();
        assert!(pipeline.process_output(&data, None, 1).is_err());
        pipeline.restart();
        assert_eq!(pipeline.next_ref_id(), 1);
        assert_eq!(pipeline.gate().lock().unwrap().label_count(), 0);

        pipeline.process_output(&data, None, 2).unwrap();
        assert_eq!(
            pipeline.gate().lock().unwrap().state_of("person"),
            Some(LabelState::High)
        );
    }

    #[test]
    fn crops_are_exported_with_throttle() {
        let mut config = config();
        config.cropping.active = true;
        config.cropping.mqtt_export = true;
        config.cropping.throttle_ms = 500;
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = Pipeline::new(config, sink.clone()).unwrap();
        let frame = RgbFrame::new(vec![128; 64 * 48 * 3], 64, 48).unwrap();
        let data = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);

        assert_eq!(pipeline.process_output(&data, Some(&frame), 1_000).unwrap().crops_published, 1);
        assert_eq!(pipeline.process_output(&data, Some(&frame), 1_200).unwrap().crops_published, 0);
        assert_eq!(pipeline.process_output(&data, Some(&frame), 1_501).unwrap().crops_published, 1);
        assert_eq!(pipeline.process_output(&data, None, 3_000).unwrap().crops_published, 0);

        let crops = sink.with_prefix("crop/");
        assert_eq!(crops.len(), 2);
        assert_eq!(crops[0].payload["label"], "person");
        assert!(crops[0].payload["image"].as_str().unwrap().starts_with("/9j/"));
    }

    #[test]
    fn evidence_is_stable_within_a_cycle() {
        let mut config = config();
        config.cropping.active = true;
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = Pipeline::new(config, sink).unwrap();
        let frame = RgbFrame::new(vec![200; 32 * 32 * 3], 32, 32).unwrap();
        let data = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);

        let report = pipeline.process_output(&data, Some(&frame), 0).unwrap();
        let det = &report.detections[0];
        let first = pipeline.evidence(det, Some(&frame)).unwrap();
        let second = pipeline.evidence(det, Some(&frame)).unwrap();
        assert_eq!(first.jpeg, second.jpeg);

        pipeline.reset_crops();
        let frameless = pipeline.evidence(det, None);
        assert!(frameless.is_none());
    }

    #[test]
    fn crop_cache_is_reset_only_when_new_output_arrives() {
        let mut config = config();
        config.cropping.active = true;
        let mut pipeline = Pipeline::new(config, Arc::new(MemorySink::new())).unwrap();
        let frame = RgbFrame::new(vec![200; 32 * 32 * 3], 32, 32).unwrap();
        let data = tensor(&[row(50, 50, 20, 20, 100, [0, 90]), row(0, 0, 0, 0, 0, [0, 0])]);

        let report = pipeline.process_output(&data, Some(&frame), 0).unwrap();
        let det = report.detections[0].clone();
        assert!(pipeline.evidence(&det, Some(&frame)).is_some());

        let mut backend = ReplayBackend::new(vec![
            ReplayStep::InferenceFailure,
            ReplayStep::Tensor(vec![0; 14]),
        ]);
        assert!(pipeline.run_cycle(&mut backend, None).is_err());
        assert!(pipeline.evidence(&det, None).is_some());

        assert!(pipeline.run_cycle(&mut backend, None).is_ok());
        assert!(pipeline.evidence(&det, None).is_none());
    }
}
