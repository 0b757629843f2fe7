//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use edge_inference_node::detection::{BoundingBox, Detection, ScoringResult};
use edge_inference_node::engine::{self, DecodedImage, InferenceEngine, ScoringModel};
use edge_inference_node::error::{AcquireError, EngineError, TransportError, UploadError};
use edge_inference_node::ports::{ArtifactFetcher, PatchSource, TwinPublisher, Uploader};
use edge_inference_node::twin::{ConfigPatch, ModelSpec, ReportedStatus, TelemetryMessage};
use edge_inference_node::{
    ConfigStore, Configuration, ModelManager, ScoringCoordinator, SharedState, UploadThrottler,
};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

pub const DEVICE_ID: &str = "test-device";

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn detection(label: &str) -> Detection {
    Detection::new(label, 0.9, BoundingBox::from_corners(1, 1, 10, 10))
}

pub fn model_spec(name: &str) -> ModelSpec {
    ModelSpec {
        url: format!("http://models.local/{}", name),
        filename: name.to_string(),
        model_name: name.to_string(),
        label_name: None,
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Parks fakes mid-call so tests can observe what stays available meanwhile.
/// Open by default.
pub struct Gate {
    open: watch::Sender<bool>,
    entered: Notify,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            open: watch::channel(true).0,
            entered: Notify::new(),
        }
    }
}

impl Gate {
    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Resolves once some call is parked at the gate.
    pub async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("nothing reached the gate");
    }

    async fn pass(&self) {
        if *self.open.borrow() {
            return;
        }
        self.entered.notify_one();
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Counters shared between a fake engine and every model it loads.
#[derive(Default)]
pub struct EngineStats {
    pub loads: AtomicUsize,
    pub score_calls: AtomicUsize,
    pub fail_loads: AtomicBool,
    /// Answer every pass with one detection labelled after the annotate flag
    /// the model was called with.
    pub echo_annotate: AtomicBool,
    pub detections: Mutex<Vec<Detection>>,
}

impl EngineStats {
    pub fn set_detections(&self, detections: Vec<Detection>) {
        *self.detections.lock().unwrap() = detections;
    }

    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    pub stats: Arc<EngineStats>,
}

impl InferenceEngine for FakeEngine {
    fn load(&self, model_path: &Path, _label_path: Option<&Path>) -> Result<Box<dyn ScoringModel>, EngineError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_loads.load(Ordering::SeqCst) {
            return Err(EngineError::Topology("expected a single input".into()));
        }
        if !model_path.exists() {
            return Err(EngineError::Load(format!("missing {}", model_path.display())));
        }
        Ok(Box::new(FakeModel {
            stats: self.stats.clone(),
        }))
    }
}

struct FakeModel {
    stats: Arc<EngineStats>,
}

impl ScoringModel for FakeModel {
    fn score(&mut self, image: &DecodedImage, annotate: bool) -> Result<ScoringResult, EngineError> {
        self.stats.score_calls.fetch_add(1, Ordering::SeqCst);
        let detections = if self.stats.echo_annotate.load(Ordering::SeqCst) {
            vec![detection(if annotate { "annotated" } else { "plain" })]
        } else {
            self.stats.detections.lock().unwrap().clone()
        };
        let annotated = if annotate && !detections.is_empty() {
            Some(engine::annotate(&image.pixels, &detections)?)
        } else {
            None
        };
        Ok(ScoringResult { detections, annotated })
    }
}

pub struct FakeFetcher {
    pub artifact: Vec<u8>,
    pub gate: Gate,
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, AcquireError> {
        self.gate.pass().await;
        Ok(self.artifact.clone())
    }
}

// ============================================================================
// Twin and upload
// ============================================================================

#[derive(Default)]
pub struct RecordingPublisher {
    pub statuses: Mutex<Vec<ReportedStatus>>,
    pub telemetry: Mutex<Vec<TelemetryMessage>>,
    pub telemetry_gate: Gate,
}

impl RecordingPublisher {
    pub fn statuses(&self) -> Vec<ReportedStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryMessage> {
        self.telemetry.lock().unwrap().clone()
    }
}

#[async_trait]
impl TwinPublisher for RecordingPublisher {
    async fn publish_status(&self, status: &ReportedStatus) -> Result<(), TransportError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn publish_telemetry(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        self.telemetry_gate.pass().await;
        self.telemetry.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub size: usize,
    pub device_id: String,
    pub timestamp: String,
    pub extension: String,
}

#[derive(Default)]
pub struct RecordingUploader {
    pub uploads: Mutex<Vec<RecordedUpload>>,
    pub gate: Gate,
}

impl RecordingUploader {
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(
        &self,
        payload: Vec<u8>,
        device_id: &str,
        timestamp: &str,
        extension: &str,
    ) -> Result<(), UploadError> {
        self.gate.pass().await;
        self.uploads.lock().unwrap().push(RecordedUpload {
            size: payload.len(),
            device_id: device_id.to_string(),
            timestamp: timestamp.to_string(),
            extension: extension.to_string(),
        });
        Ok(())
    }
}

/// Patch source fed from a channel. A closed channel is a lost transport.
pub struct ChannelPatchSource {
    pub initial: ConfigPatch,
    pub patches: mpsc::Receiver<Result<ConfigPatch, TransportError>>,
}

#[async_trait]
impl PatchSource for ChannelPatchSource {
    async fn desired_properties(&mut self) -> Result<ConfigPatch, TransportError> {
        Ok(self.initial.clone())
    }

    async fn next_patch(&mut self) -> Result<ConfigPatch, TransportError> {
        match self.patches.recv().await {
            Some(next) => next,
            None => Err(TransportError::Fatal("channel closed".into())),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A fully wired node with fakes at every port.
pub struct Harness {
    pub shared: Arc<SharedState>,
    pub store: Arc<ConfigStore>,
    pub models: Arc<ModelManager>,
    pub stats: Arc<EngineStats>,
    pub fetcher: Arc<FakeFetcher>,
    pub publisher: Arc<RecordingPublisher>,
    pub uploader: Arc<RecordingUploader>,
    pub scoring: Arc<ScoringCoordinator>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(configuration: Configuration) -> Self {
        Self::with_artifact(configuration, b"fake-model".to_vec())
    }

    pub fn with_artifact(configuration: Configuration, artifact: Vec<u8>) -> Self {
        Self::build(configuration, artifact, Duration::from_secs(10))
    }

    pub fn with_load_timeout(configuration: Configuration, load_timeout: Duration) -> Self {
        Self::build(configuration, b"fake-model".to_vec(), load_timeout)
    }

    fn build(configuration: Configuration, artifact: Vec<u8>, load_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(EngineStats::default());
        let shared = Arc::new(SharedState::new(configuration));
        let fetcher = Arc::new(FakeFetcher {
            artifact,
            gate: Gate::default(),
        });

        let models = Arc::new(ModelManager::new(
            Arc::new(FakeEngine { stats: stats.clone() }),
            fetcher.clone(),
            dir.path().join("model"),
            load_timeout,
        ));
        let store = Arc::new(ConfigStore::new(shared.clone(), models.clone()));

        let publisher = Arc::new(RecordingPublisher::default());
        let uploader = Arc::new(RecordingUploader::default());
        let throttler = Arc::new(UploadThrottler::new(
            Some(uploader.clone() as Arc<dyn Uploader>),
            DEVICE_ID,
        ));
        let scoring = Arc::new(ScoringCoordinator::new(
            shared.clone(),
            throttler,
            Some(publisher.clone() as Arc<dyn TwinPublisher>),
        ));

        Self {
            shared,
            store,
            models,
            stats,
            fetcher,
            publisher,
            uploader,
            scoring,
            dir,
        }
    }

    /// Load a model through the regular patch path.
    pub async fn load_model(&self, name: &str) {
        let patch = ConfigPatch {
            model: Some(model_spec(name)),
            ..Default::default()
        };
        self.store.apply_patch(&patch).await;
    }
}
