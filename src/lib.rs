pub mod config;
pub mod config_store;
pub mod config_sync;
pub mod detection;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod model_manager;
pub mod onnx_engine;
pub mod ports;
pub mod scoring;
pub mod state;
pub mod telemetry;
pub mod throttle;
pub mod twin;
pub mod twin_transport;
pub mod upload;

// Re-export commonly used types for easier testing
pub use crate::config_store::{ConfigStore, Configuration};
pub use crate::config_sync::ConfigSyncLoop;
pub use crate::detection::{BoundingBox, Detection, ScoringResult};
pub use crate::engine::{DecodedImage, InferenceEngine, ScoringModel};
pub use crate::error::{AcquireError, EngineError, RejectReason, TransportError, UploadError};
pub use crate::model_manager::{ModelManager, ModelState, ModelStatus};
pub use crate::ports::{ArtifactFetcher, PatchSource, TwinPublisher, Uploader};
pub use crate::scoring::{Outcome, ScoringCoordinator};
pub use crate::state::SharedState;
pub use crate::throttle::UploadThrottler;
pub use crate::twin::{ConfigPatch, ModelSpec, ReportedStatus, TelemetryMessage, UploadPatch};
