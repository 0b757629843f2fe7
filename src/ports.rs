use async_trait::async_trait;

use crate::error::{AcquireError, TransportError, UploadError};
use crate::twin::{ConfigPatch, ReportedStatus, TelemetryMessage};

/// Inbound side of the twin: desired configuration.
#[async_trait]
pub trait PatchSource: Send {
    /// Full desired properties known at startup.
    async fn desired_properties(&mut self) -> Result<ConfigPatch, TransportError>;

    /// Wait for the next desired-properties patch.
    async fn next_patch(&mut self) -> Result<ConfigPatch, TransportError>;
}

/// Outbound side of the twin: reported status and telemetry.
#[async_trait]
pub trait TwinPublisher: Send + Sync {
    async fn publish_status(&self, status: &ReportedStatus) -> Result<(), TransportError>;
    async fn publish_telemetry(&self, message: &TelemetryMessage) -> Result<(), TransportError>;
}

/// Remote blob storage for frames worth keeping.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        payload: Vec<u8>,
        device_id: &str,
        timestamp: &str,
        extension: &str,
    ) -> Result<(), UploadError>;
}

/// Fetches model artifacts.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AcquireError>;
}
