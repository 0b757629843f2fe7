//! Module twin payloads
//!
//! Wire shapes exchanged with the remote management plane: desired-property
//! patches coming in, reported status and telemetry going out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TransportError;
use crate::model_manager::{ModelState, ModelStatus};

/// One inbound partial configuration update.
///
/// Every field is optional; absent fields leave the live configuration alone.
/// Unknown keys such as `$version` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(rename = "send-telemetry", default, skip_serializing_if = "Option::is_none")]
    pub send_telemetry: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadPatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadPatch {
    #[serde(rename = "interval-sec", default, skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<i64>,

    #[serde(rename = "inference-mark", default, skip_serializing_if = "Option::is_none")]
    pub inference_mark: Option<bool>,
}

/// Where to fetch a model artifact and which files inside it to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub url: String,
    pub filename: String,
    /// Model file name inside the working directory
    #[serde(rename = "name")]
    pub model_name: String,
    /// Optional label file name inside the working directory
    #[serde(rename = "label", default, skip_serializing_if = "Option::is_none")]
    pub label_name: Option<String>,
}

impl ConfigPatch {
    pub fn from_slice(payload: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(payload).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, TransportError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.send_telemetry.is_none() && self.upload.is_none() && self.model.is_none()
    }
}

// ============================================================================
// Reported status
// ============================================================================

/// Status label as published in reported properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusLabel {
    Unknown,
    Initialized,
    ModelLoaded,
}

impl From<ModelStatus> for StatusLabel {
    fn from(status: ModelStatus) -> Self {
        match status {
            ModelStatus::Unloaded => StatusLabel::Initialized,
            ModelStatus::Loaded => StatusLabel::ModelLoaded,
            ModelStatus::Failed => StatusLabel::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub status: StatusLabel,
    pub model: String,
}

/// `{"current_status": {"status": ..., "model": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedStatus {
    pub current_status: CurrentStatus,
}

impl From<&ModelState> for ReportedStatus {
    fn from(state: &ModelState) -> Self {
        Self {
            current_status: CurrentStatus {
                status: state.status.into(),
                model: state.model_name.clone().unwrap_or_default(),
            },
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Per-label detection counts for one scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub timestamp: String,
    #[serde(rename = "totaldetection")]
    pub total_detections: usize,
    #[serde(rename = "detected")]
    pub counts_by_label: BTreeMap<String, usize>,
}
