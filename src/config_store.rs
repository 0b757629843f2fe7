use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::model_manager::{ModelManager, ModelState};
use crate::state::SharedState;
use crate::twin::ConfigPatch;

/// Live tunables driven by the twin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub telemetry_enabled: bool,
    pub annotate_on_score: bool,
    pub upload_interval_seconds: i64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            telemetry_enabled: false,
            annotate_on_score: false,
            upload_interval_seconds: 60,
        }
    }
}

impl Configuration {
    /// Merge the fields present in `patch`, returning the names of the fields
    /// that were written.
    pub fn merge(&mut self, patch: &ConfigPatch) -> Vec<&'static str> {
        let mut written = Vec::new();

        if let Some(enabled) = patch.send_telemetry {
            self.telemetry_enabled = enabled;
            written.push("telemetry_enabled");
        }

        if let Some(upload) = &patch.upload {
            match upload.interval_sec {
                Some(interval) if interval < 0 => {
                    warn!(interval, "Ignoring negative upload interval");
                }
                Some(interval) => {
                    self.upload_interval_seconds = interval;
                    written.push("upload_interval_seconds");
                }
                None => {}
            }
            if let Some(mark) = upload.inference_mark {
                self.annotate_on_score = mark;
                written.push("annotate_on_score");
            }
        }

        written
    }
}

/// Applies twin patches to the shared state.
pub struct ConfigStore {
    shared: Arc<SharedState>,
    models: Arc<ModelManager>,
}

impl ConfigStore {
    pub fn new(shared: Arc<SharedState>, models: Arc<ModelManager>) -> Self {
        Self { shared, models }
    }

    /// Apply one patch and return the model state that results from it.
    ///
    /// Configuration fields are merged in a single critical section. A model
    /// spec, if present, goes through the model manager, which takes the lock
    /// only for its admission check and its final state transition.
    pub async fn apply_patch(&self, patch: &ConfigPatch) -> ModelState {
        let written = {
            let mut state = self.shared.lock();
            state.configuration.merge(patch)
        };

        if written.is_empty() {
            debug!("Patch carried no configuration fields");
        } else {
            info!(fields = ?written, "Configuration updated");
        }

        if let Some(spec) = &patch.model {
            self.models.apply(&self.shared, spec).await;
        }

        crate::metrics::CONFIG_PATCHES_APPLIED.inc();
        self.model_state()
    }

    /// Copy of the live configuration for use outside the lock.
    pub fn snapshot(&self) -> Configuration {
        self.shared.lock().configuration.clone()
    }

    pub fn model_state(&self) -> ModelState {
        self.shared.lock().model.clone()
    }
}
