//! Model lifecycle
//!
//! Acquires model artifacts (download, optional `.tgz` extraction, engine
//! load) and owns the `Unloaded -> Loaded | Failed` state machine.
//!
//! Acquisition never runs under the node lock. The lock is taken twice per
//! model spec: once to check the deferred-apply gate, once to commit the
//! outcome. A scoring request therefore never waits on a download.
//!
//! Once a working model is loaded, new model specs are logged and deferred to
//! the next process start; the model is never swapped underneath in-flight
//! scoring.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::engine::{InferenceEngine, ScoringModel};
use crate::error::AcquireError;
use crate::ports::ArtifactFetcher;
use crate::state::{EdgeState, SharedState};
use crate::twin::ModelSpec;

/// Archive suffixes that are unpacked into the working directory.
const ARCHIVE_SUFFIXES: &[&str] = &[".tgz", ".tar.gz"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    #[default]
    Unloaded,
    Loaded,
    Failed,
}

/// Current model status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub status: ModelStatus,
    pub model_name: Option<String>,
    pub model_path: Option<PathBuf>,
    pub label_path: Option<PathBuf>,
}

/// A freshly loaded model, not yet installed in the shared state.
pub struct LoadedModel {
    pub model_name: String,
    pub model_path: PathBuf,
    pub label_path: Option<PathBuf>,
    pub handle: Box<dyn ScoringModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_name", &self.model_name)
            .field("model_path", &self.model_path)
            .field("label_path", &self.label_path)
            .finish_non_exhaustive()
    }
}

/// Outcome of the deferred-apply gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Deferred { current: Option<String> },
}

pub struct ModelManager {
    engine: Arc<dyn InferenceEngine>,
    fetcher: Arc<dyn ArtifactFetcher>,
    work_dir: PathBuf,
    load_timeout: Duration,
}

impl ModelManager {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        fetcher: Arc<dyn ArtifactFetcher>,
        work_dir: impl Into<PathBuf>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            fetcher,
            work_dir: work_dir.into(),
            load_timeout,
        }
    }

    /// Apply only if no working model is loaded.
    pub fn admit(state: &EdgeState) -> Admission {
        if state.has_working_model() {
            Admission::Deferred {
                current: state.model.model_name.clone(),
            }
        } else {
            Admission::Proceed
        }
    }

    /// Run the full transition for one model spec and return the resulting status.
    pub async fn apply(&self, shared: &SharedState, spec: &ModelSpec) -> ModelStatus {
        {
            let state = shared.lock();
            if let Admission::Deferred { current } = Self::admit(&state) {
                warn!(
                    requested = %spec.model_name,
                    current = current.as_deref().unwrap_or(""),
                    "Model already loaded, update deferred to next start"
                );
                crate::metrics::MODEL_UPDATES_DEFERRED.inc();
                return state.model.status;
            }
        }

        info!(
            filename = %spec.filename,
            url = %spec.url,
            "📥 Received model update request"
        );
        let timer = crate::metrics::Timer::new();
        let outcome = self.acquire(spec).await;
        timer.observe_duration_seconds(&crate::metrics::MODEL_LOAD_LATENCY);

        let mut state = shared.lock();
        Self::commit(&mut state, spec, outcome)
    }

    /// Fetch, unpack and load a model without touching shared state.
    pub async fn acquire(&self, spec: &ModelSpec) -> Result<LoadedModel, AcquireError> {
        let secs = self.load_timeout.as_secs();
        tokio::time::timeout(self.load_timeout, self.acquire_unbounded(spec))
            .await
            .map_err(|_| AcquireError::TimedOut(secs))?
    }

    async fn acquire_unbounded(&self, spec: &ModelSpec) -> Result<LoadedModel, AcquireError> {
        let archive_name = single_file_name(&spec.filename)?;
        let model_rel = relative_path(&spec.model_name)?;
        let label_rel = spec.label_name.as_deref().map(relative_path).transpose()?;

        let bytes = self.fetcher.fetch(&spec.url).await?;
        info!(size = bytes.len(), "✅ Downloaded model artifact");

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let saved = self.work_dir.join(archive_name);
        tokio::fs::write(&saved, &bytes).await?;

        if is_archive(archive_name) {
            extract_archive(saved, self.work_dir.clone()).await?;
        }

        let model_path = self.work_dir.join(model_rel);
        let label_path = label_rel.map(|rel| self.work_dir.join(rel));
        info!(model_path = %model_path.display(), "Loading model");

        let engine = self.engine.clone();
        let (load_model, load_labels) = (model_path.clone(), label_path.clone());
        let handle = tokio::task::spawn_blocking(move || {
            engine.load(&load_model, load_labels.as_deref())
        })
        .await
        .map_err(|e| AcquireError::LoadRejected(format!("load task failed: {}", e)))?
        .map_err(|e| AcquireError::LoadRejected(e.to_string()))?;

        Ok(LoadedModel {
            model_name: spec.model_name.clone(),
            model_path,
            label_path,
            handle,
        })
    }

    /// Install an acquisition outcome. Must be called with the node lock held.
    ///
    /// A failure never touches an existing handle.
    pub fn commit(
        state: &mut EdgeState,
        spec: &ModelSpec,
        outcome: Result<LoadedModel, AcquireError>,
    ) -> ModelStatus {
        match outcome {
            Ok(loaded) if state.has_working_model() => {
                warn!(
                    model = %loaded.model_name,
                    "A model was installed while this one loaded, discarding"
                );
            }
            Ok(loaded) => {
                info!(model = %loaded.model_name, "✅ Model load succeeded");
                state.handle = Some(loaded.handle);
                state.model = ModelState {
                    status: ModelStatus::Loaded,
                    model_name: Some(loaded.model_name),
                    model_path: Some(loaded.model_path),
                    label_path: loaded.label_path,
                };
                crate::metrics::MODEL_LOADS.inc();
            }
            Err(e) => {
                error!(model = %spec.model_name, error = %e, "❌ Model load failed");
                state.model.status = ModelStatus::Failed;
                if !state.has_working_model() {
                    state.model.model_name = Some(spec.model_name.clone());
                }
                crate::metrics::MODEL_LOAD_FAILURES.inc();
            }
        }
        state.model.status
    }
}

fn is_archive(filename: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|suffix| filename.ends_with(suffix))
}

/// A bare file name with no directory part.
fn single_file_name(name: &str) -> Result<&str, AcquireError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(AcquireError::InvalidSpec(format!("not a plain file name: {:?}", name))),
    }
}

/// A relative path that stays inside the working directory.
fn relative_path(name: &str) -> Result<&Path, AcquireError> {
    let path = Path::new(name);
    let inside = !name.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if inside {
        Ok(path)
    } else {
        Err(AcquireError::InvalidSpec(format!("path escapes model directory: {:?}", name)))
    }
}

/// Unpack a gzip'd tarball next to itself and delete it.
async fn extract_archive(archive: PathBuf, into: PathBuf) -> Result<(), AcquireError> {
    tokio::task::spawn_blocking(move || -> Result<(), AcquireError> {
        let file = std::fs::File::open(&archive)?;
        let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tarball
            .unpack(&into)
            .map_err(|e| AcquireError::ExtractFailed(e.to_string()))?;
        std::fs::remove_file(&archive)?;
        info!(dir = %into.display(), "Extracted model archive");
        Ok(())
    })
    .await
    .map_err(|e| AcquireError::ExtractFailed(format!("extract task failed: {}", e)))?
}

// ============================================================================
// HTTP artifact fetcher
// ============================================================================

/// Downloads model artifacts over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AcquireError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AcquireError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AcquireError::DownloadFailed(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(AcquireError::DownloadFailed(format!(
                    "artifact too large: {} bytes",
                    len
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AcquireError::DownloadFailed(e.to_string()))?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(AcquireError::DownloadFailed(format!(
                "artifact too large: {} bytes",
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }
}
