//! Scoring request coordinator
//!
//! One pass per `POST /score`: decode, score under the node lock, then
//! publish telemetry and maybe upload once the lock is released.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config_store::Configuration;
use crate::detection::ScoringResult;
use crate::engine::decode_image;
use crate::error::RejectReason;
use crate::ports::TwinPublisher;
use crate::state::SharedState;
use crate::telemetry;
use crate::throttle::{should_upload, UploadThrottler};

/// Result of one scoring request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Detected(ScoringResult),
    Empty,
    Rejected(RejectReason),
}

/// What the critical section hands back to the async side.
struct ScoredPass {
    raw: Vec<u8>,
    extension: String,
    prev: DateTime<Utc>,
    now: DateTime<Utc>,
    configuration: Configuration,
    result: ScoringResult,
}

pub struct ScoringCoordinator {
    shared: Arc<SharedState>,
    throttler: Arc<UploadThrottler>,
    publisher: Option<Arc<dyn TwinPublisher>>,
}

impl ScoringCoordinator {
    pub fn new(
        shared: Arc<SharedState>,
        throttler: Arc<UploadThrottler>,
        publisher: Option<Arc<dyn TwinPublisher>>,
    ) -> Self {
        Self {
            shared,
            throttler,
            publisher,
        }
    }

    pub async fn handle_score(&self, raw: Vec<u8>) -> Outcome {
        let timer = crate::metrics::Timer::new();
        crate::metrics::SCORE_REQUESTS.inc();

        let outcome = match self.score_locked(raw).await {
            Ok(pass) => self.finish(pass).await,
            Err(reason) => {
                warn!(error = %reason, "Scoring request rejected");
                crate::metrics::SCORE_REJECTED.inc();
                Outcome::Rejected(reason)
            }
        };

        timer.observe_duration_seconds(&crate::metrics::SCORE_LATENCY);
        outcome
    }

    /// Decode, then run the critical section on the blocking pool.
    async fn score_locked(&self, raw: Vec<u8>) -> Result<ScoredPass, RejectReason> {
        let shared = self.shared.clone();
        let throttler = self.throttler.clone();

        tokio::task::spawn_blocking(move || -> Result<ScoredPass, RejectReason> {
            let image = decode_image(&raw).map_err(|e| RejectReason::Decode(e.to_string()))?;

            let mut state = shared.lock();
            let now = Utc::now();
            let prev = throttler.last_detection();
            let configuration = state.configuration.clone();

            let result = match state.handle.as_mut() {
                Some(model) => model
                    .score(&image, configuration.annotate_on_score)
                    .map_err(|e| RejectReason::Engine(e.to_string()))?,
                None => {
                    debug!("No model loaded, returning empty result");
                    ScoringResult::empty()
                }
            };
            drop(state);

            Ok(ScoredPass {
                raw,
                extension: image.extension,
                prev,
                now,
                configuration,
                result,
            })
        })
        .await
        .map_err(|e| RejectReason::Internal(format!("scoring task failed: {}", e)))?
    }

    /// Everything after the lock: telemetry, then the upload decision.
    async fn finish(&self, pass: ScoredPass) -> Outcome {
        let ScoredPass {
            raw,
            extension,
            prev,
            now,
            configuration,
            result,
        } = pass;

        if configuration.telemetry_enabled {
            self.publish_telemetry(&result, now).await;
        }

        if result.is_empty() {
            return Outcome::Empty;
        }

        crate::metrics::SCORE_DETECTIONS.inc_by(result.detections.len() as u64);
        let elapsed = (now - prev).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0;
        let won = self.throttler.record_detection(prev, now);

        if should_upload(elapsed, configuration.upload_interval_seconds) {
            if won {
                let (payload, ext) = match (&result.annotated, configuration.annotate_on_score) {
                    (Some(annotated), true) => (annotated.bytes.clone(), annotated.extension.clone()),
                    _ => (raw, extension),
                };
                info!(
                    detections = result.detections.len(),
                    elapsed_secs = elapsed,
                    "Upload interval elapsed, forwarding frame"
                );
                self.throttler.forward(payload, &ext, now).await;
            } else {
                debug!("Another request recorded this detection burst first, skipping upload");
            }
        }

        Outcome::Detected(result)
    }

    async fn publish_telemetry(&self, result: &ScoringResult, now: DateTime<Utc>) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let message = telemetry::aggregate(&result.detections, now);
        match publisher.publish_telemetry(&message).await {
            Ok(()) => crate::metrics::TELEMETRY_PUBLISHED.inc(),
            Err(e) => warn!(error = %e, "Failed to publish telemetry"),
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }
}
