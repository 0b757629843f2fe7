//! Upload throttling
//!
//! At most one upload per configured interval. The last-detection timestamp
//! is read while the node lock is held and advanced after it is released, so
//! it is a lock-free atomic rather than another field of the shared state.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ports::Uploader;

/// 2000-01-01T00:00:00Z, so the first detection after start is always eligible.
const EPOCH_MICROS: i64 = 946_684_800_000_000;

/// True when more than `interval_secs` has elapsed.
pub fn should_upload(elapsed_secs: f64, interval_secs: i64) -> bool {
    elapsed_secs > interval_secs as f64
}

/// Blob name timestamp, `YYYYMMDDHHMMSSffffff`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%6f").to_string()
}

pub struct UploadThrottler {
    last_detection: AtomicI64,
    uploader: Option<Arc<dyn Uploader>>,
    device_id: String,
}

impl UploadThrottler {
    pub fn new(uploader: Option<Arc<dyn Uploader>>, device_id: impl Into<String>) -> Self {
        Self {
            last_detection: AtomicI64::new(EPOCH_MICROS),
            uploader,
            device_id: device_id.into(),
        }
    }

    pub fn last_detection(&self) -> DateTime<Utc> {
        let micros = self.last_detection.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or_default()
    }

    /// Advance the last-detection timestamp from `prev` to `now`.
    ///
    /// Returns true if this caller won the swap, i.e. no other pass has
    /// recorded a detection since `prev` was read. Losers still move the
    /// timestamp forward but must not upload.
    pub fn record_detection(&self, prev: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let prev = prev.timestamp_micros();
        let now = now.timestamp_micros();
        match self
            .last_detection
            .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                self.last_detection.fetch_max(now, Ordering::AcqRel);
                false
            }
        }
    }

    /// Hand a payload to the uploader. Failures are logged and swallowed.
    pub async fn forward(&self, payload: Vec<u8>, extension: &str, at: DateTime<Utc>) {
        let Some(uploader) = &self.uploader else {
            debug!("No blob storage configured, skipping upload");
            return;
        };

        let timestamp = format_timestamp(at);
        match uploader
            .upload(payload, &self.device_id, &timestamp, extension)
            .await
        {
            Ok(()) => {
                info!(device = %self.device_id, %timestamp, extension, "📤 Uploaded frame");
                crate::metrics::UPLOADS.inc();
            }
            Err(e) => {
                warn!(error = %e, "Frame upload failed");
                crate::metrics::UPLOAD_FAILURES.inc();
            }
        }
    }
}
