use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

use crate::detection::Detection;
use crate::twin::TelemetryMessage;

/// Summarize one scoring pass as per-label counts.
pub fn aggregate(detections: &[Detection], at: DateTime<Utc>) -> TelemetryMessage {
    let mut counts_by_label = BTreeMap::new();
    for detection in detections {
        *counts_by_label.entry(detection.label.clone()).or_insert(0) += 1;
    }

    TelemetryMessage {
        timestamp: at.to_rfc3339_opts(SecondsFormat::Micros, true),
        total_detections: detections.len(),
        counts_by_label,
    }
}
