use serde::{Deserialize, Serialize};

/// Pixel-space bounding box of a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Build a box from corner coordinates.
    pub fn from_corners(xmin: i32, ymin: i32, xmax: i32, ymax: i32) -> Self {
        Self {
            left: xmin,
            top: ymin,
            width: xmax - xmin,
            height: ymax - ymin,
        }
    }
}

/// One labeled object found by a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in (0, 1]
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Encoded image with bounding boxes drawn on it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedImage {
    pub bytes: Vec<u8>,
    /// File extension of the encoding, e.g. "bmp"
    pub extension: String,
}

/// Output of one scoring pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringResult {
    pub detections: Vec<Detection>,
    pub annotated: Option<AnnotatedImage>,
}

impl ScoringResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

// ============================================================================
// HTTP response shape
// ============================================================================

/// `{"inferences": [...]}` body returned by `POST /score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub inferences: Vec<InferenceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub entity: Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub tag: Tag,
    #[serde(rename = "box")]
    pub bbox: WireBox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub value: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBox {
    pub l: i32,
    pub t: i32,
    pub w: i32,
    pub h: i32,
}

impl From<&Detection> for InferenceEntry {
    fn from(detection: &Detection) -> Self {
        Self {
            kind: "entity".to_string(),
            entity: Entity {
                tag: Tag {
                    value: detection.label.clone(),
                    confidence: detection.confidence,
                },
                bbox: WireBox {
                    l: detection.bbox.left,
                    t: detection.bbox.top,
                    w: detection.bbox.width,
                    h: detection.bbox.height,
                },
            },
        }
    }
}

impl From<&[Detection]> for InferenceResponse {
    fn from(detections: &[Detection]) -> Self {
        Self {
            inferences: detections.iter().map(InferenceEntry::from).collect(),
        }
    }
}
