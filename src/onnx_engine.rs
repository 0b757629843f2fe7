//! ONNX Runtime engine adapter
//!
//! Runs SSD-style detectors: one NCHW image input, one `[1, 1, N, 7]` output
//! of `[image_id, label, conf, xmin, ymin, xmax, ymax]` rows with normalized
//! coordinates. A row with a negative image id terminates the list.

use image::imageops::FilterType;
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info};

use crate::detection::{BoundingBox, Detection, ScoringResult};
use crate::engine::{annotate, DecodedImage, InferenceEngine, ScoringModel};
use crate::error::EngineError;

const ROW_WIDTH: usize = 7;

/// Engine input geometry and detection threshold.
#[derive(Debug, Clone, Copy)]
pub struct OnnxEngineConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub intra_threads: usize,
}

impl Default for OnnxEngineConfig {
    fn default() -> Self {
        Self {
            input_width: 300,
            input_height: 300,
            confidence_threshold: 0.5,
            intra_threads: 4,
        }
    }
}

pub struct OnnxEngine {
    config: OnnxEngineConfig,
}

impl OnnxEngine {
    pub fn new(config: OnnxEngineConfig) -> Self {
        Self { config }
    }
}

impl InferenceEngine for OnnxEngine {
    fn load(&self, model_path: &Path, label_path: Option<&Path>) -> Result<Box<dyn ScoringModel>, EngineError> {
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(self.config.intra_threads))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| EngineError::Load(e.to_string()))?;

        if session.inputs.len() != 1 {
            return Err(EngineError::Topology(format!(
                "expected 1 input, model has {}",
                session.inputs.len()
            )));
        }
        if session.outputs.len() != 1 {
            return Err(EngineError::Topology(format!(
                "expected 1 output, model has {}",
                session.outputs.len()
            )));
        }

        let labels = match label_path {
            Some(path) => read_labels(path)?,
            None => Vec::new(),
        };

        info!(
            model = %model_path.display(),
            input = %session.inputs[0].name,
            labels = labels.len(),
            "✅ ONNX model loaded"
        );

        Ok(Box::new(OnnxModel {
            session,
            labels,
            config: self.config,
        }))
    }
}

/// One label per line; only the first comma-separated field is used.
fn read_labels(path: &Path) -> Result<Vec<String>, EngineError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Load(format!("label file {}: {}", path.display(), e)))?;
    Ok(parse_labels(&text))
}

fn parse_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split(',').next().unwrap_or("").trim().to_string())
        .collect()
}

pub struct OnnxModel {
    session: Session,
    labels: Vec<String>,
    config: OnnxEngineConfig,
}

/// Resize to the network input and lay out as planar (CHW) raw 0-255 floats.
fn planar_tensor(pixels: &RgbImage, width: u32, height: u32) -> Vec<f32> {
    let resized = image::imageops::resize(pixels, width, height, FilterType::Triangle);

    let plane = (width * height) as usize;
    let mut input = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            input[c * plane + offset] = pixel[c] as f32;
        }
    }
    input
}

impl ScoringModel for OnnxModel {
    fn score(&mut self, image: &DecodedImage, annotate_image: bool) -> Result<ScoringResult, EngineError> {
        let input = planar_tensor(&image.pixels, self.config.input_width, self.config.input_height);
        let shape = vec![
            1i64,
            3,
            self.config.input_height as i64,
            self.config.input_width as i64,
        ];
        let tensor = Tensor::from_array((shape, input)).map_err(|e| EngineError::Execution(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| EngineError::Execution(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Execution(e.to_string()))?;

        let detections = parse_detections(
            data,
            &self.labels,
            self.config.confidence_threshold,
            image.width(),
            image.height(),
        );
        debug!(count = detections.len(), "Scored image");

        let annotated = if annotate_image && !detections.is_empty() {
            Some(annotate(&image.pixels, &detections)?)
        } else {
            None
        };

        Ok(ScoringResult { detections, annotated })
    }
}

/// Decode SSD output rows into pixel-space detections.
fn parse_detections(
    data: &[f32],
    labels: &[String],
    threshold: f32,
    width: u32,
    height: u32,
) -> Vec<Detection> {
    let (w, h) = (width as f32, height as f32);
    data.chunks_exact(ROW_WIDTH)
        .take_while(|row| row[0] >= 0.0)
        .filter(|row| row[2] > threshold)
        .map(|row| {
            let class_id = row[1] as usize;
            let label = labels
                .get(class_id)
                .filter(|l| !l.is_empty())
                .cloned()
                .unwrap_or_else(|| class_id.to_string());
            let bbox = BoundingBox::from_corners(
                (row[3] * w) as i32,
                (row[4] * h) as i32,
                (row[5] * w) as i32,
                (row[6] * h) as i32,
            );
            Detection::new(label, row[2], bbox)
        })
        .collect()
}
