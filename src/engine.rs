//! Inference engine seam
//!
//! The engine is consumed as an opaque capability: load a model from disk,
//! then score decoded images with it. A loaded model is not reentrant, so
//! scoring takes `&mut self` and callers serialize access through the shared
//! node lock.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;

use crate::detection::{AnnotatedImage, Detection, ScoringResult};
use crate::error::EngineError;

/// Loads models. Implementations must be callable from the blocking pool.
pub trait InferenceEngine: Send + Sync {
    /// Load a model (and optional label file) into a fresh scoring handle.
    ///
    /// A failed load must leave any previously returned handle intact.
    fn load(&self, model_path: &Path, label_path: Option<&Path>)
        -> Result<Box<dyn ScoringModel>, EngineError>;
}

/// A loaded, non-reentrant model.
pub trait ScoringModel: Send {
    fn score(&mut self, image: &DecodedImage, annotate: bool) -> Result<ScoringResult, EngineError>;
}

/// Image decoded from a request body.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: RgbImage,
    /// Native extension of the encoded input, e.g. "jpg" or "png"
    pub extension: String,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Decode raw request bytes, remembering the encoded format.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, image::ImageError> {
    let format = image::guess_format(bytes)?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let extension = format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("bin")
        .to_string();

    Ok(DecodedImage {
        pixels: decoded.into_rgb8(),
        extension,
    })
}

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Draw detection boxes over a copy of the image and encode it as BMP.
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> Result<AnnotatedImage, EngineError> {
    let mut canvas = image.clone();
    for detection in detections {
        draw_rectangle(&mut canvas, detection);
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Bmp)
        .map_err(|e| EngineError::Annotation(e.to_string()))?;

    Ok(AnnotatedImage {
        bytes,
        extension: "bmp".to_string(),
    })
}

fn draw_rectangle(canvas: &mut RgbImage, detection: &Detection) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |v: i32| v.clamp(0, width as i32 - 1) as u32;
    let clamp_y = |v: i32| v.clamp(0, height as i32 - 1) as u32;

    let bbox = detection.bbox;
    let x0 = clamp_x(bbox.left);
    let y0 = clamp_y(bbox.top);
    let x1 = clamp_x(bbox.left + bbox.width);
    let y1 = clamp_y(bbox.top + bbox.height);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            canvas.put_pixel(x, (y0 + t).min(height - 1), BOX_COLOR);
            canvas.put_pixel(x, y1.saturating_sub(t), BOX_COLOR);
        }
        for y in y0..=y1 {
            canvas.put_pixel((x0 + t).min(width - 1), y, BOX_COLOR);
            canvas.put_pixel(x1.saturating_sub(t), y, BOX_COLOR);
        }
    }
}
