use crate::common::config::{Config, DetectorConfig};
use crate::common::Result;
use crate::core::presence::{Presence, PresenceDetector};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, Session, Value};
use std::sync::Arc;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MIN_BOX_SIDE: f32 = 10.0;
const MAX_FACES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 { intersection / union } else { 0.0 }
    }
}

/// YOLO-style single-class face detector on ONNX Runtime.
pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = super::build_environment("face_detector")?;
        let session = super::load_session(&environment, &config.models.detector_path, config)?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.detector.clone(),
        })
    }

    /// Faces above the configured detection confidence, best first, in
    /// original image coordinates.
    pub fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let input = if image.width() == self.config.input_width && image.height() == self.config.input_height {
            image_to_array(image)
        } else {
            let resized = image.resize_exact(self.config.input_width, self.config.input_height, FilterType::Nearest);
            image_to_array(&resized)
        };

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let Some(output) = outputs.first() else {
            return Ok(Vec::new());
        };
        let tensor = output.try_extract::<f32>()?;
        let view = tensor.view();
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();

        let mut faces = parse_predictions(&data, &shape, &self.config);

        let scale_x = orig_width / self.config.input_width as f32;
        let scale_y = orig_height / self.config.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

impl PresenceDetector for FaceDetector {
    fn detect(&self, frame: &DynamicImage) -> Result<Presence> {
        let faces = self.detect_faces(frame)?;
        Ok(match faces.first() {
            Some(best) => Presence::detected(best.confidence),
            None => Presence::absent(),
        })
    }
}

/// Grayscale frame replicated into a 1x3xHxW tensor scaled to [0, 1].
fn image_to_array(image: &DynamicImage) -> Array4<f32> {
    let gray = image.to_luma8();
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let mut array = Array4::<f32>::zeros((1, 3, height, width));

    for (x, y, pixel) in gray.enumerate_pixels() {
        let value = pixel[0] as f32 / 255.0;
        for channel in 0..3 {
            array[[0, channel, y as usize, x as usize]] = value;
        }
    }

    array
}

/// Decode `[1, N, 5]` or transposed `[1, 5, N]` predictions
/// (`cx, cy, w, h, score`), then NMS and threshold.
fn parse_predictions(data: &[f32], shape: &[usize], config: &DetectorConfig) -> Vec<FaceBox> {
    let (count, stride, transposed) = match shape {
        [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if stride < 5 || data.len() < count * stride {
        tracing::warn!("Detector output too small for shape {:?}", shape);
        return Vec::new();
    }

    let field = |i: usize, f: usize| if transposed { data[f * count + i] } else { data[i * stride + f] };

    let mut faces = Vec::new();
    for i in 0..count {
        let confidence = field(i, 4);
        if confidence <= 0.001 {
            continue;
        }

        let (mut cx, mut cy, mut w, mut h) = (field(i, 0), field(i, 1), field(i, 2), field(i, 3));
        // Normalized coordinates are scaled into model input space.
        if cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0 {
            cx *= config.input_width as f32;
            w *= config.input_width as f32;
            cy *= config.input_height as f32;
            h *= config.input_height as f32;
        }

        let face = FaceBox {
            x1: (cx - w / 2.0).max(0.0),
            y1: (cy - h / 2.0).max(0.0),
            x2: (cx + w / 2.0).min(config.input_width as f32),
            y2: (cy + h / 2.0).min(config.input_height as f32),
            confidence,
        };
        if face.x2 - face.x1 > MIN_BOX_SIDE && face.y2 - face.y1 > MIN_BOX_SIDE {
            faces.push(face);
        }
    }

    let mut faces = apply_nms(faces, NMS_IOU_THRESHOLD);
    faces.retain(|face| face.confidence >= config.detection_confidence);
    faces.truncate(MAX_FACES);
    faces
}

fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
