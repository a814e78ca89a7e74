use crate::common::config::{Config, RecognizerConfig};
use crate::common::{UnlockError, Result};
use crate::core::detector::FaceBox;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, Session, Value};
use std::sync::Arc;

pub type Embedding = Vec<f32>;

pub struct FaceRecognizer {
    session: Session,
    _environment: Arc<Environment>,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = super::build_environment("face_recognizer")?;
        let session = super::load_session(&environment, &config.models.recognizer_path, config)?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.recognizer.clone(),
        })
    }

    pub fn get_embedding(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding> {
        let x = face.x1.max(0.0) as u32;
        let y = face.y1.max(0.0) as u32;
        let width = (face.x2 - face.x1).max(1.0) as u32;
        let height = (face.y2 - face.y1).max(1.0) as u32;
        let crop = image.crop_imm(x, y, width, height);

        let size = self.config.input_size;
        let resized = crop.resize_exact(size, size, FilterType::Triangle);

        let input = self.preprocess(&resized);
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let output = outputs
            .first()
            .ok_or_else(|| UnlockError::Model("Recognizer produced no output".into()))?;
        let embedding = output.try_extract::<f32>()?.view().iter().copied().collect();
        Ok(embedding)
    }

    /// Single-channel ArcFace-style normalization.
    fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let gray = image.to_luma8();
        let size = self.config.input_size as usize;
        let norm = self.config.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for (x, y, pixel) in gray.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm) / norm;
        }

        array
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }
}
