use crate::common::{Config, UnlockError, Result};
use crate::core::detector::FaceDetector;
use crate::core::quality::QualityMetrics;
use crate::core::recognizer::{cosine_similarity, Embedding, FaceRecognizer};
use crate::core::verifier::{FaceMatcher, MatchScore, ReferenceDescriptor};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const TEMPLATE_VERSION: u32 = 1;

/// Enrolled embeddings as produced by the enrollment tooling. Only this
/// matcher interprets reference bytes this way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub version: u32,
    pub username: String,
    pub embeddings: Vec<Embedding>,
    #[serde(default)]
    pub averaged_embedding: Option<Embedding>,
}

impl EnrolledTemplate {
    pub fn decode(reference: &ReferenceDescriptor) -> Result<Self> {
        let template: EnrolledTemplate = bincode::deserialize(reference.as_bytes())
            .map_err(|e| UnlockError::Storage(format!(
                "Failed to decode reference for {}: {}", reference.identity(), e
            )))?;

        if template.version > TEMPLATE_VERSION {
            return Err(UnlockError::Storage(format!(
                "Reference for {} has unsupported version {}", reference.identity(), template.version
            )));
        }
        if template.embeddings.is_empty() && template.averaged_embedding.is_none() {
            return Err(UnlockError::Storage(format!(
                "Reference for {} holds no embeddings", reference.identity()
            )));
        }

        Ok(template)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| UnlockError::Storage(format!("Failed to serialize: {}", e)))
    }

    /// Best cosine similarity against every stored embedding, clamped to [0, 1].
    pub fn best_similarity(&self, embedding: &[f32]) -> f32 {
        self.embeddings
            .iter()
            .chain(self.averaged_embedding.iter())
            .map(|stored| cosine_similarity(embedding, stored))
            .fold(0.0f32, f32::max)
            .clamp(0.0, 1.0)
    }
}

/// Detector + embedding model behind the [`FaceMatcher`] contract.
///
/// The comparison confidence is the face's quality score, so a blurry, dark
/// or off-center capture comes back as inconclusive rather than rejected.
pub struct EmbeddingMatcher {
    detector: Arc<FaceDetector>,
    recognizer: FaceRecognizer,
}

impl EmbeddingMatcher {
    pub fn new(config: &Config, detector: Arc<FaceDetector>) -> Result<Self> {
        Ok(Self {
            detector,
            recognizer: FaceRecognizer::new(config)?,
        })
    }
}

impl FaceMatcher for EmbeddingMatcher {
    fn compare(&self, image: &DynamicImage, reference: &ReferenceDescriptor) -> Result<MatchScore> {
        let template = EnrolledTemplate::decode(reference)?;

        let faces = self.detector.detect_faces(image)?;
        let Some(face) = faces.first() else {
            tracing::debug!("No face in captured frame");
            return Ok(MatchScore { similarity: 0.0, comparison_confidence: 0.0 });
        };

        let quality = QualityMetrics::calculate(image, face);
        let embedding = self.recognizer.get_embedding(image, face)?;
        let similarity = template.best_similarity(&embedding);

        Ok(MatchScore {
            similarity,
            comparison_confidence: quality.overall_score,
        })
    }
}
