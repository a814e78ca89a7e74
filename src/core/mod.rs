pub mod detector;
pub mod gate;
pub mod matcher;
pub mod presence;
pub mod quality;
pub mod recognizer;
pub mod unlock;
pub mod verifier;

pub use detector::{FaceBox, FaceDetector};
pub use gate::{AbortReason, CaptureGate, CapturedFrame, GateConfig, GateState};
pub use matcher::{EmbeddingMatcher, EnrolledTemplate};
pub use presence::{Presence, PresenceDetector, PresenceObservation, PresenceSampler};
pub use quality::QualityMetrics;
pub use recognizer::{cosine_similarity, Embedding, FaceRecognizer};
pub use unlock::{AttemptResult, CancelHandle, Readiness, UnlockController, UnlockOutcome, UnlockSession};
pub use verifier::{
    FaceMatcher, MatchScore, ReferenceDescriptor, RetryBudget, VerdictOutcome, VerdictReason,
    VerificationVerdict, Verifier, VerifierPolicy,
};

use crate::common::{Config, UnlockError, Result};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder};
use std::path::Path;
use std::sync::Arc;

fn build_environment(name: &str) -> Result<Arc<Environment>> {
    let environment = Environment::builder()
        .with_name(name)
        .build()
        .map_err(|e| UnlockError::Model(format!("Failed to create environment: {}", e)))?;
    Ok(Arc::new(environment))
}

fn load_session(environment: &Arc<Environment>, model_path: &Path, config: &Config) -> Result<Session> {
    if !model_path.exists() {
        return Err(UnlockError::Model(format!("Model not found at: {:?}", model_path)));
    }

    let opt_level = match config.performance.optimization_level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    };

    let session = SessionBuilder::new(environment)?
        .with_optimization_level(opt_level)?
        .with_model_from_file(model_path)?;
    Ok(session)
}
