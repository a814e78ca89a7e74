use crate::common::{UnlockConfig, Result};
use crate::core::gate::CapturedFrame;
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;

/// Enrolled identity to match against. The bytes are opaque here; only the
/// matcher that produced them knows their layout.
#[derive(Clone)]
pub struct ReferenceDescriptor {
    identity: String,
    data: Arc<[u8]>,
}

impl ReferenceDescriptor {
    pub fn new(identity: impl Into<String>, data: Vec<u8>) -> Self {
        Self { identity: identity.into(), data: data.into() }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ReferenceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceDescriptor")
            .field("identity", &self.identity)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What a matching capability reports for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    /// Similarity between the frame's face and the reference, in [0, 1].
    pub similarity: f32,
    /// How much the matcher trusts its own comparison (frame quality etc.).
    pub comparison_confidence: f32,
}

/// Pluggable face-matching capability. Blocking; called off the async runtime.
pub trait FaceMatcher: Send + Sync + 'static {
    fn compare(&self, image: &DynamicImage, reference: &ReferenceDescriptor) -> Result<MatchScore>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictOutcome {
    Verified,
    Rejected,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictReason {
    Matched,
    SimilarityBelowThreshold,
    InsufficientLiveness,
    LowComparisonConfidence,
    MatcherFailed,
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationVerdict {
    pub outcome: VerdictOutcome,
    pub confidence: f32,
    pub reason: VerdictReason,
}

impl VerificationVerdict {
    fn new(outcome: VerdictOutcome, confidence: f32, reason: VerdictReason) -> Self {
        Self { outcome, confidence: confidence.clamp(0.0, 1.0), reason }
    }
}

impl fmt::Display for VerificationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?}, confidence {:.3})", self.outcome, self.reason, self.confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifierPolicy {
    pub match_threshold: f32,
    pub liveness_threshold: f32,
    pub min_comparison_confidence: f32,
}

impl From<&UnlockConfig> for VerifierPolicy {
    fn from(config: &UnlockConfig) -> Self {
        Self {
            match_threshold: config.match_threshold,
            liveness_threshold: config.liveness_threshold,
            min_comparison_confidence: config.min_comparison_confidence,
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    matcher: Arc<dyn FaceMatcher>,
    policy: VerifierPolicy,
}

impl Verifier {
    pub fn new(matcher: Arc<dyn FaceMatcher>, policy: VerifierPolicy) -> Self {
        Self { matcher, policy }
    }

    pub fn policy(&self) -> VerifierPolicy {
        self.policy
    }

    /// Decide one attempt.
    ///
    /// An untrusted comparison is `Inconclusive` regardless of score. A
    /// trusted low score is `Rejected`. A trusted high score still needs the
    /// capture-time liveness to pass, otherwise it is `Inconclusive`.
    pub fn verify(&self, frame: &CapturedFrame, reference: &ReferenceDescriptor) -> VerificationVerdict {
        let score = match self.matcher.compare(frame.image(), reference) {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!("Matcher failed for {}: {}", reference.identity(), e);
                return VerificationVerdict::new(VerdictOutcome::Inconclusive, 0.0, VerdictReason::MatcherFailed);
            }
        };
        let liveness = frame.presence_confidence_at_capture();

        tracing::debug!(
            "Match for {}: similarity={:.3} comparison_confidence={:.3} liveness={:.3}",
            reference.identity(), score.similarity, score.comparison_confidence, liveness
        );

        let verdict = if score.comparison_confidence.is_nan()
            || score.comparison_confidence < self.policy.min_comparison_confidence
        {
            VerificationVerdict::new(
                VerdictOutcome::Inconclusive,
                score.comparison_confidence.max(0.0),
                VerdictReason::LowComparisonConfidence,
            )
        } else if score.similarity.is_nan() || score.similarity < self.policy.match_threshold {
            VerificationVerdict::new(
                VerdictOutcome::Rejected,
                score.comparison_confidence,
                VerdictReason::SimilarityBelowThreshold,
            )
        } else if liveness < self.policy.liveness_threshold {
            VerificationVerdict::new(
                VerdictOutcome::Inconclusive,
                liveness,
                VerdictReason::InsufficientLiveness,
            )
        } else {
            VerificationVerdict::new(VerdictOutcome::Verified, score.similarity, VerdictReason::Matched)
        };

        tracing::debug!("Verdict for {}: {}", reference.identity(), verdict);
        verdict
    }
}

/// What the session does after an attempt's verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptDecision {
    Finish(VerificationVerdict),
    Retry,
}

/// Bounds automatic re-attempts after `Inconclusive` verdicts.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_inconclusive_retries: u32,
    inconclusive: u32,
}

impl RetryBudget {
    pub fn new(max_inconclusive_retries: u32) -> Self {
        Self { max_inconclusive_retries, inconclusive: 0 }
    }

    pub fn inconclusive_count(&self) -> u32 {
        self.inconclusive
    }

    pub fn retries_left(&self) -> u32 {
        self.max_inconclusive_retries.saturating_sub(self.inconclusive)
    }

    pub fn record(&mut self, verdict: VerificationVerdict) -> AttemptDecision {
        match verdict.outcome {
            VerdictOutcome::Verified | VerdictOutcome::Rejected => AttemptDecision::Finish(verdict),
            VerdictOutcome::Inconclusive => {
                self.inconclusive += 1;
                if self.inconclusive > self.max_inconclusive_retries {
                    AttemptDecision::Finish(VerificationVerdict::new(
                        VerdictOutcome::Rejected,
                        verdict.confidence,
                        VerdictReason::RetriesExhausted,
                    ))
                } else {
                    AttemptDecision::Retry
                }
            }
        }
    }
}
