use crate::camera::DeviceHandle;
use crate::common::{UnlockConfig, UnlockError, Result};
use crate::core::presence::PresenceObservation;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    DeviceFailure,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Sampling,
    Ready,
    Capturing,
    Captured,
    Aborted(AbortReason),
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Captured | GateState::Aborted(_))
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Idle => write!(f, "Idle"),
            GateState::Sampling => write!(f, "Sampling"),
            GateState::Ready => write!(f, "Ready"),
            GateState::Capturing => write!(f, "Capturing"),
            GateState::Captured => write!(f, "Captured"),
            GateState::Aborted(reason) => write!(f, "Aborted({:?})", reason),
        }
    }
}

/// Snapshot taken while the gate was `Ready`.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    image: DynamicImage,
    captured_at: DateTime<Utc>,
    presence_confidence_at_capture: f32,
}

impl CapturedFrame {
    pub fn new(image: DynamicImage, presence_confidence_at_capture: f32) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            presence_confidence_at_capture,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn image_bytes(&self) -> &[u8] {
        self.image.as_bytes()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn presence_confidence_at_capture(&self) -> f32 {
        self.presence_confidence_at_capture
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateConfig {
    pub presence_threshold: f32,
    pub dwell_count: u32,
}

impl From<&UnlockConfig> for GateConfig {
    fn from(config: &UnlockConfig) -> Self {
        Self {
            presence_threshold: config.presence_threshold,
            dwell_count: config.dwell_count.max(1),
        }
    }
}

/// One capture lifecycle: opens on sustained presence, closes after a
/// single capture or an abort. A new attempt needs a new gate.
#[derive(Debug)]
pub struct CaptureGate {
    config: GateConfig,
    state: GateState,
    streak: u32,
    last_confidence: f32,
    last_sequence: Option<u64>,
    ready_at: Option<u64>,
}

impl CaptureGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::Idle,
            streak: 0,
            last_confidence: 0.0,
            last_sequence: None,
            ready_at: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Sequence number of the observation that last opened the gate.
    pub fn ready_at(&self) -> Option<u64> {
        self.ready_at
    }

    /// A sampler is now feeding this gate.
    pub fn attach(&mut self) {
        if self.state == GateState::Idle {
            self.transition(GateState::Sampling);
        }
    }

    pub fn observe(&mut self, observation: &PresenceObservation) -> GateState {
        if !matches!(self.state, GateState::Sampling | GateState::Ready) {
            return self.state;
        }

        // Observations are consecutive only if none were skipped in between;
        // an unseen one may have disqualified.
        if let Some(last) = self.last_sequence {
            if observation.sequence <= last {
                return self.state;
            }
            if observation.sequence != last + 1 {
                self.streak = 0;
                if self.state == GateState::Ready {
                    self.transition(GateState::Sampling);
                }
            }
        }
        self.last_sequence = Some(observation.sequence);

        if observation.qualifies(self.config.presence_threshold) {
            self.streak = self.streak.saturating_add(1);
            self.last_confidence = observation.confidence;
            if self.streak >= self.config.dwell_count && self.state == GateState::Sampling {
                self.ready_at = Some(observation.sequence);
                self.transition(GateState::Ready);
            }
        } else {
            self.streak = 0;
            if self.state == GateState::Ready {
                self.transition(GateState::Sampling);
            }
        }

        self.state
    }

    /// Pull one frame from the device. Only valid in `Ready`; any other state
    /// is refused with `NotReady` and leaves the gate untouched.
    pub fn capture(&mut self, device: &mut DeviceHandle) -> Result<CapturedFrame> {
        if self.state != GateState::Ready {
            return Err(UnlockError::NotReady(self.state));
        }

        self.transition(GateState::Capturing);
        match device.current_frame() {
            Ok(Some(image)) => {
                self.transition(GateState::Captured);
                Ok(CapturedFrame::new(image, self.last_confidence))
            }
            Ok(None) => {
                self.transition(GateState::Aborted(AbortReason::DeviceFailure));
                Err(UnlockError::Camera("No frame available at capture".into()))
            }
            Err(e) => {
                self.transition(GateState::Aborted(AbortReason::DeviceFailure));
                Err(e)
            }
        }
    }

    pub fn abort(&mut self, reason: AbortReason) {
        if !self.state.is_terminal() {
            self.transition(GateState::Aborted(reason));
        }
    }

    fn transition(&mut self, next: GateState) {
        tracing::debug!("Capture gate {} -> {}", self.state, next);
        self.state = next;
    }
}
