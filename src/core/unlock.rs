use crate::camera::{CameraProvider, DeviceHandle, SharedDevice};
use crate::common::{UnlockConfig, UnlockError, Result};
use crate::core::gate::{AbortReason, CaptureGate, CapturedFrame, GateConfig, GateState};
use crate::core::presence::{ObservationReceiver, PresenceDetector, PresenceSampler};
use crate::core::verifier::{
    AttemptDecision, FaceMatcher, ReferenceDescriptor, RetryBudget, VerdictOutcome, VerdictReason,
    VerificationVerdict, Verifier, VerifierPolicy,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Terminal result of one unlock session. Emitted exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    Verified(VerificationVerdict),
    Rejected(VerificationVerdict),
    Cancelled,
    TimedOut,
    DeviceError(String),
}

impl UnlockOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, UnlockOutcome::Verified(_))
    }

    /// Verdict outcomes leave the gate where the attempt left it.
    fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            UnlockOutcome::Verified(_) | UnlockOutcome::Rejected(_) => None,
            UnlockOutcome::Cancelled => Some(AbortReason::Cancelled),
            UnlockOutcome::TimedOut => Some(AbortReason::TimedOut),
            UnlockOutcome::DeviceError(_) => Some(AbortReason::DeviceFailure),
        }
    }
}

impl fmt::Display for UnlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockOutcome::Verified(v) => write!(f, "Verified: {}", v),
            UnlockOutcome::Rejected(v) => write!(f, "Rejected: {}", v),
            UnlockOutcome::Cancelled => write!(f, "Cancelled"),
            UnlockOutcome::TimedOut => write!(f, "Timed out"),
            UnlockOutcome::DeviceError(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

/// Result of waiting on the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    Finished(UnlockOutcome),
}

/// Result of verifying one captured frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Finished(UnlockOutcome),
    /// Inconclusive within budget: a fresh gate is waiting for presence again.
    Retry { verdict: VerificationVerdict, retries_left: u32 },
}

type OutcomeSlot = Arc<watch::Sender<Option<UnlockOutcome>>>;

/// Store `outcome` unless the slot already holds one. Returns the outcome
/// that ends up in the slot and whether this call put it there.
fn settle(slot: &OutcomeSlot, outcome: UnlockOutcome) -> (UnlockOutcome, bool) {
    let mut settled = outcome.clone();
    let mut published = false;
    slot.send_if_modified(|current| match current {
        Some(existing) => {
            settled = existing.clone();
            false
        }
        None => {
            *current = Some(outcome);
            published = true;
            true
        }
    });
    (settled, published)
}

/// Cancellation for a running session, usable from any task. The camera is
/// released promptly even if the session is not being driven.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Builds unlock sessions from a camera and the two pluggable capabilities.
/// Holds no per-session state; sessions can run back to back or side by side.
pub struct UnlockController {
    camera: Arc<dyn CameraProvider>,
    detector: Arc<dyn PresenceDetector>,
    matcher: Arc<dyn FaceMatcher>,
}

impl UnlockController {
    pub fn new(
        camera: Arc<dyn CameraProvider>,
        detector: Arc<dyn PresenceDetector>,
        matcher: Arc<dyn FaceMatcher>,
    ) -> Self {
        Self { camera, detector, matcher }
    }

    /// Acquire the camera, start sampling and attach a capture gate.
    ///
    /// Must run inside a Tokio runtime. A camera that cannot be opened is
    /// reported as `DeviceUnavailable` and nothing is started.
    pub fn start_unlock(&self, config: UnlockConfig, reference: ReferenceDescriptor) -> Result<UnlockSession> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| UnlockError::Other(anyhow::anyhow!("No async runtime: {}", e)))?;

        let device = DeviceHandle::acquire(&*self.camera, config.stale_frame_timeout())?.into_shared();
        tracing::info!("Unlock session started for {}", reference.identity());

        let (sampler, observations) = PresenceSampler::spawn(
            device.clone(),
            self.detector.clone(),
            config.sample_interval(),
            config.detection_timeout(),
        );
        let mut gate = CaptureGate::new(GateConfig::from(&config));
        gate.attach();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        let outcome_tx = Arc::new(outcome_tx);
        let deadline = Instant::now() + config.session_timeout();
        let watchdog = spawn_watchdog(device.clone(), cancel_rx.clone(), deadline, outcome_tx.clone());

        Ok(UnlockSession {
            camera: self.camera.clone(),
            detector: self.detector.clone(),
            verifier: Verifier::new(self.matcher.clone(), VerifierPolicy::from(&config)),
            reference,
            device,
            sampler: Some(sampler),
            observations,
            gate,
            budget: RetryBudget::new(config.max_inconclusive_retries),
            attempts: 0,
            stall_recoveries: 0,
            deadline,
            config,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            outcome_tx,
            watchdog: Some(watchdog),
        })
    }
}

/// Ends the session on cancel or deadline even while nobody is driving it:
/// the outcome is settled and the camera released under the device lock, so
/// the sampler stops at its next tick.
fn spawn_watchdog(
    device: SharedDevice,
    mut cancel_rx: watch::Receiver<bool>,
    deadline: Instant,
    outcome_tx: OutcomeSlot,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => UnlockOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => UnlockOutcome::TimedOut,
            else => return,
        };

        let mut handle = device.lock();
        let (settled, published) = settle(&outcome_tx, outcome);
        handle.release();
        if published {
            tracing::info!("Unlock session ended while idle: {}", settled);
        }
    })
}

enum WaitEvent {
    Observation,
    SamplerExited,
    Cancelled,
    Deadline,
}

enum VerifyEvent {
    Done(std::result::Result<VerificationVerdict, JoinError>),
    Cancelled,
    Deadline,
}

/// One unlock attempt session, from camera acquisition to terminal outcome.
///
/// The camera is released exactly once when the session reaches its outcome,
/// and dropping an unfinished session counts as cancellation.
pub struct UnlockSession {
    camera: Arc<dyn CameraProvider>,
    detector: Arc<dyn PresenceDetector>,
    verifier: Verifier,
    reference: ReferenceDescriptor,
    config: UnlockConfig,
    device: SharedDevice,
    sampler: Option<PresenceSampler>,
    observations: ObservationReceiver,
    gate: CaptureGate,
    budget: RetryBudget,
    attempts: u32,
    stall_recoveries: u32,
    deadline: Instant,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    outcome_tx: OutcomeSlot,
    watchdog: Option<JoinHandle<()>>,
}

impl UnlockSession {
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    /// Frames captured so far in this session.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn outcome(&self) -> Option<UnlockOutcome> {
        self.outcome_tx.borrow().clone()
    }

    /// Receives `Some(outcome)` once the session ends.
    pub fn subscribe(&self) -> watch::Receiver<Option<UnlockOutcome>> {
        self.outcome_tx.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    pub fn cancel(&mut self) -> UnlockOutcome {
        self.finish(UnlockOutcome::Cancelled)
    }

    /// Wait until the gate opens or the session ends.
    pub async fn wait_ready(&mut self) -> Readiness {
        loop {
            if let Some(outcome) = self.check_terminal() {
                return Readiness::Finished(outcome);
            }

            self.drain_observations();
            if self.gate.state() == GateState::Ready {
                return Readiness::Ready;
            }

            let event = tokio::select! {
                changed = self.observations.changed() => match changed {
                    Ok(()) => WaitEvent::Observation,
                    Err(_) => WaitEvent::SamplerExited,
                },
                _ = self.cancel_rx.changed() => WaitEvent::Cancelled,
                _ = tokio::time::sleep_until(self.deadline) => WaitEvent::Deadline,
            };

            match event {
                WaitEvent::Observation => {}
                WaitEvent::SamplerExited => self.handle_sampler_exit().await,
                WaitEvent::Cancelled => {
                    if *self.cancel_rx.borrow() {
                        self.finish(UnlockOutcome::Cancelled);
                    }
                }
                WaitEvent::Deadline => {
                    self.finish(UnlockOutcome::TimedOut);
                }
            }
        }
    }

    /// Take the snapshot. Refused with `NotReady`, and without side effects,
    /// unless the gate is `Ready` given the latest observation.
    pub fn request_capture(&mut self) -> Result<CapturedFrame> {
        if self.check_terminal().is_some() {
            return Err(UnlockError::SessionFinished);
        }

        self.drain_observations();
        if self.gate.state() != GateState::Ready {
            return Err(UnlockError::NotReady(self.gate.state()));
        }

        let captured = {
            let mut device = self.device.lock();
            self.gate.capture(&mut device)
        };

        match captured {
            Ok(frame) => {
                self.attempts += 1;
                tracing::info!(
                    "Captured frame {} for {} (presence {:.3})",
                    self.attempts, self.reference.identity(), frame.presence_confidence_at_capture()
                );
                Ok(frame)
            }
            Err(e) => {
                self.finish(UnlockOutcome::DeviceError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Run the verifier on a captured frame and apply the retry policy.
    pub async fn verify(&mut self, frame: CapturedFrame) -> AttemptResult {
        if let Some(outcome) = self.check_terminal() {
            return AttemptResult::Finished(outcome);
        }

        let verifier = self.verifier.clone();
        let reference = self.reference.clone();
        let job = tokio::task::spawn_blocking(move || verifier.verify(&frame, &reference));

        let mut cancel_rx = self.cancel_rx.clone();
        let event = tokio::select! {
            joined = job => VerifyEvent::Done(joined),
            Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => VerifyEvent::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => VerifyEvent::Deadline,
        };

        let verdict = match event {
            VerifyEvent::Done(Ok(verdict)) => verdict,
            VerifyEvent::Done(Err(e)) => {
                tracing::warn!("Verifier task failed: {}", e);
                VerificationVerdict {
                    outcome: VerdictOutcome::Inconclusive,
                    confidence: 0.0,
                    reason: VerdictReason::MatcherFailed,
                }
            }
            VerifyEvent::Cancelled => return AttemptResult::Finished(self.finish(UnlockOutcome::Cancelled)),
            VerifyEvent::Deadline => return AttemptResult::Finished(self.finish(UnlockOutcome::TimedOut)),
        };

        if let Some(outcome) = self.check_terminal() {
            return AttemptResult::Finished(outcome);
        }

        match self.budget.record(verdict) {
            AttemptDecision::Finish(verdict) => AttemptResult::Finished(self.finish_with(verdict)),
            AttemptDecision::Retry => {
                tracing::info!(
                    "Inconclusive verdict ({:?}), {} retries left",
                    verdict.reason, self.budget.retries_left()
                );
                self.reset_gate();
                AttemptResult::Retry { verdict, retries_left: self.budget.retries_left() }
            }
        }
    }

    /// End the session with a verdict the caller obtained itself.
    /// Anything short of `Verified` denies access.
    pub fn finish_with(&mut self, verdict: VerificationVerdict) -> UnlockOutcome {
        let outcome = match verdict.outcome {
            VerdictOutcome::Verified => UnlockOutcome::Verified(verdict),
            VerdictOutcome::Rejected | VerdictOutcome::Inconclusive => UnlockOutcome::Rejected(verdict),
        };
        self.finish(outcome)
    }

    /// Drive the session to its outcome, capturing as soon as the gate opens.
    pub async fn run(mut self) -> UnlockOutcome {
        loop {
            match self.wait_ready().await {
                Readiness::Finished(outcome) => return outcome,
                Readiness::Ready => {}
            }

            let frame = match self.request_capture() {
                Ok(frame) => frame,
                Err(UnlockError::NotReady(_)) => continue,
                Err(e) => {
                    return match self.outcome() {
                        Some(outcome) => outcome,
                        None => self.finish(UnlockOutcome::DeviceError(e.to_string())),
                    };
                }
            };

            match self.verify(frame).await {
                AttemptResult::Finished(outcome) => return outcome,
                AttemptResult::Retry { .. } => {}
            }
        }
    }

    /// Cancellation and deadline are checked at every gate interaction.
    fn check_terminal(&mut self) -> Option<UnlockOutcome> {
        if let Some(outcome) = self.outcome() {
            return Some(self.finish(outcome));
        }
        if *self.cancel_rx.borrow() {
            return Some(self.finish(UnlockOutcome::Cancelled));
        }
        if Instant::now() >= self.deadline {
            return Some(self.finish(UnlockOutcome::TimedOut));
        }
        None
    }

    fn drain_observations(&mut self) {
        if !matches!(self.observations.has_changed(), Ok(true)) {
            return;
        }
        let latest = self.observations.borrow_and_update().clone();
        if let Some(observation) = latest {
            self.gate.observe(&observation);
        }
    }

    fn reset_gate(&mut self) {
        // Only observations made after this point may open the new gate.
        self.observations.borrow_and_update();
        self.gate = CaptureGate::new(GateConfig::from(&self.config));
        self.gate.attach();
    }

    async fn handle_sampler_exit(&mut self) {
        let result = match self.sampler.take() {
            Some(sampler) => sampler.join().await,
            None => Ok(()),
        };

        match result {
            Err(e) if e.is_stream_fault() && self.stall_recoveries < self.config.max_stall_recoveries => {
                self.stall_recoveries += 1;
                tracing::warn!(
                    "{}; re-acquiring camera ({}/{})",
                    e, self.stall_recoveries, self.config.max_stall_recoveries
                );
                self.recover_stream();
            }
            Err(e) => {
                self.finish(UnlockOutcome::DeviceError(e.to_string()));
            }
            Ok(()) => {
                self.finish(UnlockOutcome::DeviceError("Presence sampler stopped".into()));
            }
        }
    }

    fn recover_stream(&mut self) {
        self.device.lock().release();

        let handle = match DeviceHandle::acquire(&*self.camera, self.config.stale_frame_timeout()) {
            Ok(handle) => handle,
            Err(e) => {
                self.finish(UnlockOutcome::DeviceError(e.to_string()));
                return;
            }
        };

        // Swap in place so the watchdog keeps guarding the live stream.
        {
            let mut device = self.device.lock();
            if self.outcome_tx.borrow().is_some() {
                return;
            }
            *device = handle;
        }

        let (sampler, observations) = PresenceSampler::spawn(
            self.device.clone(),
            self.detector.clone(),
            self.config.sample_interval(),
            self.config.detection_timeout(),
        );
        self.sampler = Some(sampler);
        self.observations = observations;
        self.gate = CaptureGate::new(GateConfig::from(&self.config));
        self.gate.attach();
    }

    /// Settle the outcome (first one wins) and tear down. Safe to repeat.
    fn finish(&mut self, outcome: UnlockOutcome) -> UnlockOutcome {
        let (settled, published) = {
            let mut device = self.device.lock();
            let settled = settle(&self.outcome_tx, outcome);
            device.release();
            settled
        };

        if let Some(mut sampler) = self.sampler.take() {
            sampler.stop();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if let Some(reason) = settled.abort_reason() {
            self.gate.abort(reason);
        }

        if published {
            tracing::info!(
                "Unlock session for {} finished after {} capture(s): {}",
                self.reference.identity(), self.attempts, settled
            );
        }
        settled
    }
}

impl Drop for UnlockSession {
    fn drop(&mut self) {
        self.finish(UnlockOutcome::Cancelled);
    }
}
