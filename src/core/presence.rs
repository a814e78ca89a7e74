use crate::camera::SharedDevice;
use crate::common::{UnlockError, Result};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Raw answer from a detection capability for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presence {
    pub present: bool,
    pub confidence: f32,
}

impl Presence {
    pub fn absent() -> Self {
        Self { present: false, confidence: 0.0 }
    }

    pub fn detected(confidence: f32) -> Self {
        Self { present: true, confidence }
    }

    fn clamped(self) -> Self {
        if self.confidence.is_nan() {
            return Self::absent();
        }
        Self { present: self.present, confidence: self.confidence.clamp(0.0, 1.0) }
    }
}

/// One sampling tick's result. Never mutated after it is published.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceObservation {
    pub present: bool,
    pub confidence: f32,
    pub sampled_at: DateTime<Utc>,
    /// 1-based tick number within the sampler that produced it.
    pub sequence: u64,
}

impl PresenceObservation {
    pub fn new(presence: Presence, sequence: u64) -> Self {
        let presence = presence.clamped();
        Self {
            present: presence.present,
            confidence: presence.confidence,
            sampled_at: Utc::now(),
            sequence,
        }
    }

    pub fn qualifies(&self, threshold: f32) -> bool {
        self.present && self.confidence >= threshold
    }
}

/// Pluggable face-presence capability.
///
/// Runs on the blocking pool; a call that overruns the detection timeout or
/// returns an error is recorded as an absent face.
pub trait PresenceDetector: Send + Sync + 'static {
    fn detect(&self, frame: &DynamicImage) -> Result<Presence>;
}

/// Single-slot, last-write-wins view of the sampler's output.
pub type ObservationReceiver = watch::Receiver<Option<PresenceObservation>>;

/// Background task turning the device stream into presence observations.
///
/// The task ends cleanly once the device is released or the receiver is
/// gone, and ends with the fault when the stream itself fails.
pub struct PresenceSampler {
    task: Option<JoinHandle<Result<()>>>,
}

impl PresenceSampler {
    pub fn spawn(
        device: SharedDevice,
        detector: Arc<dyn PresenceDetector>,
        interval: Duration,
        detection_timeout: Duration,
    ) -> (Self, ObservationReceiver) {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(sample_loop(device, detector, tx, interval, detection_timeout));
        (Self { task: Some(task) }, rx)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the task and return how it ended.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| UnlockError::Other(anyhow::anyhow!("Sampler task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sample_loop(
    device: SharedDevice,
    detector: Arc<dyn PresenceDetector>,
    tx: watch::Sender<Option<PresenceObservation>>,
    interval: Duration,
    detection_timeout: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detection = BoundedDetection::new(detector, detection_timeout);
    let mut sequence = 0u64;

    loop {
        ticker.tick().await;

        if tx.is_closed() {
            tracing::debug!("Presence subscriber gone, sampler exiting");
            return Ok(());
        }

        let frame = {
            let mut handle = device.lock();
            if !handle.is_open() {
                return Ok(());
            }
            handle.current_frame()?
        };

        let presence = match frame {
            Some(frame) => detection.run(frame).await,
            None => Presence::absent(),
        };

        sequence += 1;
        let observation = PresenceObservation::new(presence, sequence);
        tracing::debug!(
            "Presence #{}: present={} confidence={:.3}",
            observation.sequence, observation.present, observation.confidence
        );

        // Publish under the device lock so a concurrent release cannot slip in between.
        {
            let handle = device.lock();
            if !handle.is_open() {
                return Ok(());
            }
            tx.send_replace(Some(observation));
        }
    }
}

/// Runs the detector on the blocking pool with at most one call in flight.
///
/// A call that overruns its limit keeps its thread until it returns; until
/// then every tick records an absent face instead of piling up more calls.
struct BoundedDetection {
    detector: Arc<dyn PresenceDetector>,
    limit: Duration,
    overrun: Option<JoinHandle<Result<Presence>>>,
}

impl BoundedDetection {
    fn new(detector: Arc<dyn PresenceDetector>, limit: Duration) -> Self {
        Self { detector, limit, overrun: None }
    }

    async fn run(&mut self, frame: DynamicImage) -> Presence {
        if let Some(job) = &self.overrun {
            if !job.is_finished() {
                tracing::debug!("Previous detection still running, recording absent");
                return Presence::absent();
            }
            // Its answer belongs to an older frame.
            self.overrun = None;
        }

        let detector = self.detector.clone();
        let mut job = tokio::task::spawn_blocking(move || detector.detect(&frame));

        match tokio::time::timeout(self.limit, &mut job).await {
            Ok(Ok(Ok(presence))) => presence,
            Ok(Ok(Err(e))) => {
                tracing::warn!("Presence detection failed: {}", e);
                Presence::absent()
            }
            Ok(Err(e)) => {
                tracing::warn!("Presence detection panicked: {}", e);
                Presence::absent()
            }
            Err(_) => {
                tracing::warn!("Presence detection exceeded {:?}", self.limit);
                self.overrun = Some(job);
                Presence::absent()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraProvider, DeviceHandle, FrameSource};
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EndlessSource;

    impl FrameSource for EndlessSource {
        fn latest_frame(&mut self) -> Result<Option<DynamicImage>> {
            Ok(Some(DynamicImage::ImageLuma8(GrayImage::new(2, 2))))
        }
        fn stop(&mut self) {}
    }

    struct EndlessCamera;

    impl CameraProvider for EndlessCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(EndlessSource))
        }
    }

    /// `None` makes every call fail.
    struct Fixed(Option<Presence>, Duration, Arc<AtomicUsize>);

    impl PresenceDetector for Fixed {
        fn detect(&self, _frame: &DynamicImage) -> Result<Presence> {
            self.2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.1);
            self.0.ok_or_else(|| UnlockError::Model("detector offline".into()))
        }
    }

    fn device() -> SharedDevice {
        DeviceHandle::acquire(&EndlessCamera, Duration::from_secs(2)).unwrap().into_shared()
    }

    #[test]
    fn test_observation_confidence_is_clamped() {
        let obs = PresenceObservation::new(Presence::detected(1.7), 1);
        assert_eq!(obs.confidence, 1.0);
        let obs = PresenceObservation::new(Presence { present: true, confidence: f32::NAN }, 2);
        assert!(!obs.present);
        assert_eq!(obs.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_sampler_publishes_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(Fixed(Some(Presence::detected(0.9)), Duration::ZERO, calls.clone()));
        let (_sampler, mut rx) = PresenceSampler::spawn(device(), detector, Duration::from_millis(5), Duration::from_millis(200));

        let mut last = 0;
        for _ in 0..3 {
            rx.changed().await.unwrap();
            let obs = rx.borrow_and_update().clone().unwrap();
            assert!(obs.sequence > last);
            assert!(obs.qualifies(0.6));
            last = obs.sequence;
        }
    }

    #[tokio::test]
    async fn test_failed_detection_counts_as_absent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(Fixed(None, Duration::ZERO, calls));
        let (_sampler, mut rx) = PresenceSampler::spawn(device(), detector, Duration::from_millis(5), Duration::from_millis(200));

        rx.changed().await.unwrap();
        let obs = rx.borrow_and_update().clone().unwrap();
        assert!(!obs.present);
        assert_eq!(obs.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_slow_detection_counts_as_absent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(Fixed(Some(Presence::detected(0.95)), Duration::from_millis(100), calls));
        let (_sampler, mut rx) = PresenceSampler::spawn(device(), detector, Duration::from_millis(5), Duration::from_millis(10));

        rx.changed().await.unwrap();
        let obs = rx.borrow_and_update().clone().unwrap();
        assert!(!obs.present);
    }

    struct Hung {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl PresenceDetector for Hung {
        fn detect(&self, _frame: &DynamicImage) -> Result<Presence> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Presence::detected(0.9))
        }
    }

    #[tokio::test]
    async fn test_overrunning_detector_is_not_called_concurrently() {
        let detector = Arc::new(Hung {
            delay: Duration::from_millis(300),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let (_sampler, mut rx) = PresenceSampler::spawn(device(), detector.clone(), Duration::from_millis(5), Duration::from_millis(5));

        for _ in 0..6 {
            rx.changed().await.unwrap();
            let obs = rx.borrow_and_update().clone().unwrap();
            assert!(!obs.present);
        }

        assert_eq!(detector.peak.load(Ordering::SeqCst), 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sampler_stops_after_release() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(Fixed(Some(Presence::detected(0.9)), Duration::ZERO, calls));
        let device = device();
        let (sampler, mut rx) = PresenceSampler::spawn(device.clone(), detector, Duration::from_millis(5), Duration::from_millis(200));

        rx.changed().await.unwrap();
        device.lock().release();

        assert!(sampler.join().await.is_ok());
        // Sender dropped with the task; nothing new was published after release.
        rx.borrow_and_update();
        assert!(rx.changed().await.is_err());
    }
}
