#![allow(dead_code)]

use faceunlock::camera::{CameraProvider, FrameSource};
use faceunlock::core::{FaceMatcher, MatchScore, Presence, PresenceDetector, ReferenceDescriptor};
use faceunlock::{Result, UnlockConfig, UnlockError};
use image::{DynamicImage, GrayImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn frame() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::new(8, 8))
}

pub fn reference() -> ReferenceDescriptor {
    ReferenceDescriptor::new("alice", vec![7, 7, 7])
}

/// Fast timings so sessions finish in well under a second.
pub fn fast_config() -> UnlockConfig {
    UnlockConfig {
        sample_interval_ms: 10,
        session_timeout_ms: 3000,
        stale_frame_timeout_ms: 500,
        detection_timeout_ms: 200,
        ..UnlockConfig::default()
    }
}

#[derive(Default)]
pub struct CameraStats {
    pub opens: AtomicUsize,
    pub stops: AtomicUsize,
}

impl CameraStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// In-memory camera. The first `stalled_opens` streams never produce a
/// frame; later ones produce a fresh frame on every read.
pub struct FakeCamera {
    pub stats: Arc<CameraStats>,
    unavailable: bool,
    stalled_opens: usize,
}

impl FakeCamera {
    pub fn working() -> Self {
        Self { stats: Arc::default(), unavailable: false, stalled_opens: 0 }
    }

    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::working() }
    }

    pub fn stalling(stalled_opens: usize) -> Self {
        Self { stalled_opens, ..Self::working() }
    }
}

impl CameraProvider for FakeCamera {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        if self.unavailable {
            return Err(UnlockError::DeviceUnavailable("/dev/video0: busy".into()));
        }
        let previous = self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            stats: self.stats.clone(),
            stalled: previous < self.stalled_opens,
        }))
    }
}

struct FakeStream {
    stats: Arc<CameraStats>,
    stalled: bool,
}

impl FrameSource for FakeStream {
    fn latest_frame(&mut self) -> Result<Option<DynamicImage>> {
        Ok(if self.stalled { None } else { Some(frame()) })
    }

    fn stop(&mut self) {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Replays a confidence script, repeating the last entry once exhausted.
pub struct ScriptedDetector {
    script: Vec<f32>,
    next: Mutex<usize>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: &[f32]) -> Arc<Self> {
        Arc::new(Self { script: script.to_vec(), next: Mutex::new(0), calls: AtomicUsize::new(0) })
    }

    pub fn constant(confidence: f32) -> Arc<Self> {
        Self::new(&[confidence])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PresenceDetector for ScriptedDetector {
    fn detect(&self, _frame: &DynamicImage) -> Result<Presence> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut next = self.next.lock();
        let index = (*next).min(self.script.len().saturating_sub(1));
        *next += 1;
        Ok(match self.script.get(index) {
            Some(&confidence) => Presence::detected(confidence),
            None => Presence::absent(),
        })
    }
}

pub struct FixedMatcher {
    score: MatchScore,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedMatcher {
    pub fn new(similarity: f32, comparison_confidence: f32) -> Arc<Self> {
        Self::slow(similarity, comparison_confidence, Duration::ZERO)
    }

    pub fn slow(similarity: f32, comparison_confidence: f32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            score: MatchScore { similarity, comparison_confidence },
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceMatcher for FixedMatcher {
    fn compare(&self, _image: &DynamicImage, _reference: &ReferenceDescriptor) -> Result<MatchScore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(self.score)
    }
}
