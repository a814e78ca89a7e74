use crate::camera::{CameraProvider, FrameSource};
use crate::common::{UnlockError, Result};
use image::DynamicImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle shared between the session and its sampler task.
pub type SharedDevice = Arc<Mutex<DeviceHandle>>;

/// Exclusive ownership of one open camera stream.
///
/// Released exactly once: either explicitly through [`DeviceHandle::release`]
/// or when the handle is dropped. A released handle stays closed.
pub struct DeviceHandle {
    source: Option<Box<dyn FrameSource>>,
    latest: Option<DynamicImage>,
    last_fresh: Instant,
    stale_after: Duration,
}

impl DeviceHandle {
    pub fn acquire(provider: &dyn CameraProvider, stale_after: Duration) -> Result<Self> {
        let source = provider.open().map_err(|e| match e {
            UnlockError::DeviceUnavailable(msg) => UnlockError::DeviceUnavailable(msg),
            other => UnlockError::DeviceUnavailable(other.to_string()),
        })?;

        tracing::debug!("Camera stream acquired (stale after {:?})", stale_after);

        Ok(Self {
            source: Some(source),
            latest: None,
            last_fresh: Instant::now(),
            stale_after,
        })
    }

    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// Most recent frame from the stream.
    ///
    /// Returns `Ok(None)` while the stream is still warming up. Re-serving a
    /// cached frame does not count as a successful read, so a frozen stream
    /// turns into `StreamStalled` once the staleness window passes.
    pub fn current_frame(&mut self) -> Result<Option<DynamicImage>> {
        let source = self.source.as_mut().ok_or(UnlockError::DeviceReleased)?;

        if let Some(frame) = source.latest_frame()? {
            self.last_fresh = Instant::now();
            self.latest = Some(frame);
        } else {
            let idle = self.last_fresh.elapsed();
            if idle > self.stale_after {
                return Err(UnlockError::StreamStalled(idle));
            }
        }

        Ok(self.latest.clone())
    }

    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
            self.latest = None;
            tracing::debug!("Camera stream released");
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        frames_left: usize,
        stops: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn latest_frame(&mut self) -> Result<Option<DynamicImage>> {
            if self.frames_left == 0 {
                return Ok(None);
            }
            self.frames_left -= 1;
            Ok(Some(DynamicImage::ImageLuma8(GrayImage::new(4, 4))))
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingProvider {
        frames: usize,
        stops: Arc<AtomicUsize>,
    }

    impl CameraProvider for CountingProvider {
        fn open(&self) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(CountingSource { frames_left: self.frames, stops: self.stops.clone() }))
        }
    }

    struct NoCamera;

    impl CameraProvider for NoCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>> {
            Err(UnlockError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)))
        }
    }

    fn provider(frames: usize) -> (CountingProvider, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        (CountingProvider { frames, stops: stops.clone() }, stops)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (provider, stops) = provider(1);
        let mut handle = DeviceHandle::acquire(&provider, Duration::from_secs(2)).unwrap();
        handle.release();
        handle.release();
        drop(handle);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_stream() {
        let (provider, stops) = provider(1);
        {
            let _handle = DeviceHandle::acquire(&provider, Duration::from_secs(2)).unwrap();
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_released_handle_cannot_read() {
        let (provider, _) = provider(5);
        let mut handle = DeviceHandle::acquire(&provider, Duration::from_secs(2)).unwrap();
        handle.release();
        assert!(!handle.is_open());
        assert!(matches!(handle.current_frame(), Err(UnlockError::DeviceReleased)));
    }

    #[test]
    fn test_open_failure_maps_to_device_unavailable() {
        let err = DeviceHandle::acquire(&NoCamera, Duration::from_secs(2)).err().unwrap();
        assert!(matches!(err, UnlockError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_cached_frame_served_until_stale() {
        let (provider, _) = provider(1);
        let mut handle = DeviceHandle::acquire(&provider, Duration::from_millis(30)).unwrap();
        assert!(handle.current_frame().unwrap().is_some());
        // No new frame, still inside the window: cached frame comes back.
        assert!(handle.current_frame().unwrap().is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(handle.current_frame(), Err(UnlockError::StreamStalled(_))));
    }

    #[test]
    fn test_no_frame_since_acquire_stalls() {
        let (provider, _) = provider(0);
        let mut handle = DeviceHandle::acquire(&provider, Duration::from_millis(20)).unwrap();
        assert!(handle.current_frame().unwrap().is_none());
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(handle.current_frame(), Err(UnlockError::StreamStalled(_))));
    }
}
