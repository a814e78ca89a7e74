use crate::camera::{CameraProvider, FrameSource};
use crate::common::config::CameraConfig;
use crate::common::{UnlockError, Result};
use image::{DynamicImage, GrayImage, ImageFormat};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const AUTO_DETECT_INDEX: u32 = 999;
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a dequeue may block before the reader re-checks its stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub likely_ir: bool,
}

/// V4L2 camera provider. Each `open` negotiates a format and starts a reader
/// thread that keeps only the newest decoded frame.
pub struct V4l2Camera {
    config: CameraConfig,
}

impl V4l2Camera {
    pub fn new(config: &CameraConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Enumerate `/dev/video*` devices that answer a capability query.
    pub fn list_cameras() -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();

        for index in video_indices()? {
            let Ok(device) = Device::new(index as usize) else { continue };
            let Ok(caps) = device.query_caps() else { continue };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }

            let mut formats = Vec::new();
            let mut likely_ir = caps.card.contains("IR") || caps.card.contains("Infrared");
            for fmt in device.enum_formats().unwrap_or_default() {
                let name = fmt.fourcc.str().unwrap_or("????").to_string();
                if is_grayscale(&fmt.fourcc) {
                    likely_ir = true;
                }
                formats.push(name);
            }

            cameras.push(CameraInfo { index, name: caps.card.clone(), formats, likely_ir });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }

    /// Prefer a grayscale (usually IR) device, falling back to video0.
    pub fn detect_ir_camera() -> Result<u32> {
        let cameras = Self::list_cameras()?;
        let selected = cameras
            .iter()
            .find(|c| c.likely_ir)
            .map(|c| c.index)
            .unwrap_or(0);

        tracing::info!("Auto-detected camera /dev/video{}", selected);
        Ok(selected)
    }

    fn open_device(&self) -> Result<(Device, v4l::Format)> {
        let index = if self.config.device_index == AUTO_DETECT_INDEX {
            Self::detect_ir_camera()?
        } else {
            self.config.device_index
        };

        let device = Device::new(index as usize)
            .map_err(|e| UnlockError::DeviceUnavailable(format!("/dev/video{}: {}", index, e)))?;

        let mut fmt = device.format()
            .map_err(|e| UnlockError::DeviceUnavailable(format!("Failed to get format: {}", e)))?;

        fmt.width = self.config.width;
        fmt.height = self.config.height;
        if !is_grayscale(&fmt.fourcc) {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set {}x{}: {}. Using device defaults.", fmt.width, fmt.height, e);
        }

        let actual = device.format()
            .map_err(|e| UnlockError::DeviceUnavailable(format!("Failed to get final format: {}", e)))?;

        if !is_supported(&actual.fourcc) {
            return Err(UnlockError::DeviceUnavailable(format!(
                "Unsupported pixel format {}", actual.fourcc
            )));
        }

        if actual.width != self.config.width || actual.height != self.config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width, actual.height, self.config.width, self.config.height
            );
        }

        tracing::info!("Opened /dev/video{} at {}x{} {}", index, actual.width, actual.height, actual.fourcc);
        Ok((device, actual))
    }
}

impl CameraProvider for V4l2Camera {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let (device, format) = self.open_device()?;
        let slot = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let warmup = self.config.warmup_frames;

        let (started_tx, started_rx) = mpsc::channel();
        let reader_slot = slot.clone();
        let reader_stop = stop.clone();
        std::thread::Builder::new()
            .name("v4l2-reader".into())
            .spawn(move || read_frames(device, format, warmup, reader_slot, reader_stop, started_tx))
            .map_err(|e| UnlockError::DeviceUnavailable(format!("Failed to start reader: {}", e)))?;

        wait_for_stream(&started_rx, &stop, STREAM_START_TIMEOUT)?;
        Ok(Box::new(V4l2Stream { slot, stop }))
    }
}

/// Block until the reader reports whether streaming started. Any failure,
/// including a reader that never answers, means the device is unavailable.
fn wait_for_stream(
    started: &mpsc::Receiver<std::result::Result<(), String>>,
    stop: &AtomicBool,
    timeout: Duration,
) -> Result<()> {
    let failure = match started.recv_timeout(timeout) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(msg)) => msg,
        Err(mpsc::RecvTimeoutError::Timeout) => format!("Camera stream did not start within {:?}", timeout),
        Err(mpsc::RecvTimeoutError::Disconnected) => "Camera reader exited before streaming".to_string(),
    };
    stop.store(true, Ordering::Release);
    Err(UnlockError::DeviceUnavailable(failure))
}

struct V4l2Stream {
    slot: Arc<Mutex<Option<DynamicImage>>>,
    stop: Arc<AtomicBool>,
}

impl FrameSource for V4l2Stream {
    fn latest_frame(&mut self) -> Result<Option<DynamicImage>> {
        Ok(self.slot.lock().take())
    }

    fn stop(&mut self) {
        // The reader owns the device and closes it when it sees the flag.
        // It is not joined: a frozen driver must not block release.
        self.stop.store(true, Ordering::Release);
    }
}

fn read_frames(
    mut device: Device,
    format: v4l::Format,
    warmup: u32,
    slot: Arc<Mutex<Option<DynamicImage>>>,
    stop: Arc<AtomicBool>,
    started: mpsc::Sender<std::result::Result<(), String>>,
) {
    let mut stream = match v4l::io::mmap::Stream::with_buffers(&mut device, Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = started.send(Err(format!("Failed to create capture stream: {}", e)));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);

    // The first dequeue queues the buffers and turns streaming on, so its
    // result decides whether the open succeeded.
    let mut started = Some(started);
    let mut seen = 0u32;
    while !stop.load(Ordering::Acquire) {
        let next = stream.next();
        if let Some(started) = started.take() {
            match &next {
                Err(e) if e.kind() != io::ErrorKind::TimedOut => {
                    let _ = started.send(Err(format!("Failed to start streaming: {}", e)));
                    return;
                }
                _ => {
                    let _ = started.send(Ok(()));
                }
            }
        }

        let (buf, _meta) = match next {
            Ok(frame) => frame,
            // Frozen stream: keep polling the stop flag; staleness is judged upstream.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!("Camera read failed, reader exiting: {}", e);
                return;
            }
        };

        seen += 1;
        if seen <= warmup {
            continue;
        }

        match decode_frame(buf, &format) {
            Ok(image) => *slot.lock() = Some(image),
            Err(e) => tracing::debug!("Dropping undecodable frame: {}", e),
        }
    }

    tracing::debug!("Camera reader stopped after {} frames", seen);
}

fn decode_frame(buf: &[u8], format: &v4l::Format) -> Result<DynamicImage> {
    let pixels = (format.width * format.height) as usize;

    match &format.fourcc.repr {
        b"GREY" => {
            let data = buf.get(..pixels)
                .ok_or_else(|| UnlockError::Camera("Short GREY frame".into()))?;
            GrayImage::from_raw(format.width, format.height, data.to_vec())
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| UnlockError::Camera("Failed to create grayscale image buffer".into()))
        }
        b"YUYV" => {
            // Y0 U Y1 V: every even byte is luma.
            let luma: Vec<u8> = buf.iter().step_by(2).take(pixels).copied().collect();
            if luma.len() < pixels {
                return Err(UnlockError::Camera("Short YUYV frame".into()));
            }
            GrayImage::from_raw(format.width, format.height, luma)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| UnlockError::Camera("Failed to create luma image buffer".into()))
        }
        b"MJPG" => Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?),
        other => Err(UnlockError::Camera(format!("Unsupported format {:?}", other))),
    }
}

fn is_grayscale(fourcc: &FourCC) -> bool {
    matches!(&fourcc.repr, b"GREY" | b"Y8  " | b"Y16 ")
}

fn is_supported(fourcc: &FourCC) -> bool {
    matches!(&fourcc.repr, b"GREY" | b"YUYV" | b"MJPG")
}

fn video_indices() -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir("/dev")? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(index) = name.to_str()
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            indices.push(index);
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(fourcc: &[u8; 4], width: u32, height: u32) -> v4l::Format {
        v4l::Format::new(width, height, FourCC::new(fourcc))
    }

    #[test]
    fn test_stream_failure_is_device_unavailable() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();
        tx.send(Err("VIDIOC_REQBUFS: Device or resource busy".to_string())).unwrap();

        let err = wait_for_stream(&rx, &stop, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, UnlockError::DeviceUnavailable(msg) if msg.contains("busy")));
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_reader_exit_or_silence_is_device_unavailable() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<std::result::Result<(), String>>();
        drop(tx);
        assert!(matches!(wait_for_stream(&rx, &stop, Duration::from_millis(50)), Err(UnlockError::DeviceUnavailable(_))));

        let stop = AtomicBool::new(false);
        let (_tx, rx) = mpsc::channel::<std::result::Result<(), String>>();
        assert!(matches!(wait_for_stream(&rx, &stop, Duration::from_millis(20)), Err(UnlockError::DeviceUnavailable(_))));
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_started_stream_opens() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();
        tx.send(Ok(())).unwrap();
        assert!(wait_for_stream(&rx, &stop, Duration::from_millis(50)).is_ok());
        assert!(!stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_decode_grey() {
        let buf: Vec<u8> = (0..12).collect();
        let image = decode_frame(&buf, &format(b"GREY", 4, 3)).unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        assert_eq!(image.to_luma8().get_pixel(1, 0)[0], 1);
    }

    #[test]
    fn test_decode_yuyv_keeps_luma() {
        // Two pixels per macropixel: Y0=10 U Y1=20 V
        let buf = vec![10, 128, 20, 128, 30, 128, 40, 128];
        let image = decode_frame(&buf, &format(b"YUYV", 2, 2)).unwrap().to_luma8();
        assert_eq!(image.as_raw(), &vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_short_frame_is_error() {
        let buf = vec![0u8; 5];
        assert!(decode_frame(&buf, &format(b"GREY", 4, 4)).is_err());
    }

    #[test]
    fn test_unsupported_format_is_error() {
        assert!(decode_frame(&[0u8; 16], &format(b"RGB3", 2, 2)).is_err());
    }
}
