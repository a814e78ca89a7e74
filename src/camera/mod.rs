pub mod handle;
pub mod v4l2;

pub use handle::{DeviceHandle, SharedDevice};
pub use v4l2::{V4l2Camera, CameraInfo};

use crate::common::Result;
use image::DynamicImage;

/// A live stream opened by a [`CameraProvider`].
///
/// Implementations must not block in `latest_frame`: a backend reading from
/// hardware keeps its own reader and only hands over what it already has.
pub trait FrameSource: Send {
    /// The newest frame produced since the previous call, or `None` if the
    /// stream has not produced anything new.
    fn latest_frame(&mut self) -> Result<Option<DynamicImage>>;

    /// Stop the stream and free the underlying device. Called at most once.
    fn stop(&mut self);
}

/// Opens camera streams. Failing to open is always `DeviceUnavailable`.
pub trait CameraProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>>;
}
