pub mod camera;
pub mod common;
pub mod core;
pub mod storage;

pub use crate::camera::{CameraProvider, DeviceHandle, FrameSource, V4l2Camera};
pub use crate::common::{Config, UnlockConfig, UnlockError, Result};
pub use crate::core::{
    CaptureGate, FaceMatcher, GateState, PresenceDetector, ReferenceDescriptor, UnlockController,
    UnlockOutcome, UnlockSession, VerificationVerdict,
};
pub use crate::storage::{FilesystemReferenceStore, ReferenceStore};
