use std::time::Duration;
use thiserror::Error;

use crate::core::gate::GateState;

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Camera stream stalled: no new frame for {0:?}")]
    StreamStalled(Duration),

    #[error("Camera handle already released")]
    DeviceReleased,

    #[error("Capture not allowed in state {0}")]
    NotReady(GateState),

    #[error("Unlock session already finished")]
    SessionFinished,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl UnlockError {
    /// Faults that a fresh device acquisition can clear.
    pub fn is_stream_fault(&self) -> bool {
        matches!(self, UnlockError::StreamStalled(_))
    }
}

pub type Result<T> = std::result::Result<T, UnlockError>;
