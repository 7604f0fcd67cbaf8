// This is free and unencumbered software released into the public domain.

use super::{CameraId, CameraMode};
use std::{error::Error as StdError, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera {camera} is busy: timed out after {timeout:?} waiting for the open/close lock")]
    ResourceBusy { camera: CameraId, timeout: Duration },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("capture session for camera {0} is closed")]
    SessionClosed(CameraId),

    #[error("a session configuration is already in progress")]
    ConfigurationInProgress,

    #[error("session configuration failed for camera {camera}: {reason}")]
    ConfigurationFailed { camera: CameraId, reason: String },

    #[error("camera {camera} reported an unrecoverable device error (code {code})")]
    UnrecoverableDevice { camera: CameraId, code: i32 },

    #[error("camera access failed while {context}")]
    CameraAccess {
        context: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("crop region for camera {0} is not set")]
    CropRegionUnset(CameraId),

    #[error("no camera device available")]
    NoCamera,

    #[error("no camera topology for mode {0}")]
    NoTopology(CameraMode),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("low storage: {available} bytes available, {required} required")]
    LowStorage { available: u64, required: u64 },

    #[error("low memory")]
    LowMemory,

    #[error("capture engine closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl CaptureError {
    #[inline]
    pub fn access(context: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::CameraAccess {
            context,
            source: Box::new(source),
        }
    }

    #[inline]
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    #[inline]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    #[inline]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    #[inline]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the error takes the whole capture pipeline down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnrecoverableDevice { .. })
    }
}
