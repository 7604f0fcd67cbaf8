// This is free and unencumbered software released into the public domain.

use super::{CameraId, RequestToken};
use bytes::Bytes;
use derive_more::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ImageFormat {
    #[display("jpeg")]
    Jpeg,
    #[display("yuv420")]
    Yuv420,
    #[display("raw16")]
    Raw16,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Yuv420 => "yuv",
            Self::Raw16 => "dng",
        }
    }
}

/// An encoded buffer from a capture output surface.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub camera: CameraId,
    pub token: Option<RequestToken>,
    /// Sensor timestamp, monotonic per camera.
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub data: Bytes,
}

impl CapturedImage {
    pub fn new_jpeg(camera: CameraId, timestamp_ns: u64, width: u32, height: u32, data: Bytes) -> Self {
        Self {
            camera,
            token: None,
            timestamp_ns,
            width,
            height,
            format: ImageFormat::Jpeg,
            data,
        }
    }

    pub fn with_token(mut self, token: RequestToken) -> Self {
        self.token = Some(token);
        self
    }
}
