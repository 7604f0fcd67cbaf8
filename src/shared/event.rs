// This is free and unencumbered software released into the public domain.

use super::{CameraId, CameraMode, SessionKind};
use serde_json::{Value, json};
use std::sync::mpsc::{SyncSender, TrySendError};

/// Effects the engine wants the UI to show.
#[derive(Clone, Debug, PartialEq)]
pub enum CaptureEvent {
    CameraOpened { camera: CameraId },
    SessionReady { camera: CameraId, kind: SessionKind },
    ShutterEnabled(bool),
    FocusSettled { camera: CameraId, focused: bool },
    PictureTaken { camera: CameraId },
    ImageSaved { title: String, location: String },
    LongshotProgress { taken: u32, limit: u32 },
    LongshotFinished { taken: u32 },
    RecordingStarted { camera: CameraId, high_speed: bool },
    RecordingStopped { camera: CameraId },
    ReviewRequested,
    ModeChanged(CameraMode),
    Warning(String),
    ConfigurationFailed { camera: CameraId, reason: String },
    UnrecoverableDeviceError { camera: CameraId, code: i32 },
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CameraOpened { .. } => "camera-opened",
            Self::SessionReady { .. } => "session-ready",
            Self::ShutterEnabled(_) => "shutter-enabled",
            Self::FocusSettled { .. } => "focus-settled",
            Self::PictureTaken { .. } => "picture-taken",
            Self::ImageSaved { .. } => "image-saved",
            Self::LongshotProgress { .. } => "longshot-progress",
            Self::LongshotFinished { .. } => "longshot-finished",
            Self::RecordingStarted { .. } => "recording-started",
            Self::RecordingStopped { .. } => "recording-stopped",
            Self::ReviewRequested => "review-requested",
            Self::ModeChanged(_) => "mode-changed",
            Self::Warning(_) => "warning",
            Self::ConfigurationFailed { .. } => "configuration-failed",
            Self::UnrecoverableDeviceError { .. } => "device-error",
        }
    }

    pub fn to_json(&self) -> Value {
        let event = self.name();
        match self {
            Self::CameraOpened { camera } | Self::PictureTaken { camera } => {
                json!({ "event": event, "camera": camera.0 })
            },
            Self::SessionReady { camera, kind } => {
                json!({ "event": event, "camera": camera.0, "kind": kind.to_string() })
            },
            Self::ShutterEnabled(enabled) => json!({ "event": event, "enabled": enabled }),
            Self::FocusSettled { camera, focused } => {
                json!({ "event": event, "camera": camera.0, "focused": focused })
            },
            Self::ImageSaved { title, location } => {
                json!({ "event": event, "title": title, "location": location })
            },
            Self::LongshotProgress { taken, limit } => {
                json!({ "event": event, "taken": taken, "limit": limit })
            },
            Self::LongshotFinished { taken } => json!({ "event": event, "taken": taken }),
            Self::RecordingStarted { camera, high_speed } => {
                json!({ "event": event, "camera": camera.0, "high_speed": high_speed })
            },
            Self::RecordingStopped { camera } => json!({ "event": event, "camera": camera.0 }),
            Self::ReviewRequested => json!({ "event": event }),
            Self::ModeChanged(mode) => json!({ "event": event, "mode": mode.to_string() }),
            Self::Warning(message) => json!({ "event": event, "message": message }),
            Self::ConfigurationFailed { camera, reason } => {
                json!({ "event": event, "camera": camera.0, "reason": reason })
            },
            Self::UnrecoverableDeviceError { camera, code } => {
                json!({ "event": event, "camera": camera.0, "code": code })
            },
        }
    }
}

/// Posts without ever blocking the caller. A full queue drops the event.
pub fn post_event(events: &SyncSender<CaptureEvent>, event: CaptureEvent) {
    match events.try_send(event) {
        Ok(()) => {},
        Err(TrySendError::Full(event)) => debug!(event = event.name(), "UI queue full, event dropped"),
        Err(TrySendError::Disconnected(_)) => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, rx) = sync_channel(1);
        post_event(&tx, CaptureEvent::ShutterEnabled(true));
        post_event(&tx, CaptureEvent::ShutterEnabled(false));
        assert_eq!(rx.try_recv().unwrap(), CaptureEvent::ShutterEnabled(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn json_shape() {
        let v = CaptureEvent::LongshotProgress { taken: 3, limit: 5 }.to_json();
        assert_eq!(v["event"], "longshot-progress");
        assert_eq!(v["taken"], 3);
    }
}
