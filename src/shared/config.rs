// This is free and unencumbered software released into the public domain.

use derive_more::Display;
use std::time::Duration;

/// How the capture session was launched. Fixed for the lifetime of an engine.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum CaptureIntentMode {
    #[default]
    #[display("normal")]
    Normal,
    /// Another application asked for a single still.
    #[display("still")]
    StillCaptureIntent,
    /// Another application asked for a single video.
    #[display("video")]
    VideoCaptureIntent,
    /// Still capture from the lock screen.
    #[display("secure-still")]
    SecureStillCaptureIntent,
}

impl CaptureIntentMode {
    pub fn is_still_intent(self) -> bool {
        matches!(
            self,
            Self::StillCaptureIntent | Self::SecureStillCaptureIntent
        )
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub surface_timeout: Duration,
    pub touch_focus_timeout: Duration,
    pub tick_interval: Duration,
    pub intent_mode: CaptureIntentMode,
    pub preview_size: (u32, u32),
    pub picture_size: (u32, u32),
    pub video_size: (u32, u32),
    pub longshot_limit: u32,
    pub low_storage_threshold: u64,
    pub save_queue_capacity: usize,
    pub event_capacity: usize,
    pub diagnostics: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_millis(5000),
            close_timeout: Duration::from_millis(2000),
            surface_timeout: Duration::from_millis(2000),
            touch_focus_timeout: Duration::from_millis(3000),
            tick_interval: Duration::from_millis(50),
            intent_mode: CaptureIntentMode::Normal,
            preview_size: (1920, 1080),
            picture_size: (4000, 3000),
            video_size: (1920, 1080),
            longshot_limit: 20,
            low_storage_threshold: 50 * 1024 * 1024,
            save_queue_capacity: 8,
            event_capacity: 64,
            diagnostics: false,
        }
    }
}

impl CaptureConfig {
    pub fn new(intent_mode: CaptureIntentMode) -> Self {
        Self {
            intent_mode,
            ..Default::default()
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_surface_timeout(mut self, timeout: Duration) -> Self {
        self.surface_timeout = timeout;
        self
    }

    pub fn with_touch_focus_timeout(mut self, timeout: Duration) -> Self {
        self.touch_focus_timeout = timeout;
        self
    }

    pub fn with_preview_size(mut self, width: u32, height: u32) -> Self {
        self.preview_size = (width, height);
        self
    }

    pub fn with_picture_size(mut self, width: u32, height: u32) -> Self {
        self.picture_size = (width, height);
        self
    }

    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.video_size = (width, height);
        self
    }

    pub fn with_longshot_limit(mut self, n: u32) -> Self {
        self.longshot_limit = n.max(1);
        self
    }

    pub fn with_low_storage_threshold(mut self, bytes: u64) -> Self {
        self.low_storage_threshold = bytes;
        self
    }

    pub fn with_save_queue_capacity(mut self, n: usize) -> Self {
        self.save_queue_capacity = n.max(1);
        self
    }

    pub fn with_event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n.max(1);
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }
}
