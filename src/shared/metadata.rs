// This is free and unencumbered software released into the public domain.

use super::{CameraId, CaptureIntent, RequestToken, SessionHandle, VendorTags};
use derive_more::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum AfState {
    #[display("inactive")]
    Inactive,
    #[display("passive-scan")]
    PassiveScan,
    #[display("passive-focused")]
    PassiveFocused,
    #[display("active-scan")]
    ActiveScan,
    #[display("focused-locked")]
    FocusedLocked,
    #[display("not-focused-locked")]
    NotFocusedLocked,
    #[display("passive-unfocused")]
    PassiveUnfocused,
}

impl AfState {
    /// AF has finished a triggered scan, successfully or not.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::FocusedLocked | Self::NotFocusedLocked)
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum AeState {
    #[display("inactive")]
    Inactive,
    #[display("searching")]
    Searching,
    #[display("converged")]
    Converged,
    #[display("locked")]
    Locked,
    #[display("flash-required")]
    FlashRequired,
    #[display("precapture")]
    Precapture,
}

/// Per-frame metadata delivered by the HAL. Either state may be absent.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureResult {
    pub camera: CameraId,
    pub token: RequestToken,
    pub intent: CaptureIntent,
    /// The session that produced the frame, when the HAL reports it.
    pub session: Option<SessionHandle>,
    /// Partial results arrive before the final one for the same frame.
    pub partial: bool,
    pub frame_number: u64,
    pub timestamp_ns: u64,
    pub af_state: Option<AfState>,
    pub ae_state: Option<AeState>,
    pub vendor: VendorTags,
}

impl CaptureResult {
    pub fn new(camera: CameraId, token: RequestToken, intent: CaptureIntent) -> Self {
        Self {
            camera,
            token,
            intent,
            session: None,
            partial: false,
            frame_number: 0,
            timestamp_ns: 0,
            af_state: None,
            ae_state: None,
            vendor: VendorTags::default(),
        }
    }

    pub fn with_af(mut self, state: impl Into<Option<AfState>>) -> Self {
        self.af_state = state.into();
        self
    }

    pub fn with_ae(mut self, state: impl Into<Option<AeState>>) -> Self {
        self.ae_state = state.into();
        self
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_timestamp(mut self, frame_number: u64, timestamp_ns: u64) -> Self {
        self.frame_number = frame_number;
        self.timestamp_ns = timestamp_ns;
        self
    }
}
