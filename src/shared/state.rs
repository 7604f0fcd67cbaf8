// This is free and unencumbered software released into the public domain.

//! Per-camera 3A capture state machine.
//!
//! A still capture walks `Preview → WaitingAfLock → (WaitingPrecapture) →
//! WaitingAeLock → PictureTaken`, driven by metadata samples. The machine
//! never talks to the HAL directly: every side effect goes through a
//! [`RequestIssuer`], and the new state and token are committed only after
//! the issuer accepted the request. A failed submission is logged and leaves
//! the state untouched.
//!
//! Missing AE metadata counts as converged everywhere, and a zero (absent)
//! lock token accepts any result. Both keep HALs that omit fields from
//! stalling a capture.
//!
//! In dual mode the Bayer and mono cameras each run their own machine and
//! park in `AfAeLocked`; the second one to arrive fires both captures.

use super::{
    AeState, AfState, CameraId, CaptureError, CaptureResult, DualPair, FlashPolicy,
    PrecaptureTrigger, RequestToken,
};
use derive_more::Display;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CaptureState {
    #[display("preview")]
    Preview,
    #[display("waiting-af-lock")]
    WaitingAfLock,
    #[display("waiting-precapture")]
    WaitingPrecapture,
    #[display("waiting-ae-lock")]
    WaitingAeLock,
    #[display("picture-taken")]
    PictureTaken,
    #[display("waiting-touch-focus")]
    WaitingTouchFocus,
    #[display("af-ae-locked")]
    AfAeLocked,
    #[display("waiting-af-locking")]
    WaitingAfLocking,
    #[display("waiting-af-ae-lock")]
    WaitingAfAeLock,
    #[display("closed")]
    Closed,
}

impl CaptureState {
    /// States from which a new user action may start.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Preview | Self::WaitingTouchFocus | Self::AfAeLocked)
    }
}

/// Side effects the state machine asks for. Implemented by the engine.
pub trait RequestIssuer {
    /// Submits a single AF-trigger request.
    fn lock_focus(&mut self, camera: CameraId) -> Result<RequestToken, CaptureError>;

    /// Submits a single AE precapture-trigger request.
    fn run_precapture(&mut self, camera: CameraId) -> Result<RequestToken, CaptureError>;

    /// Re-issues the repeating request with AE locked.
    fn lock_exposure(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    fn capture_still(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    /// Keeps the preview running unchanged while waiting for a dual partner.
    fn hold_preview(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    fn stop_preview(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    /// Cancels any AF trigger and resumes continuous AF with AE unlocked.
    fn unlock_focus(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    /// Starts a touch AF scan over the current regions.
    fn auto_focus(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    fn touch_precapture(
        &mut self,
        camera: CameraId,
        trigger: PrecaptureTrigger,
    ) -> Result<RequestToken, CaptureError>;

    fn focus_settled(&mut self, camera: CameraId, focused: bool);
}

/// Inputs that shape decisions but do not change during a capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraContext {
    pub flash: FlashPolicy,
    /// No usable AF (no AF unit or a fixed-focus scene). An inactive AF
    /// state then counts as locked.
    pub fixed_focus: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DualContext {
    pub pair: DualPair,
    /// Whether the mono stream stays visible while waiting for the Bayer.
    pub mono_preview: bool,
}

#[derive(Debug, Default)]
struct TouchFocus {
    precapture: Option<RequestToken>,
    reported: bool,
}

#[derive(Debug)]
struct CameraFsm {
    state: CaptureState,
    lock_token: Option<RequestToken>,
    precapture_token: Option<RequestToken>,
    touch: TouchFocus,
    ctx: CameraContext,
}

impl CameraFsm {
    fn new(ctx: CameraContext) -> Self {
        Self {
            state: CaptureState::Preview,
            lock_token: None,
            precapture_token: None,
            touch: TouchFocus::default(),
            ctx,
        }
    }

    fn enter(&mut self, state: CaptureState) {
        trace!(from = %self.state, to = %state, "capture state");
        self.state = state;
    }

    fn reset(&mut self, state: CaptureState) {
        self.enter(state);
        self.lock_token = None;
        self.precapture_token = None;
        self.touch = TouchFocus::default();
    }
}

#[derive(Debug, Default)]
pub struct CaptureStateMachine {
    cameras: BTreeMap<CameraId, CameraFsm>,
    dual: Option<DualContext>,
}

impl CaptureStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `camera` in `Preview`, or resets it there if already known.
    pub fn register(&mut self, camera: CameraId, ctx: CameraContext) {
        self.cameras
            .entry(camera)
            .and_modify(|fsm| {
                fsm.ctx = ctx;
                fsm.reset(CaptureState::Preview);
            })
            .or_insert_with(|| CameraFsm::new(ctx));
    }

    pub fn set_context(&mut self, camera: CameraId, ctx: CameraContext) {
        if let Some(fsm) = self.cameras.get_mut(&camera) {
            fsm.ctx = ctx;
        }
    }

    pub fn set_dual(&mut self, dual: Option<DualContext>) {
        self.dual = dual;
    }

    pub fn remove(&mut self, camera: CameraId) {
        self.cameras.remove(&camera);
    }

    pub fn clear(&mut self) {
        self.cameras.clear();
        self.dual = None;
    }

    pub fn state(&self, camera: CameraId) -> Option<CaptureState> {
        self.cameras.get(&camera).map(|f| f.state)
    }

    pub fn lock_token(&self, camera: CameraId) -> Option<RequestToken> {
        self.cameras.get(&camera).and_then(|f| f.lock_token)
    }

    pub fn precapture_token(&self, camera: CameraId) -> Option<RequestToken> {
        self.cameras.get(&camera).and_then(|f| f.precapture_token)
    }

    /// Returns `camera` to `Preview` with every token cleared.
    pub fn reset(&mut self, camera: CameraId) {
        if let Some(fsm) = self.cameras.get_mut(&camera) {
            fsm.reset(CaptureState::Preview);
        }
    }

    pub fn close(&mut self, camera: CameraId) {
        if let Some(fsm) = self.cameras.get_mut(&camera) {
            fsm.reset(CaptureState::Closed);
        }
    }

    pub fn close_all(&mut self) {
        for fsm in self.cameras.values_mut() {
            fsm.reset(CaptureState::Closed);
        }
    }

    fn camera_mut(&mut self, camera: CameraId) -> Result<&mut CameraFsm, CaptureError> {
        let fsm = self
            .cameras
            .get_mut(&camera)
            .ok_or_else(|| CaptureError::not_ready(format!("camera {camera} is not running")))?;
        if fsm.state == CaptureState::Closed {
            return Err(CaptureError::Closed);
        }
        Ok(fsm)
    }

    /// Starts the AF → AE → capture sequence.
    pub fn lock_focus(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if fsm.state == CaptureState::PictureTaken {
            return Err(CaptureError::not_ready("a picture is already being taken"));
        }
        let token = issuer.lock_focus(camera)?;
        fsm.reset(CaptureState::WaitingAfLock);
        fsm.lock_token = Some(token);
        Ok(())
    }

    /// Locks AF and AE without capturing, ending in `AfAeLocked`.
    pub fn lock_af_ae(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if !fsm.state.is_idle() {
            return Err(CaptureError::not_ready(format!(
                "cannot lock 3A while {}",
                fsm.state
            )));
        }
        let token = issuer.lock_focus(camera)?;
        fsm.reset(CaptureState::WaitingAfLocking);
        fsm.lock_token = Some(token);
        Ok(())
    }

    /// Captures immediately, skipping 3A convergence. Used for
    /// zero-shutter-lag, longshot and an already locked camera.
    pub fn capture_now(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if !fsm.state.is_idle() {
            return Err(CaptureError::not_ready(format!(
                "cannot capture while {}",
                fsm.state
            )));
        }
        issuer.capture_still(camera)?;
        fsm.reset(CaptureState::PictureTaken);
        Ok(())
    }

    /// Issues the next frame of a burst.
    pub fn capture_next(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if fsm.state != CaptureState::PictureTaken {
            return Err(CaptureError::not_ready("no burst in progress"));
        }
        issuer.capture_still(camera)
    }

    pub fn autofocus_trigger(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if !matches!(
            fsm.state,
            CaptureState::Preview | CaptureState::WaitingTouchFocus
        ) {
            return Err(CaptureError::not_ready(format!(
                "cannot touch-focus while {}",
                fsm.state
            )));
        }
        issuer.auto_focus(camera)?;
        fsm.reset(CaptureState::WaitingTouchFocus);
        Ok(())
    }

    pub fn cancel_touch_focus(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        if fsm.state != CaptureState::WaitingTouchFocus {
            return Ok(());
        }
        if fsm.touch.precapture.is_some() {
            issuer.touch_precapture(camera, PrecaptureTrigger::Cancel)?;
            fsm.touch.precapture = None;
        }
        issuer.unlock_focus(camera)?;
        fsm.reset(CaptureState::Preview);
        Ok(())
    }

    pub fn unlock_focus(
        &mut self,
        camera: CameraId,
        issuer: &mut dyn RequestIssuer,
    ) -> Result<(), CaptureError> {
        let fsm = self.camera_mut(camera)?;
        issuer.unlock_focus(camera)?;
        fsm.reset(CaptureState::Preview);
        Ok(())
    }

    /// Advances the machine of `result.camera` by one metadata sample.
    pub fn on_result(&mut self, result: &CaptureResult, issuer: &mut dyn RequestIssuer) {
        let Some(state) = self.state(result.camera) else {
            return;
        };
        match state {
            CaptureState::WaitingAfLock => self.on_af_lock_sample(result, issuer, false),
            CaptureState::WaitingAfLocking => self.on_af_lock_sample(result, issuer, true),
            CaptureState::WaitingPrecapture => self.on_precapture_sample(result, issuer),
            CaptureState::WaitingAeLock => {
                if matches!(result.ae_state, None | Some(AeState::Locked)) {
                    self.capture_path(result.camera, issuer);
                }
            },
            CaptureState::WaitingAfAeLock => {
                if matches!(result.ae_state, None | Some(AeState::Locked))
                    && let Some(fsm) = self.cameras.get_mut(&result.camera)
                {
                    fsm.enter(CaptureState::AfAeLocked);
                }
            },
            CaptureState::WaitingTouchFocus => self.on_touch_sample(result, issuer),
            CaptureState::Preview
            | CaptureState::PictureTaken
            | CaptureState::AfAeLocked
            | CaptureState::Closed => {},
        }
    }

    fn on_af_lock_sample(
        &mut self,
        result: &CaptureResult,
        issuer: &mut dyn RequestIssuer,
        hold: bool,
    ) {
        let camera = result.camera;
        let Some(fsm) = self.cameras.get_mut(&camera) else {
            return;
        };

        if let Some(token) = fsm.lock_token {
            fsm.lock_token = None;
            if token != result.token {
                debug!(%camera, expected = %token, got = %result.token, "stale AF lock result");
                return;
            }
        }

        if !af_settled(result.af_state, fsm.ctx.fixed_focus) {
            return;
        }

        let flash = fsm.ctx.flash;
        let ae = result.ae_state;
        if hold {
            self.lock_exposure(camera, issuer, CaptureState::WaitingAfAeLock);
            return;
        }

        if self.is_mono(camera) {
            if matches!(ae, None | Some(AeState::Locked)) {
                self.capture_path(camera, issuer);
            } else if let Some(fsm) = self.cameras.get_mut(&camera) {
                fsm.enter(CaptureState::WaitingAeLock);
            }
            return;
        }

        let flash_required = match flash {
            FlashPolicy::On => true,
            FlashPolicy::Auto => ae == Some(AeState::FlashRequired),
            FlashPolicy::Off | FlashPolicy::Torch => false,
        };
        let ae_ready = matches!(ae, None | Some(AeState::Converged) | Some(AeState::Locked));

        if ae_ready && !flash_required {
            self.lock_exposure(camera, issuer, CaptureState::WaitingAeLock);
        } else {
            self.run_precapture(camera, issuer);
        }
    }

    fn on_precapture_sample(&mut self, result: &CaptureResult, issuer: &mut dyn RequestIssuer) {
        let camera = result.camera;
        let Some(fsm) = self.cameras.get_mut(&camera) else {
            return;
        };
        match result.ae_state {
            None | Some(AeState::Inactive) => {
                fsm.precapture_token = None;
                self.capture_path(camera, issuer);
            },
            Some(
                AeState::Precapture | AeState::FlashRequired | AeState::Converged | AeState::Locked,
            ) => {
                if let Some(token) = fsm.precapture_token
                    && token != result.token
                {
                    return;
                }
                fsm.precapture_token = None;
                self.lock_exposure(camera, issuer, CaptureState::WaitingAeLock);
            },
            Some(AeState::Searching) => {},
        }
    }

    fn on_touch_sample(&mut self, result: &CaptureResult, issuer: &mut dyn RequestIssuer) {
        let camera = result.camera;
        let Some(fsm) = self.cameras.get_mut(&camera) else {
            return;
        };

        if let Some(token) = fsm.touch.precapture {
            if token == result.token {
                fsm.touch.precapture = None;
                if let Err(e) = issuer.touch_precapture(camera, PrecaptureTrigger::Idle) {
                    warn!(%camera, error = %e, "failed to reset touch precapture");
                }
            }
            return;
        }

        if fsm.touch.reported || !af_settled(result.af_state, fsm.ctx.fixed_focus) {
            return;
        }
        fsm.touch.reported = true;
        issuer.focus_settled(camera, result.af_state != Some(AfState::NotFocusedLocked));

        if fsm.ctx.flash == FlashPolicy::Auto && result.ae_state == Some(AeState::FlashRequired) {
            match issuer.touch_precapture(camera, PrecaptureTrigger::Start) {
                Ok(token) => fsm.touch.precapture = Some(token),
                Err(e) => warn!(%camera, error = %e, "failed to start touch precapture"),
            }
        }
    }

    fn lock_exposure(&mut self, camera: CameraId, issuer: &mut dyn RequestIssuer, next: CaptureState) {
        match issuer.lock_exposure(camera) {
            Ok(()) => {
                if let Some(fsm) = self.cameras.get_mut(&camera) {
                    fsm.enter(next);
                }
            },
            Err(e) => warn!(%camera, error = %e, "failed to lock exposure"),
        }
    }

    fn run_precapture(&mut self, camera: CameraId, issuer: &mut dyn RequestIssuer) {
        match issuer.run_precapture(camera) {
            Ok(token) => {
                if let Some(fsm) = self.cameras.get_mut(&camera) {
                    fsm.enter(CaptureState::WaitingPrecapture);
                    fsm.precapture_token = Some(token);
                }
            },
            Err(e) => warn!(%camera, error = %e, "failed to run precapture"),
        }
    }

    fn is_mono(&self, camera: CameraId) -> bool {
        self.dual.is_some_and(|d| d.pair.mono == camera)
    }

    fn capture_path(&mut self, camera: CameraId, issuer: &mut dyn RequestIssuer) {
        let dual = self
            .dual
            .filter(|d| d.pair.bayer == camera || d.pair.mono == camera);
        let Some(dual) = dual else {
            match issuer.capture_still(camera) {
                Ok(()) => {
                    if let Some(fsm) = self.cameras.get_mut(&camera) {
                        fsm.enter(CaptureState::PictureTaken);
                    }
                },
                Err(e) => warn!(%camera, error = %e, "failed to capture still"),
            }
            return;
        };

        if let Some(fsm) = self.cameras.get_mut(&camera) {
            fsm.enter(CaptureState::AfAeLocked);
        }
        let parked = if camera == dual.pair.mono && !dual.mono_preview {
            issuer.stop_preview(camera)
        } else {
            issuer.hold_preview(camera)
        };
        if let Err(e) = parked {
            warn!(%camera, error = %e, "failed to park preview");
        }

        let pair = [dual.pair.bayer, dual.pair.mono];
        if !pair
            .iter()
            .all(|id| self.state(*id) == Some(CaptureState::AfAeLocked))
        {
            return;
        }

        for id in pair {
            if let Some(fsm) = self.cameras.get_mut(&id) {
                fsm.enter(CaptureState::PictureTaken);
            }
        }
        // The mono still is only useful next to a bayer one.
        if let Err(e) = issuer.capture_still(dual.pair.bayer) {
            warn!(camera = %dual.pair.bayer, error = %e, "failed to capture dual still");
            for id in pair {
                if let Err(e) = issuer.unlock_focus(id) {
                    debug!(camera = %id, error = %e, "failed to unlock after a dual capture failure");
                }
                if let Some(fsm) = self.cameras.get_mut(&id) {
                    fsm.reset(CaptureState::Preview);
                }
            }
            return;
        }
        if let Err(e) = issuer.capture_still(dual.pair.mono) {
            warn!(camera = %dual.pair.mono, error = %e, "failed to capture dual still");
            if let Some(fsm) = self.cameras.get_mut(&dual.pair.mono) {
                fsm.reset(CaptureState::Preview);
            }
        }
    }
}

fn af_settled(af: Option<AfState>, fixed_focus: bool) -> bool {
    match af {
        None => true,
        Some(AfState::Inactive) => fixed_focus,
        Some(state) => state.is_locked(),
    }
}
