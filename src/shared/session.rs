// This is free and unencumbered software released into the public domain.

//! Capture session planning and lifecycle.
//!
//! Each camera has at most one configured session. Configuration is
//! asynchronous: [`SessionOrchestrator::begin`] hands the surfaces to the HAL
//! and the outcome arrives later tagged with the generation it was started
//! under. While any camera is configuring, further configuration requests
//! are refused. A callback whose generation no longer matches belongs to an
//! attempt that was torn down and is ignored.

use super::{
    CameraHal, CameraId, CameraIdentity, CameraMode, CaptureConfig, CaptureError, CaptureIntent,
    EisMode, HalFeatures, SettingsSnapshot,
};
use derive_more::Display;
use std::{collections::BTreeMap, ops::BitOr};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("surface-{_0}")]
pub struct SurfaceId(pub u64);

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("session-{_0}")]
pub struct SessionHandle(pub u64);

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    #[display("preview")]
    Preview,
    #[display("jpeg")]
    Jpeg,
    #[display("raw")]
    Raw,
    #[display("recorder")]
    Recorder,
    #[display("video-snapshot")]
    VideoSnapshot,
    #[display("reprocess-input")]
    ReprocessInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub kind: SurfaceKind,
    pub width: u32,
    pub height: u32,
}

impl SurfaceSpec {
    pub fn new(kind: SurfaceKind, (width, height): (u32, u32)) -> Self {
        Self {
            kind,
            width,
            height,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Surface {
    pub id: SurfaceId,
    pub camera: CameraId,
    pub spec: SurfaceSpec,
}

/// Vendor operating-mode bits for custom sessions. Opaque to the core.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
#[display("{_0:#x}")]
pub struct OpMode(pub u32);

impl OpMode {
    pub const NONE: OpMode = OpMode(0);
    pub const EIS_REALTIME: OpMode = OpMode(0xF004);
    pub const EIS_LOOKAHEAD: OpMode = OpMode(0xF008);
    pub const FAST_SHUTTER: OpMode = OpMode(0xF010);
    pub const SUPER_SLOW_MOTION: OpMode = OpMode(0xF080);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: OpMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpMode {
    type Output = OpMode;

    fn bitor(self, rhs: OpMode) -> OpMode {
        OpMode(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SessionKind {
    #[display("regular")]
    Regular,
    #[display("reprocessable")]
    Reprocessable,
    #[display("constrained-high-speed")]
    ConstrainedHighSpeed,
    #[display("custom({_0})")]
    Custom(OpMode),
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SessionPurpose {
    #[display("preview")]
    Preview,
    #[display("recording")]
    Recording,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SessionPhase {
    #[display("no-session")]
    NoSession,
    #[display("configuring")]
    Configuring,
    #[display("configured")]
    Configured,
    #[display("closing")]
    Closing,
}

/// What to configure for one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionPlan {
    pub camera: CameraId,
    pub kind: SessionKind,
    pub purpose: SessionPurpose,
    pub specs: Vec<SurfaceSpec>,
    pub high_speed_fps: Option<u32>,
}

pub fn select_kind(
    zsl: bool,
    high_speed: bool,
    op_mode: OpMode,
    features: &HalFeatures,
) -> SessionKind {
    if zsl {
        return SessionKind::Reprocessable;
    }
    if high_speed {
        return SessionKind::ConstrainedHighSpeed;
    }
    if !op_mode.is_empty() {
        if features.custom_session {
            return SessionKind::Custom(op_mode);
        }
        warn!(%op_mode, "custom sessions unsupported, falling back to a regular session");
    }
    SessionKind::Regular
}

pub fn plan_session(
    identity: &CameraIdentity,
    settings: &SettingsSnapshot,
    mode: CameraMode,
    purpose: SessionPurpose,
    features: &HalFeatures,
    config: &CaptureConfig,
) -> SessionPlan {
    let caps = &identity.capabilities;
    let mut specs = vec![SurfaceSpec::new(SurfaceKind::Preview, config.preview_size)];
    let mut op_mode = OpMode::NONE;
    let mut zsl = false;
    let mut high_speed_fps = None;

    match purpose {
        SessionPurpose::Preview => {
            specs.push(SurfaceSpec::new(SurfaceKind::Jpeg, config.picture_size));
            if settings.save_raw {
                specs.push(SurfaceSpec::new(SurfaceKind::Raw, config.picture_size));
            }
            zsl = settings.zsl && !mode.is_video() && caps.reprocessing && features.reprocessing;
            if zsl {
                specs.push(SurfaceSpec::new(
                    SurfaceKind::ReprocessInput,
                    config.picture_size,
                ));
            }
            if settings.fast_shutter {
                op_mode = op_mode | OpMode::FAST_SHUTTER;
            }
        },
        SessionPurpose::Recording => {
            specs.push(SurfaceSpec::new(SurfaceKind::Recorder, config.video_size));
            if mode == CameraMode::Hfr && features.high_speed {
                high_speed_fps = settings
                    .hfr_fps
                    .or_else(|| caps.high_speed_fps.first().copied())
                    .filter(|fps| caps.supports_high_speed(*fps));
            }
            if high_speed_fps.is_none() {
                specs.push(SurfaceSpec::new(
                    SurfaceKind::VideoSnapshot,
                    config.video_size,
                ));
            }
            match settings.eis {
                EisMode::Off => {},
                EisMode::Realtime => op_mode = op_mode | OpMode::EIS_REALTIME,
                EisMode::Lookahead => op_mode = op_mode | OpMode::EIS_LOOKAHEAD,
            }
            if high_speed_fps.is_some() && settings.super_slow_motion {
                op_mode = op_mode | OpMode::SUPER_SLOW_MOTION;
            }
        },
    }

    SessionPlan {
        camera: identity.id,
        kind: select_kind(zsl, high_speed_fps.is_some(), op_mode, features),
        purpose,
        specs,
        high_speed_fps,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionDescriptor {
    pub handle: SessionHandle,
    pub camera: CameraId,
    pub kind: SessionKind,
    pub purpose: SessionPurpose,
    pub surfaces: Vec<Surface>,
    pub high_speed_fps: Option<u32>,
    closed: bool,
}

impl SessionDescriptor {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn surface(&self, kind: SurfaceKind) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.spec.kind == kind)
    }

    /// Output surfaces a request of `intent` should target.
    pub fn targets_for(&self, intent: CaptureIntent) -> Vec<SurfaceId> {
        let kinds: &[SurfaceKind] = match intent {
            CaptureIntent::StillCapture => &[SurfaceKind::Jpeg, SurfaceKind::Raw],
            CaptureIntent::VideoSnapshot => &[SurfaceKind::VideoSnapshot],
            CaptureIntent::VideoRecord => &[SurfaceKind::Preview, SurfaceKind::Recorder],
            _ => &[SurfaceKind::Preview],
        };
        self.surfaces
            .iter()
            .filter(|s| kinds.contains(&s.spec.kind))
            .map(|s| s.id)
            .collect()
    }
}

#[derive(Debug)]
struct SessionSlot {
    phase: SessionPhase,
    generation: u64,
    plan: Option<SessionPlan>,
    pending: Vec<Surface>,
    descriptor: Option<SessionDescriptor>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            phase: SessionPhase::NoSession,
            generation: 0,
            plan: None,
            pending: Vec::new(),
            descriptor: None,
        }
    }
}

#[derive(Debug)]
pub struct SessionFailure {
    pub camera: CameraId,
    pub error: CaptureError,
}

#[derive(Debug)]
pub struct SessionOrchestrator {
    slots: BTreeMap<CameraId, SessionSlot>,
    generation: u64,
}

impl Default for SessionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionOrchestrator {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            generation: 0,
        }
    }

    /// False while any camera is configuring.
    pub fn switch_allowed(&self) -> bool {
        !self
            .slots
            .values()
            .any(|s| s.phase == SessionPhase::Configuring)
    }

    pub fn phase(&self, camera: CameraId) -> SessionPhase {
        self.slots
            .get(&camera)
            .map_or(SessionPhase::NoSession, |s| s.phase)
    }

    pub fn descriptor(&self, camera: CameraId) -> Option<&SessionDescriptor> {
        self.slots
            .get(&camera)
            .and_then(|s| s.descriptor.as_ref())
            .filter(|d| !d.closed)
    }

    /// The configured session of `camera`, or `SessionClosed`.
    pub fn open_session(&self, camera: CameraId) -> Result<&SessionDescriptor, CaptureError> {
        self.descriptor(camera)
            .ok_or(CaptureError::SessionClosed(camera))
    }

    pub fn configured(&self) -> Vec<CameraId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.phase == SessionPhase::Configured)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tears down whatever each planned camera has and starts configuring.
    /// Failures that happen before the HAL accepted the request are returned
    /// so the caller can report them like asynchronous ones.
    pub fn begin(
        &mut self,
        plans: Vec<SessionPlan>,
        hal: &mut dyn CameraHal,
    ) -> Result<Vec<SessionFailure>, CaptureError> {
        if !self.switch_allowed() {
            return Err(CaptureError::ConfigurationInProgress);
        }
        let mut failures = Vec::new();
        for plan in plans {
            let camera = plan.camera;
            self.close(camera, hal);

            let mut surfaces = Vec::with_capacity(plan.specs.len());
            let mut allocation = Ok(());
            for spec in &plan.specs {
                match hal.allocate_surface(camera, *spec) {
                    Ok(surface) => surfaces.push(surface),
                    Err(e) => {
                        allocation = Err(e);
                        break;
                    },
                }
            }
            if let Err(error) = allocation {
                release(hal, &surfaces);
                failures.push(SessionFailure { camera, error });
                continue;
            }

            self.generation += 1;
            let generation = self.generation;
            debug!(%camera, kind = %plan.kind, purpose = %plan.purpose, generation, "configuring session");
            if let Err(error) = hal.create_session(camera, generation, plan.kind, &surfaces) {
                release(hal, &surfaces);
                failures.push(SessionFailure { camera, error });
                continue;
            }

            let slot = self.slots.entry(camera).or_insert_with(SessionSlot::new);
            slot.phase = SessionPhase::Configuring;
            slot.generation = generation;
            slot.plan = Some(plan);
            slot.pending = surfaces;
        }
        Ok(failures)
    }

    /// Completes a configuration. Returns `None` for a stale callback, in
    /// which case the caller must close `handle`.
    pub fn on_configured(
        &mut self,
        camera: CameraId,
        generation: u64,
        handle: SessionHandle,
    ) -> Option<&SessionDescriptor> {
        let slot = self.slots.get_mut(&camera)?;
        if slot.phase != SessionPhase::Configuring || slot.generation != generation {
            debug!(%camera, generation, "ignoring stale session configuration");
            return None;
        }
        let plan = slot.plan.take()?;
        slot.phase = SessionPhase::Configured;
        slot.descriptor = Some(SessionDescriptor {
            handle,
            camera,
            kind: plan.kind,
            purpose: plan.purpose,
            surfaces: std::mem::take(&mut slot.pending),
            high_speed_fps: plan.high_speed_fps,
            closed: false,
        });
        slot.descriptor.as_ref()
    }

    /// Records a failed configuration and releases its surfaces. Returns
    /// `false` for a stale callback.
    pub fn on_configure_failed(
        &mut self,
        camera: CameraId,
        generation: u64,
        hal: &mut dyn CameraHal,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&camera) else {
            return false;
        };
        if slot.phase != SessionPhase::Configuring || slot.generation != generation {
            return false;
        }
        release(hal, &std::mem::take(&mut slot.pending));
        slot.plan = None;
        slot.phase = SessionPhase::NoSession;
        true
    }

    /// Stops, closes and forgets the session of `camera`, releasing its
    /// surfaces. Safe to call repeatedly.
    pub fn close(&mut self, camera: CameraId, hal: &mut dyn CameraHal) {
        let surfaces = self.detach(camera, hal);
        release(hal, &surfaces);
    }

    /// Like [`close`](Self::close) for every camera, but hands the surfaces
    /// back instead of releasing them.
    pub fn detach_all(&mut self, hal: &mut dyn CameraHal) -> Vec<Surface> {
        let cameras: Vec<CameraId> = self.slots.keys().copied().collect();
        cameras
            .into_iter()
            .flat_map(|camera| self.detach(camera, hal))
            .collect()
    }

    fn detach(&mut self, camera: CameraId, hal: &mut dyn CameraHal) -> Vec<Surface> {
        let Some(slot) = self.slots.get_mut(&camera) else {
            return Vec::new();
        };
        let mut surfaces = std::mem::take(&mut slot.pending);
        if slot.phase == SessionPhase::Configuring {
            // Any late callback for this attempt is now stale.
            self.generation += 1;
            slot.generation = self.generation;
        }
        slot.plan = None;
        if let Some(mut descriptor) = slot.descriptor.take()
            && !descriptor.closed
        {
            slot.phase = SessionPhase::Closing;
            if let Err(e) = hal.stop_repeating(descriptor.handle) {
                debug!(%camera, error = %e, "stop repeating on close");
            }
            hal.close_session(descriptor.handle);
            descriptor.closed = true;
            surfaces.append(&mut descriptor.surfaces);
        }
        slot.phase = SessionPhase::NoSession;
        surfaces
    }
}

pub(crate) fn release(hal: &mut dyn CameraHal, surfaces: &[Surface]) {
    for surface in surfaces {
        hal.release_surface(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{CameraRole, Capabilities, Facing, Rect};

    fn identity() -> CameraIdentity {
        CameraIdentity::new(0, CameraRole::Bayer, Facing::Back, Rect::from_size(4000, 3000))
            .with_capabilities(Capabilities {
                reprocessing: true,
                high_speed_fps: vec![120, 240],
                ..Default::default()
            })
    }

    fn features(custom_session: bool) -> HalFeatures {
        HalFeatures {
            custom_session,
            reprocessing: true,
            high_speed: true,
        }
    }

    #[test]
    fn kind_selection_order() {
        let f = features(true);
        assert_eq!(select_kind(true, true, OpMode::EIS_REALTIME, &f), SessionKind::Reprocessable);
        assert_eq!(select_kind(false, true, OpMode::NONE, &f), SessionKind::ConstrainedHighSpeed);
        assert_eq!(
            select_kind(false, false, OpMode::FAST_SHUTTER, &f),
            SessionKind::Custom(OpMode::FAST_SHUTTER)
        );
        assert_eq!(
            select_kind(false, false, OpMode::FAST_SHUTTER, &features(false)),
            SessionKind::Regular
        );
        assert_eq!(select_kind(false, false, OpMode::NONE, &f), SessionKind::Regular);
    }

    #[test]
    fn op_mode_bits_combine() {
        let op = OpMode::EIS_REALTIME | OpMode::SUPER_SLOW_MOTION;
        assert_eq!(op, OpMode(0xF084));
        assert!(op.contains(OpMode::EIS_REALTIME));
        assert!(!op.contains(OpMode::FAST_SHUTTER));
    }

    #[test]
    fn zsl_preview_plan_adds_reprocess_input() {
        let settings = SettingsSnapshot {
            zsl: true,
            save_raw: true,
            ..Default::default()
        };
        let plan = plan_session(
            &identity(),
            &settings,
            CameraMode::Photo,
            SessionPurpose::Preview,
            &features(false),
            &CaptureConfig::default(),
        );
        assert_eq!(plan.kind, SessionKind::Reprocessable);
        let kinds: Vec<_> = plan.specs.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SurfaceKind::Preview,
                SurfaceKind::Jpeg,
                SurfaceKind::Raw,
                SurfaceKind::ReprocessInput
            ]
        );
    }

    #[test]
    fn hfr_recording_plan_is_two_surfaces_high_speed() {
        let settings = SettingsSnapshot {
            hfr_fps: Some(240),
            ..Default::default()
        };
        let plan = plan_session(
            &identity(),
            &settings,
            CameraMode::Hfr,
            SessionPurpose::Recording,
            &features(false),
            &CaptureConfig::default(),
        );
        assert_eq!(plan.kind, SessionKind::ConstrainedHighSpeed);
        assert_eq!(plan.high_speed_fps, Some(240));
        assert_eq!(plan.specs.len(), 2);
    }

    #[test]
    fn eis_recording_plan_uses_custom_session() {
        let settings = SettingsSnapshot {
            eis: EisMode::Lookahead,
            ..Default::default()
        };
        let plan = plan_session(
            &identity(),
            &settings,
            CameraMode::Video,
            SessionPurpose::Recording,
            &features(true),
            &CaptureConfig::default(),
        );
        assert_eq!(plan.kind, SessionKind::Custom(OpMode::EIS_LOOKAHEAD));
        assert!(plan.specs.iter().any(|s| s.kind == SurfaceKind::VideoSnapshot));
    }
}
