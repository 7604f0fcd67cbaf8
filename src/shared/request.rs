// This is free and unencumbered software released into the public domain.

//! Capture requests and the builder that assembles them.
//!
//! A request is assembled by applying a fixed, ordered list of steps to a
//! blank request. Later steps overwrite fields written by earlier ones:
//!
//! 1. control mode
//! 2. AF mode (from the per-camera controls)
//! 3. face detection
//! 4. white balance
//! 5. exposure compensation
//! 6. flash (video intents never fire the flash)
//! 7. ISO (manual ISO turns AE off, overriding the flash AE mode)
//! 8. intent (template, AF/AE triggers, AE lock)
//! 9. scene mode (a fixed-focus scene forces AF off and the trigger idle)
//! 10. zoom crop
//! 11. AF/AE metering regions
//! 12. vendor extensions
//!
//! Once built, a request is never mutated.

use super::{
    CameraId, CameraIdentity, FlashPolicy, MeteringRect, Rect, SceneMode, SettingsSnapshot,
    SurfaceId, VendorTags, VendorValue, WhiteBalance,
};
use derive_more::Display;
use std::num::NonZeroU64;

/// Identifies a submitted request so its results can be matched back.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
pub struct RequestToken(NonZeroU64);

impl RequestToken {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum AfTrigger {
    #[default]
    #[display("idle")]
    Idle,
    #[display("start")]
    Start,
    #[display("cancel")]
    Cancel,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum PrecaptureTrigger {
    #[default]
    #[display("idle")]
    Idle,
    #[display("start")]
    Start,
    #[display("cancel")]
    Cancel,
}

/// What a request is for. Drives the template and the 3A triggers.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum CaptureIntent {
    #[display("preview")]
    Preview,
    #[display("lock-focus")]
    LockFocus,
    #[display("precapture-{_0}")]
    Precapture(PrecaptureTrigger),
    #[display("lock-exposure")]
    LockExposure,
    #[display("unlock-focus")]
    UnlockFocus,
    #[display("auto-focus")]
    AutoFocus,
    #[display("still")]
    StillCapture,
    #[display("record")]
    VideoRecord,
    #[display("video-snapshot")]
    VideoSnapshot,
}

impl CaptureIntent {
    pub fn is_video(self) -> bool {
        matches!(self, Self::VideoRecord | Self::VideoSnapshot)
    }

    /// Intents whose completion delivers an image buffer.
    pub fn produces_image(self) -> bool {
        matches!(self, Self::StillCapture | Self::VideoSnapshot)
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum RequestTemplate {
    #[default]
    #[display("preview")]
    Preview,
    #[display("still")]
    StillCapture,
    #[display("zsl")]
    ZeroShutterLag,
    #[display("record")]
    Record,
    #[display("video-snapshot")]
    VideoSnapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControlMode {
    #[default]
    Auto,
    UseSceneMode,
    Off,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum AfMode {
    #[display("off")]
    Off,
    #[display("auto")]
    Auto,
    #[display("macro")]
    Macro,
    #[display("continuous-video")]
    ContinuousVideo,
    #[default]
    #[display("continuous-picture")]
    ContinuousPicture,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum AeMode {
    #[display("off")]
    Off,
    #[default]
    #[display("on")]
    On,
    #[display("on-auto-flash")]
    OnAutoFlash,
    #[display("on-always-flash")]
    OnAlwaysFlash,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum FlashMode {
    #[default]
    #[display("off")]
    Off,
    #[display("single")]
    Single,
    #[display("torch")]
    Torch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub token: RequestToken,
    pub camera: CameraId,
    pub intent: CaptureIntent,
    pub template: RequestTemplate,
    pub targets: Vec<SurfaceId>,
    pub control_mode: ControlMode,
    pub af_mode: AfMode,
    pub af_trigger: AfTrigger,
    pub ae_mode: AeMode,
    pub ae_lock: bool,
    pub precapture_trigger: PrecaptureTrigger,
    pub flash_mode: FlashMode,
    pub exposure_compensation: i32,
    pub sensitivity: Option<u32>,
    pub white_balance: WhiteBalance,
    pub scene_mode: SceneMode,
    pub face_detection: bool,
    pub crop_region: Option<Rect>,
    pub af_regions: Vec<MeteringRect>,
    pub ae_regions: Vec<MeteringRect>,
    pub jpeg_quality: Option<u8>,
    pub vendor: VendorTags,
}

impl CaptureRequest {
    fn blank(token: RequestToken, camera: CameraId, intent: CaptureIntent) -> Self {
        Self {
            token,
            camera,
            intent,
            template: RequestTemplate::Preview,
            targets: Vec::new(),
            control_mode: ControlMode::Auto,
            af_mode: AfMode::ContinuousPicture,
            af_trigger: AfTrigger::Idle,
            ae_mode: AeMode::On,
            ae_lock: false,
            precapture_trigger: PrecaptureTrigger::Idle,
            flash_mode: FlashMode::Off,
            exposure_compensation: 0,
            sensitivity: None,
            white_balance: WhiteBalance::Auto,
            scene_mode: SceneMode::Auto,
            face_detection: false,
            crop_region: None,
            af_regions: Vec::new(),
            ae_regions: Vec::new(),
            jpeg_quality: None,
            vendor: VendorTags::default(),
        }
    }
}

/// Mutable per-camera request inputs owned by the engine: the current crop,
/// touch regions, AF mode and vendor extensions.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraControls {
    pub camera: CameraId,
    pub flash_unit: bool,
    pub af_regions_supported: bool,
    pub ae_regions_supported: bool,
    pub crop: Option<Rect>,
    pub af_regions: Vec<MeteringRect>,
    pub ae_regions: Vec<MeteringRect>,
    pub af_mode: AfMode,
    pub ae_locked: bool,
    pub longshot: bool,
    pub vendor: VendorTags,
}

impl CameraControls {
    pub fn new(identity: &CameraIdentity) -> Self {
        let caps = &identity.capabilities;
        Self {
            camera: identity.id,
            flash_unit: caps.flash,
            af_regions_supported: caps.af_regions,
            ae_regions_supported: caps.ae_regions,
            crop: None,
            af_regions: Vec::new(),
            ae_regions: Vec::new(),
            af_mode: if caps.autofocus {
                AfMode::ContinuousPicture
            } else {
                AfMode::Off
            },
            ae_locked: false,
            longshot: false,
            vendor: VendorTags::default(),
        }
    }

    /// Drops touch regions and returns to continuous AF.
    pub fn reset_focus(&mut self) {
        self.af_regions.clear();
        self.ae_regions.clear();
        self.vendor.remove(TRACKING_ROI_KEY);
        self.ae_locked = false;
        if self.af_mode != AfMode::Off {
            self.af_mode = AfMode::ContinuousPicture;
        }
    }
}

pub const HISTOGRAM_ENABLE_KEY: &str = "stats.histogram.enable";
pub const LONGSHOT_ENABLE_KEY: &str = "longshot.enable";
pub const TRACKING_ROI_KEY: &str = "tracking.roi";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStep {
    ControlMode,
    AfMode,
    FaceDetection,
    WhiteBalance,
    Exposure,
    Flash,
    Iso,
    Intent,
    SceneMode,
    Zoom,
    Regions,
    Vendor,
}

pub const PRECEDENCE: [ApplyStep; 12] = [
    ApplyStep::ControlMode,
    ApplyStep::AfMode,
    ApplyStep::FaceDetection,
    ApplyStep::WhiteBalance,
    ApplyStep::Exposure,
    ApplyStep::Flash,
    ApplyStep::Iso,
    ApplyStep::Intent,
    ApplyStep::SceneMode,
    ApplyStep::Zoom,
    ApplyStep::Regions,
    ApplyStep::Vendor,
];

/// Mints tokens and assembles requests.
#[derive(Debug)]
pub struct RequestBuilder {
    next_token: u64,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self { next_token: 1 }
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&mut self) -> RequestToken {
        let token = NonZeroU64::new(self.next_token).unwrap_or(NonZeroU64::MIN);
        self.next_token = token.get().checked_add(1).unwrap_or(1);
        RequestToken(token)
    }

    pub fn build(
        &mut self,
        controls: &CameraControls,
        intent: CaptureIntent,
        settings: &SettingsSnapshot,
        targets: Vec<SurfaceId>,
    ) -> CaptureRequest {
        let mut req = CaptureRequest::blank(self.mint(), controls.camera, intent);
        req.targets = targets;
        for step in PRECEDENCE {
            apply(step, &mut req, controls, settings);
        }
        req
    }
}

fn apply(
    step: ApplyStep,
    req: &mut CaptureRequest,
    controls: &CameraControls,
    settings: &SettingsSnapshot,
) {
    match step {
        ApplyStep::ControlMode => req.control_mode = ControlMode::Auto,
        ApplyStep::AfMode => req.af_mode = controls.af_mode,
        ApplyStep::FaceDetection => req.face_detection = settings.face_detection,
        ApplyStep::WhiteBalance => req.white_balance = settings.white_balance,
        ApplyStep::Exposure => {
            req.exposure_compensation = settings.exposure_compensation;
            req.ae_lock = controls.ae_locked;
        },
        ApplyStep::Flash => apply_flash(req, controls, settings.flash),
        ApplyStep::Iso => {
            if let Some(iso) = settings.iso {
                req.ae_mode = AeMode::Off;
                req.sensitivity = Some(iso);
            }
        },
        ApplyStep::Intent => apply_intent(req, settings),
        ApplyStep::SceneMode => {
            if settings.scene != SceneMode::Auto {
                req.control_mode = ControlMode::UseSceneMode;
                req.scene_mode = settings.scene;
            }
            if settings.scene.is_fixed_focus() {
                req.af_mode = AfMode::Off;
                req.af_trigger = AfTrigger::Idle;
            }
        },
        ApplyStep::Zoom => req.crop_region = controls.crop,
        ApplyStep::Regions => {
            if controls.af_regions_supported && !controls.af_regions.is_empty() {
                req.af_regions = controls.af_regions.clone();
            }
            if controls.ae_regions_supported && !controls.ae_regions.is_empty() {
                req.ae_regions = controls.ae_regions.clone();
            }
        },
        ApplyStep::Vendor => {
            req.vendor.merge(&controls.vendor);
            if settings.histogram {
                req.vendor.set(HISTOGRAM_ENABLE_KEY, VendorValue::Bool(true));
            }
            if controls.longshot && req.intent == CaptureIntent::StillCapture {
                req.vendor.set(LONGSHOT_ENABLE_KEY, VendorValue::Bool(true));
            }
        },
    }
}

fn apply_flash(req: &mut CaptureRequest, controls: &CameraControls, policy: FlashPolicy) {
    let policy = if !controls.flash_unit {
        FlashPolicy::Off
    } else if req.intent.is_video() && matches!(policy, FlashPolicy::Auto | FlashPolicy::On) {
        FlashPolicy::Off
    } else {
        policy
    };
    let (ae_mode, flash_mode) = match policy {
        FlashPolicy::Off => (AeMode::On, FlashMode::Off),
        FlashPolicy::Auto => (AeMode::OnAutoFlash, FlashMode::Off),
        FlashPolicy::On => (AeMode::OnAlwaysFlash, FlashMode::Off),
        FlashPolicy::Torch => (AeMode::On, FlashMode::Torch),
    };
    req.ae_mode = ae_mode;
    req.flash_mode = flash_mode;
}

fn apply_intent(req: &mut CaptureRequest, settings: &SettingsSnapshot) {
    match req.intent {
        CaptureIntent::Preview => {},
        CaptureIntent::LockFocus => req.af_trigger = AfTrigger::Start,
        CaptureIntent::Precapture(trigger) => req.precapture_trigger = trigger,
        CaptureIntent::LockExposure => req.ae_lock = true,
        CaptureIntent::UnlockFocus => {
            req.af_trigger = AfTrigger::Cancel;
            req.ae_lock = false;
        },
        CaptureIntent::AutoFocus => {
            req.af_mode = AfMode::Auto;
            req.af_trigger = AfTrigger::Start;
        },
        CaptureIntent::StillCapture => {
            req.template = if settings.zsl {
                RequestTemplate::ZeroShutterLag
            } else {
                RequestTemplate::StillCapture
            };
            req.jpeg_quality = Some(settings.jpeg_quality);
        },
        CaptureIntent::VideoRecord => {
            req.template = RequestTemplate::Record;
            if req.af_mode != AfMode::Off {
                req.af_mode = AfMode::ContinuousVideo;
            }
        },
        CaptureIntent::VideoSnapshot => {
            req.template = RequestTemplate::VideoSnapshot;
            req.jpeg_quality = Some(settings.jpeg_quality);
        },
    }
}

/// Expands one request into the burst a constrained high-speed session
/// expects: one copy per 30 fps of frame rate, and never fewer than one.
pub fn high_speed_list(request: &CaptureRequest, fps: u32) -> Vec<CaptureRequest> {
    let n = (fps / 30).max(1) as usize;
    vec![request.clone(); n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{CameraRole, Capabilities, Facing};

    fn controls(flash: bool) -> CameraControls {
        let identity = CameraIdentity::new(0, CameraRole::Bayer, Facing::Back, Rect::from_size(4000, 3000))
            .with_capabilities(Capabilities {
                flash,
                autofocus: true,
                af_regions: true,
                ae_regions: true,
                max_zoom: 4.0,
                ..Default::default()
            });
        CameraControls::new(&identity)
    }

    fn settings(flash: FlashPolicy) -> SettingsSnapshot {
        SettingsSnapshot {
            flash,
            ..Default::default()
        }
    }

    #[test]
    fn tokens_are_distinct_and_nonzero() {
        let mut b = RequestBuilder::new();
        let c = controls(true);
        let s = settings(FlashPolicy::Off);
        let a = b.build(&c, CaptureIntent::Preview, &s, vec![]).token;
        let z = b.build(&c, CaptureIntent::Preview, &s, vec![]).token;
        assert_ne!(a, z);
        assert!(a.get() > 0 && z.get() > 0);
    }

    #[test]
    fn flash_policy_maps_to_ae_mode() {
        let mut b = RequestBuilder::new();
        let c = controls(true);
        for (policy, ae, flash) in [
            (FlashPolicy::Off, AeMode::On, FlashMode::Off),
            (FlashPolicy::Auto, AeMode::OnAutoFlash, FlashMode::Off),
            (FlashPolicy::On, AeMode::OnAlwaysFlash, FlashMode::Off),
            (FlashPolicy::Torch, AeMode::On, FlashMode::Torch),
        ] {
            let r = b.build(&c, CaptureIntent::StillCapture, &settings(policy), vec![]);
            assert_eq!((r.ae_mode, r.flash_mode), (ae, flash), "{policy}");
        }
    }

    #[test]
    fn video_intents_never_fire_the_flash() {
        let mut b = RequestBuilder::new();
        let c = controls(true);
        let r = b.build(&c, CaptureIntent::VideoRecord, &settings(FlashPolicy::On), vec![]);
        assert_eq!(r.ae_mode, AeMode::On);
        assert_eq!(r.af_mode, AfMode::ContinuousVideo);
        let r = b.build(&c, CaptureIntent::VideoRecord, &settings(FlashPolicy::Torch), vec![]);
        assert_eq!(r.flash_mode, FlashMode::Torch);
    }

    #[test]
    fn cameras_without_flash_always_build_flash_off() {
        let mut b = RequestBuilder::new();
        let r = b.build(&controls(false), CaptureIntent::StillCapture, &settings(FlashPolicy::On), vec![]);
        assert_eq!(r.ae_mode, AeMode::On);
        assert_eq!(r.flash_mode, FlashMode::Off);
    }

    #[test]
    fn manual_iso_overrides_flash_ae_mode() {
        let mut b = RequestBuilder::new();
        let s = SettingsSnapshot {
            iso: Some(400),
            ..settings(FlashPolicy::Auto)
        };
        let r = b.build(&controls(true), CaptureIntent::Preview, &s, vec![]);
        assert_eq!(r.ae_mode, AeMode::Off);
        assert_eq!(r.sensitivity, Some(400));
    }

    #[test]
    fn fixed_focus_scene_overrides_the_af_trigger() {
        let mut b = RequestBuilder::new();
        let s = SettingsSnapshot {
            scene: SceneMode::Landscape,
            ..Default::default()
        };
        let r = b.build(&controls(true), CaptureIntent::LockFocus, &s, vec![]);
        assert_eq!(r.af_trigger, AfTrigger::Idle);
        assert_eq!(r.af_mode, AfMode::Off);
        assert_eq!(r.control_mode, ControlMode::UseSceneMode);

        let r = b.build(&controls(true), CaptureIntent::LockFocus, &SettingsSnapshot::default(), vec![]);
        assert_eq!(r.af_trigger, AfTrigger::Start);
    }

    #[test]
    fn regions_and_crop_come_from_controls() {
        let mut b = RequestBuilder::new();
        let mut c = controls(true);
        let crop = Rect::new(1000, 750, 3000, 2250);
        let region = MeteringRect {
            rect: Rect::new(1900, 1400, 2100, 1600),
            weight: 1,
        };
        c.crop = Some(crop);
        c.af_regions = vec![region];
        c.af_regions_supported = false;
        c.ae_regions = vec![region];
        let r = b.build(&c, CaptureIntent::AutoFocus, &SettingsSnapshot::default(), vec![]);
        assert_eq!(r.crop_region, Some(crop));
        assert!(r.af_regions.is_empty());
        assert_eq!(r.ae_regions, vec![region]);
        assert_eq!(r.af_mode, AfMode::Auto);
    }

    #[test]
    fn high_speed_list_size_follows_frame_rate() {
        let mut b = RequestBuilder::new();
        let r = b.build(&controls(true), CaptureIntent::VideoRecord, &SettingsSnapshot::default(), vec![]);
        assert_eq!(high_speed_list(&r, 120).len(), 4);
        assert_eq!(high_speed_list(&r, 240).len(), 8);
        assert_eq!(high_speed_list(&r, 20).len(), 1);
    }
}
