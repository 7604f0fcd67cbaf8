// This is free and unencumbered software released into the public domain.

//! An in-process camera HAL with a scripted 3A model.
//!
//! Every asynchronous completion is posted to the engine queue before the
//! call that caused it returns, so a single-threaded test can drive a whole
//! capture by draining the queue. A repeating request yields one frame when
//! it is installed.

use crate::shared::{
    AeMode, AeState, AfMode, AfState, AfTrigger, CameraHal, CameraId, CameraIdentity,
    CameraRole, Capabilities, CaptureError, CaptureIntent, CaptureRequest, CaptureResult,
    CapturedImage, Facing, HISTOGRAM_ENABLE_KEY, HISTOGRAM_KEY, HalCallbacks, HalEvent,
    HalFeatures, HalInventory, PrecaptureTrigger, Rect, RequestToken, SessionHandle, SessionKind,
    Surface, SurfaceId, SurfaceKind, SurfaceSpec, VendorTags, VendorValue,
};
use bytes::Bytes;
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
    sync::{Arc, Mutex},
};

const FRAME_INTERVAL_NS: u64 = 33_333_333;

/// `ERROR_CAMERA_DEVICE` in the platform numbering.
pub const DEVICE_ERROR_CODE: i32 = 4;

/// Smallest well-formed JPEG (SOI + EOI), used when encoding is disabled.
const JPEG_STUB: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

#[derive(Clone, Debug, PartialEq)]
pub struct SimProfile {
    pub cameras: Vec<CameraIdentity>,
    pub features: HalFeatures,
    /// Results never carry an AE state.
    pub ae_reports_null: bool,
    /// AE searches (or asks for flash) until a precapture has run.
    pub low_light: bool,
    /// Triggered AF scans end unfocused.
    pub af_fails: bool,
    /// Number of upcoming session configurations that fail.
    pub fail_configure: u32,
    /// Cameras whose open ends in a device error.
    pub fail_open: Vec<CameraId>,
    pub image_size: (u32, u32),
    pub encode_jpeg: bool,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self::dual()
    }
}

impl SimProfile {
    /// Back Bayer with flash and ZSL, front camera, back mono sensor.
    pub fn dual() -> Self {
        let mut profile = Self::single();
        profile.cameras.push(
            CameraIdentity::new(2, CameraRole::Mono, Facing::Back, Rect::from_size(4000, 3000))
                .with_capabilities(Capabilities {
                    autofocus: true,
                    af_regions: true,
                    max_zoom: 4.0,
                    ..Default::default()
                }),
        );
        profile
    }

    /// Back Bayer with flash and ZSL, plus a fixed-focus front camera.
    pub fn single() -> Self {
        Self {
            cameras: vec![
                CameraIdentity::new(0, CameraRole::Bayer, Facing::Back, Rect::from_size(4000, 3000))
                    .with_capabilities(Capabilities {
                        flash: true,
                        autofocus: true,
                        af_regions: true,
                        ae_regions: true,
                        reprocessing: true,
                        high_speed_fps: vec![120, 240],
                        max_zoom: 4.0,
                    })
                    .with_vendor(VendorTags::new().with("sensor.model", VendorValue::Text("sim-imx".into()))),
                CameraIdentity::new(1, CameraRole::Front, Facing::Front, Rect::from_size(3264, 2448))
                    .with_capabilities(Capabilities {
                        max_zoom: 2.0,
                        ..Default::default()
                    }),
            ],
            features: HalFeatures {
                custom_session: true,
                reprocessing: true,
                high_speed: true,
            },
            ae_reports_null: false,
            low_light: false,
            af_fails: false,
            fail_configure: 0,
            fail_open: Vec::new(),
            image_size: (64, 48),
            encode_jpeg: true,
        }
    }

    /// Parses `dual`, `single` or `null-ae`, each optionally followed by
    /// `+low-light`, `+af-fails` or `+no-jpeg`.
    pub fn parse(s: &str) -> Result<Self, CaptureError> {
        let mut parts = s.split('+');
        let mut profile = match parts.next().unwrap_or_default() {
            "" | "dual" => Self::dual(),
            "single" => Self::single(),
            "null-ae" => Self::single().with_null_ae(),
            other => {
                return Err(CaptureError::invalid_config(format!(
                    "unknown simulator profile: {other}"
                )));
            },
        };
        for flag in parts {
            profile = match flag {
                "low-light" => profile.with_low_light(),
                "af-fails" => profile.with_af_failure(),
                "no-jpeg" => {
                    profile.encode_jpeg = false;
                    profile
                },
                other => {
                    return Err(CaptureError::invalid_config(format!(
                        "unknown simulator flag: {other}"
                    )));
                },
            };
        }
        Ok(profile)
    }

    pub fn with_null_ae(mut self) -> Self {
        self.ae_reports_null = true;
        self
    }

    pub fn with_low_light(mut self) -> Self {
        self.low_light = true;
        self
    }

    pub fn with_af_failure(mut self) -> Self {
        self.af_fails = true;
        self
    }

    pub fn with_configure_failures(mut self, n: u32) -> Self {
        self.fail_configure = n;
        self
    }

    pub fn with_open_failure(mut self, camera: CameraId) -> Self {
        self.fail_open.push(camera);
        self
    }

    pub fn with_features(mut self, features: HalFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.image_size = (width, height);
        self
    }
}

/// One HAL call as the simulator saw it.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    OpenDevice(CameraId),
    CloseDevice(CameraId),
    AllocateSurface {
        camera: CameraId,
        surface: SurfaceId,
        kind: SurfaceKind,
    },
    ReleaseSurface(SurfaceId),
    CreateSession {
        camera: CameraId,
        kind: SessionKind,
        outputs: usize,
    },
    CloseSession(SessionHandle),
    Capture {
        camera: CameraId,
        intent: CaptureIntent,
        token: RequestToken,
    },
    Repeating {
        camera: CameraId,
        intent: CaptureIntent,
        count: usize,
    },
    StopRepeating(SessionHandle),
}

/// Shared record of HAL calls, readable after the HAL was handed off.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, pred: impl Fn(&JournalEntry) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    /// One-shot captures of `intent` on any camera.
    pub fn captures(&self, intent: CaptureIntent) -> usize {
        self.count(|e| matches!(e, JournalEntry::Capture { intent: i, .. } if *i == intent))
    }

    /// Surfaces allocated and not yet released.
    pub fn live_surfaces(&self) -> usize {
        let allocated = self.count(|e| matches!(e, JournalEntry::AllocateSurface { .. }));
        let released = self.count(|e| matches!(e, JournalEntry::ReleaseSurface(_)));
        allocated.saturating_sub(released)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn push(&self, entry: JournalEntry) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(entry);
    }
}

#[derive(Debug)]
struct SimSession {
    camera: CameraId,
}

#[derive(Debug, Default)]
struct Sim3a {
    af: Option<AfState>,
    precaptured: bool,
}

#[derive(Debug)]
pub struct SimulatedHal {
    profile: SimProfile,
    callbacks: Option<HalCallbacks>,
    open: BTreeSet<CameraId>,
    sessions: BTreeMap<SessionHandle, SimSession>,
    three_a: BTreeMap<CameraId, Sim3a>,
    next_surface: u64,
    next_session: u64,
    frame_number: u64,
    clock_ns: u64,
    configure_failures: u32,
    journal: Journal,
}

impl SimulatedHal {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            configure_failures: profile.fail_configure,
            profile,
            callbacks: None,
            open: BTreeSet::new(),
            sessions: BTreeMap::new(),
            three_a: BTreeMap::new(),
            next_surface: 0,
            next_session: 0,
            frame_number: 0,
            clock_ns: 0,
            journal: Journal::default(),
        }
    }

    /// Builds a simulator from the part of a `sim:` URL after the scheme.
    pub fn from_url(profile: &str) -> Result<Self, CaptureError> {
        SimProfile::parse(profile).map(Self::new)
    }

    pub fn profile(&self) -> &SimProfile {
        &self.profile
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn post(&self, event: HalEvent) {
        if let Some(callbacks) = &self.callbacks {
            callbacks.post(event);
        }
    }

    fn identity(&self, camera: CameraId) -> Option<&CameraIdentity> {
        self.profile.cameras.iter().find(|c| c.id == camera)
    }

    fn session(&self, session: SessionHandle, camera: CameraId) -> Result<(), CaptureError> {
        match self.sessions.get(&session) {
            Some(s) if s.camera == camera => Ok(()),
            _ => Err(CaptureError::SessionClosed(camera)),
        }
    }

    fn sample_3a(&mut self, request: &CaptureRequest) -> (AfState, Option<AeState>) {
        let autofocus = self
            .identity(request.camera)
            .is_some_and(|c| c.capabilities.autofocus);
        // A mono sensor follows the Bayer exposure and reports it locked
        // together with focus.
        let slaved = self
            .identity(request.camera)
            .is_some_and(CameraIdentity::is_mono);
        let profile = &self.profile;
        let st = self.three_a.entry(request.camera).or_default();

        let af = if !autofocus || request.af_mode == AfMode::Off {
            AfState::Inactive
        } else {
            match request.af_trigger {
                AfTrigger::Start if profile.af_fails => AfState::NotFocusedLocked,
                AfTrigger::Start => AfState::FocusedLocked,
                AfTrigger::Cancel => AfState::Inactive,
                AfTrigger::Idle => match st.af {
                    Some(af) if af.is_locked() => af,
                    _ if matches!(request.af_mode, AfMode::Auto | AfMode::Macro) => {
                        AfState::Inactive
                    },
                    _ => AfState::PassiveFocused,
                },
            }
        };
        st.af = Some(af);

        match request.precapture_trigger {
            PrecaptureTrigger::Start => st.precaptured = true,
            PrecaptureTrigger::Cancel => st.precaptured = false,
            PrecaptureTrigger::Idle => {},
        }
        if request.af_trigger == AfTrigger::Cancel {
            st.precaptured = false;
        }

        let ae = if profile.ae_reports_null {
            None
        } else if request.ae_lock || (slaved && af.is_locked()) {
            Some(AeState::Locked)
        } else if request.precapture_trigger == PrecaptureTrigger::Start {
            Some(AeState::Precapture)
        } else if profile.low_light && !st.precaptured {
            Some(if request.ae_mode == AeMode::OnAutoFlash {
                AeState::FlashRequired
            } else {
                AeState::Searching
            })
        } else {
            Some(AeState::Converged)
        };
        (af, ae)
    }

    fn render(&self, camera: CameraId) -> CapturedImage {
        let (width, height) = self.profile.image_size;
        let data = if self.profile.encode_jpeg {
            let seed = self.frame_number as u32;
            let pixels = image::GrayImage::from_fn(width.max(1), height.max(1), |x, y| {
                image::Luma([(x.wrapping_add(y).wrapping_add(seed) % 256) as u8])
            });
            let mut out = Cursor::new(Vec::new());
            match image::DynamicImage::ImageLuma8(pixels).write_to(&mut out, image::ImageFormat::Jpeg) {
                Ok(()) => Bytes::from(out.into_inner()),
                Err(e) => {
                    warn!(%camera, error = %e, "JPEG encoding failed");
                    Bytes::from_static(JPEG_STUB)
                },
            }
        } else {
            Bytes::from_static(JPEG_STUB)
        };
        CapturedImage::new_jpeg(camera, self.clock_ns, width, height, data)
    }

    /// Produces the frame for `request`: its image, if any, then its result.
    fn emit(&mut self, session: SessionHandle, request: &CaptureRequest) {
        self.frame_number += 1;
        self.clock_ns += FRAME_INTERVAL_NS;
        let (af, ae) = self.sample_3a(request);

        if request.intent.produces_image() {
            let image = self.render(request.camera).with_token(request.token);
            self.post(HalEvent::ImageAvailable(image));
        }

        let mut result = CaptureResult::new(request.camera, request.token, request.intent)
            .with_session(session)
            .with_af(af)
            .with_ae(ae)
            .with_timestamp(self.frame_number, self.clock_ns);
        if request.vendor.get_bool(HISTOGRAM_ENABLE_KEY) == Some(true) {
            let histogram = (0..16).map(|i| ((self.frame_number + i) % 97) as i32).collect();
            result.vendor.set(HISTOGRAM_KEY, VendorValue::Ints(histogram));
        }
        self.post(HalEvent::CaptureCompleted(result));
    }
}

impl dogma::Named for SimulatedHal {
    fn name(&self) -> Cow<'_, str> {
        "simulator".into()
    }
}

impl CameraHal for SimulatedHal {
    fn probe(&mut self) -> Result<HalInventory, CaptureError> {
        Ok(HalInventory {
            cameras: self.profile.cameras.clone(),
            features: self.profile.features,
        })
    }

    fn attach(&mut self, callbacks: HalCallbacks) {
        self.callbacks = Some(callbacks);
    }

    fn open_device(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        if self.identity(camera).is_none() {
            return Err(CaptureError::other(format!("unknown camera {camera}")));
        }
        self.journal.push(JournalEntry::OpenDevice(camera));
        if self.profile.fail_open.contains(&camera) {
            self.post(HalEvent::DeviceError {
                camera,
                code: DEVICE_ERROR_CODE,
            });
            return Ok(());
        }
        self.open.insert(camera);
        self.post(HalEvent::DeviceOpened { camera });
        Ok(())
    }

    fn close_device(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        self.journal.push(JournalEntry::CloseDevice(camera));
        self.sessions.retain(|_, s| s.camera != camera);
        self.three_a.remove(&camera);
        if self.open.remove(&camera) {
            self.post(HalEvent::DeviceClosed { camera });
        }
        Ok(())
    }

    fn allocate_surface(
        &mut self,
        camera: CameraId,
        spec: SurfaceSpec,
    ) -> Result<Surface, CaptureError> {
        self.next_surface += 1;
        let surface = Surface {
            id: SurfaceId(self.next_surface),
            camera,
            spec,
        };
        self.journal.push(JournalEntry::AllocateSurface {
            camera,
            surface: surface.id,
            kind: spec.kind,
        });
        Ok(surface)
    }

    fn release_surface(&mut self, surface: &Surface) {
        self.journal.push(JournalEntry::ReleaseSurface(surface.id));
    }

    fn create_session(
        &mut self,
        camera: CameraId,
        generation: u64,
        kind: SessionKind,
        surfaces: &[Surface],
    ) -> Result<(), CaptureError> {
        self.journal.push(JournalEntry::CreateSession {
            camera,
            kind,
            outputs: surfaces.len(),
        });
        if !self.open.contains(&camera) {
            return Err(CaptureError::not_ready(format!("camera {camera} is not open")));
        }
        if surfaces.is_empty() {
            return Err(CaptureError::invalid_config("a session needs at least one output"));
        }
        if kind == SessionKind::ConstrainedHighSpeed && surfaces.len() > 2 {
            return Err(CaptureError::invalid_config(
                "a high-speed session takes at most two outputs",
            ));
        }
        if self.configure_failures > 0 {
            self.configure_failures -= 1;
            self.post(HalEvent::SessionConfigureFailed {
                camera,
                generation,
                reason: "simulated configuration failure".into(),
            });
            return Ok(());
        }

        self.next_session += 1;
        let session = SessionHandle(self.next_session);
        self.sessions.insert(session, SimSession { camera });
        self.post(HalEvent::SessionConfigured {
            camera,
            generation,
            session,
        });
        Ok(())
    }

    fn close_session(&mut self, session: SessionHandle) {
        self.journal.push(JournalEntry::CloseSession(session));
        self.sessions.remove(&session);
    }

    fn capture(
        &mut self,
        session: SessionHandle,
        request: &CaptureRequest,
    ) -> Result<(), CaptureError> {
        self.session(session, request.camera)?;
        if request.targets.is_empty() {
            return Err(CaptureError::invalid_config("request has no output targets"));
        }
        self.journal.push(JournalEntry::Capture {
            camera: request.camera,
            intent: request.intent,
            token: request.token,
        });
        self.emit(session, request);
        Ok(())
    }

    fn capture_burst(
        &mut self,
        session: SessionHandle,
        requests: &[CaptureRequest],
    ) -> Result<(), CaptureError> {
        requests.iter().try_for_each(|r| self.capture(session, r))
    }

    fn set_repeating(
        &mut self,
        session: SessionHandle,
        requests: &[CaptureRequest],
    ) -> Result<(), CaptureError> {
        let Some(first) = requests.first() else {
            return Err(CaptureError::invalid_config("empty repeating request list"));
        };
        self.session(session, first.camera)?;
        self.journal.push(JournalEntry::Repeating {
            camera: first.camera,
            intent: first.intent,
            count: requests.len(),
        });
        self.emit(session, first);
        Ok(())
    }

    fn stop_repeating(&mut self, session: SessionHandle) -> Result<(), CaptureError> {
        self.journal.push(JournalEntry::StopRepeating(session));
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CaptureError::other(format!("{session} is closed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse() {
        assert_eq!(SimProfile::parse("").unwrap().cameras.len(), 3);
        assert_eq!(SimProfile::parse("single").unwrap().cameras.len(), 2);
        let p = SimProfile::parse("null-ae+low-light").unwrap();
        assert!(p.ae_reports_null && p.low_light);
        assert!(SimProfile::parse("quad").is_err());
        assert!(SimProfile::parse("dual+sparkles").is_err());
    }

    #[test]
    fn journal_tracks_live_surfaces() {
        let mut hal = SimulatedHal::new(SimProfile::single());
        let journal = hal.journal();
        let a = hal
            .allocate_surface(CameraId(0), SurfaceSpec::new(SurfaceKind::Preview, (640, 480)))
            .unwrap();
        hal.allocate_surface(CameraId(0), SurfaceSpec::new(SurfaceKind::Jpeg, (640, 480)))
            .unwrap();
        hal.release_surface(&a);
        assert_eq!(journal.live_surfaces(), 1);
    }

    #[test]
    fn rejects_empty_and_oversized_sessions() {
        let mut hal = SimulatedHal::new(SimProfile::single());
        hal.open.insert(CameraId(0));
        assert!(matches!(
            hal.create_session(CameraId(0), 1, SessionKind::Regular, &[]),
            Err(CaptureError::InvalidConfig(_))
        ));
        let surfaces: Vec<Surface> = (0..3)
            .map(|_| {
                hal.allocate_surface(CameraId(0), SurfaceSpec::new(SurfaceKind::Preview, (64, 48)))
                    .unwrap()
            })
            .collect();
        assert!(matches!(
            hal.create_session(CameraId(0), 2, SessionKind::ConstrainedHighSpeed, &surfaces),
            Err(CaptureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn encodes_a_real_jpeg() {
        let hal = SimulatedHal::new(SimProfile::single());
        let image = hal.render(CameraId(0));
        assert_eq!(&image.data[..2], &[0xFF, 0xD8]);
        assert!(image.data.len() > JPEG_STUB.len());
    }
}
