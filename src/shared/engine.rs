// This is free and unencumbered software released into the public domain.

//! The capture engine: owns the HAL and every piece of capture state, and
//! is driven one message at a time from the capture-callback thread.

use super::{
    BurstStep, CameraControls, CameraHal, CameraId, CameraIdentity, CameraMode, CaptureConfig,
    CaptureError, CaptureEvent, CaptureIntent, CaptureRequest, CaptureResult, CaptureState,
    CaptureStateMachine, CapturedImage, CameraContext, DeviceRegistry, DeviceState, DualContext,
    Facing, FlashPolicy, HalCallbacks, HalEvent, HalInventory, Latch, LongshotTracker, MediaItem,
    MediaSaver, MemorySettings, ModeTopology, NullSaver, Permit, PrecaptureTrigger, RegionKind,
    RequestBuilder, RequestIssuer, RequestToken, ResourceMonitor, ResultDispatcher, ResultSinks, SaveQueue,
    SessionHandle, SessionKind, SessionOrchestrator, SessionPhase, SessionPlan, SessionPurpose,
    SettingsSnapshot, SettingsStore, StatsBuffers, TRACKING_ROI_KEY, TopologyRecord, Unmonitored,
    VendorValue, ViewGeometry, crop_region_for_zoom, high_speed_list, keys, metering_region,
    plan_session, post_event,
};
use dogma::Named;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        mpsc::{Sender, SyncSender},
    },
    time::Instant,
};

/// User-initiated operations.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Resume: open the cameras of the current mode.
    Open,
    /// Pause: close everything.
    Close,
    TakePicture,
    TouchFocus { x: f32, y: f32 },
    CancelTouchFocus,
    LockAfAe,
    Unlock,
    StartLongshot,
    StopLongshot,
    StartRecording,
    StopRecording,
    VideoSnapshot,
    SetMode(CameraMode),
    SwitchFacing(Facing),
    SetZoom(f32),
    SetView(ViewGeometry),
    SettingsChanged(BTreeSet<String>),
}

#[derive(Debug)]
pub enum EngineMsg {
    Command(Command),
    Hal(HalEvent),
    Tick,
    Shutdown,
}

/// The engine's external collaborators.
pub struct Collaborators {
    pub settings: Arc<dyn SettingsStore>,
    pub saver: Box<dyn MediaSaver>,
    pub monitor: Arc<dyn ResourceMonitor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            settings: Arc::new(MemorySettings::new()),
            saver: Box::new(NullSaver),
            monitor: Arc::new(Unmonitored),
        }
    }
}

impl Collaborators {
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_saver(mut self, saver: Box<dyn MediaSaver>) -> Self {
        self.saver = saver;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }
}

#[derive(Clone, Copy, Debug)]
struct Recording {
    camera: CameraId,
    high_speed: bool,
    started: bool,
}

pub struct CaptureEngine {
    hal: Box<dyn CameraHal>,
    config: CaptureConfig,
    settings: Arc<dyn SettingsStore>,
    monitor: Arc<dyn ResourceMonitor>,
    snapshot: SettingsSnapshot,
    inventory: HalInventory,
    topology: ModeTopology,
    mode: CameraMode,
    facing: Facing,
    registry: DeviceRegistry,
    sessions: SessionOrchestrator,
    fsm: CaptureStateMachine,
    builder: RequestBuilder,
    controls: BTreeMap<CameraId, CameraControls>,
    dispatcher: ResultDispatcher,
    saves: SaveQueue,
    longshot: LongshotTracker,
    events: SyncSender<CaptureEvent>,
    preview_latch: Arc<Latch>,
    view: ViewGeometry,
    touch_deadlines: BTreeMap<CameraId, Instant>,
    /// The still request each camera is waiting on in this capture cycle.
    stills: BTreeMap<CameraId, RequestToken>,
    recording: Option<Recording>,
    paused: bool,
    fatal: bool,
    last_sensor_ts: u64,
    image_seq: u32,
}

impl CaptureEngine {
    pub fn new(
        mut hal: Box<dyn CameraHal>,
        config: CaptureConfig,
        collaborators: Collaborators,
        tx: Sender<EngineMsg>,
        events: SyncSender<CaptureEvent>,
    ) -> Result<Self, CaptureError> {
        let permit = Arc::new(Permit::new(1));
        hal.attach(HalCallbacks::new(tx, Arc::clone(&permit)));

        let inventory = hal.probe()?;
        if inventory.cameras.is_empty() {
            return Err(CaptureError::NoCamera);
        }
        let topology = ModeTopology::probe(&inventory.cameras);
        let snapshot = SettingsSnapshot::load(&*collaborators.settings);
        let (mode, facing) = resolve_mode(&config, &snapshot, &topology)?;

        let mut dispatcher = ResultDispatcher::new(StatsBuffers::default());
        dispatcher.set_stats_enabled(snapshot.histogram);
        let saves = SaveQueue::new(
            config.save_queue_capacity,
            collaborators.saver,
            events.clone(),
        )?;

        info!(
            driver = %hal.name(),
            cameras = inventory.cameras.len(),
            %mode,
            %facing,
            intent = %config.intent_mode,
            "capture engine ready"
        );

        let (w, h) = config.preview_size;
        Ok(Self {
            hal,
            registry: DeviceRegistry::new(permit, config.open_timeout, config.close_timeout),
            view: ViewGeometry::new(w as i32, h as i32),
            config,
            settings: collaborators.settings,
            monitor: collaborators.monitor,
            snapshot,
            inventory,
            topology,
            mode,
            facing,
            sessions: SessionOrchestrator::new(),
            fsm: CaptureStateMachine::new(),
            builder: RequestBuilder::new(),
            controls: BTreeMap::new(),
            dispatcher,
            saves,
            longshot: LongshotTracker::default(),
            events,
            preview_latch: Arc::new(Latch::new()),
            touch_deadlines: BTreeMap::new(),
            stills: BTreeMap::new(),
            recording: None,
            paused: true,
            fatal: false,
            last_sensor_ts: 0,
            image_seq: 0,
        })
    }

    pub fn cameras(&self) -> &[CameraIdentity] {
        &self.inventory.cameras
    }

    pub fn topology(&self) -> &ModeTopology {
        &self.topology
    }

    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn stats(&self) -> StatsBuffers {
        self.dispatcher.stats()
    }

    pub fn result_sinks(&self) -> ResultSinks {
        self.dispatcher.sinks()
    }

    pub fn preview_latch(&self) -> Arc<Latch> {
        Arc::clone(&self.preview_latch)
    }

    pub fn state(&self, camera: CameraId) -> Option<CaptureState> {
        self.fsm.state(camera)
    }

    pub fn lock_token(&self, camera: CameraId) -> Option<RequestToken> {
        self.fsm.lock_token(camera)
    }

    pub fn session_phase(&self, camera: CameraId) -> SessionPhase {
        self.sessions.phase(camera)
    }

    pub fn session_kind(&self, camera: CameraId) -> Option<SessionKind> {
        self.sessions.descriptor(camera).map(|d| d.kind)
    }

    pub fn switch_allowed(&self) -> bool {
        self.sessions.switch_allowed()
    }

    pub fn controls(&self, camera: CameraId) -> Option<&CameraControls> {
        self.controls.get(&camera)
    }

    pub fn longshot(&self) -> &LongshotTracker {
        &self.longshot
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some_and(|r| r.started)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pending_saves(&self) -> usize {
        self.saves.pending()
    }

    /// Current topology record.
    pub fn record(&self) -> Result<TopologyRecord, CaptureError> {
        self.topology
            .resolve(self.mode, self.facing)
            .cloned()
            .ok_or(CaptureError::NoTopology(self.mode))
    }

    /// Processes one message. Returns `false` once the engine should stop.
    pub fn handle(&mut self, msg: EngineMsg) -> bool {
        match msg {
            EngineMsg::Command(cmd) => {
                if let Err(e) = self.execute(cmd) {
                    self.report(&e);
                }
            },
            EngineMsg::Hal(event) => self.on_hal_event(event),
            EngineMsg::Tick => self.on_tick(Instant::now()),
            EngineMsg::Shutdown => return false,
        }
        true
    }

    pub fn execute(&mut self, cmd: Command) -> Result<(), CaptureError> {
        if self.fatal && cmd != Command::Close {
            return Err(CaptureError::Closed);
        }
        debug!(?cmd, "command");
        match cmd {
            Command::Open => self.resume(),
            Command::Close => {
                self.pause();
                Ok(())
            },
            Command::TakePicture => self.take_picture(),
            Command::TouchFocus { x, y } => self.touch_focus(x, y),
            Command::CancelTouchFocus => {
                self.cancel_touch_focus();
                Ok(())
            },
            Command::LockAfAe => self.lock_af_ae(),
            Command::Unlock => self.unlock_all(),
            Command::StartLongshot => self.start_longshot(),
            Command::StopLongshot => {
                self.longshot.request_stop();
                Ok(())
            },
            Command::StartRecording => self.start_recording(),
            Command::StopRecording => self.stop_recording(),
            Command::VideoSnapshot => self.video_snapshot(),
            Command::SetMode(mode) => self.switch(mode, self.facing),
            Command::SwitchFacing(facing) => self.switch(self.mode, facing),
            Command::SetZoom(zoom) => {
                self.snapshot.zoom = if zoom.is_finite() { zoom.max(1.0) } else { 1.0 };
                self.apply_zoom();
                self.refresh_previews();
                Ok(())
            },
            Command::SetView(view) => {
                self.view = view;
                Ok(())
            },
            Command::SettingsChanged(keys) => self.on_settings_changed(&keys),
        }
    }

    /// Closes everything and stops the save thread after it drained.
    pub fn shutdown(&mut self) {
        self.pause();
        self.saves.stop();
    }

    fn post(&self, event: CaptureEvent) {
        post_event(&self.events, event);
    }

    fn report(&self, e: &CaptureError) {
        match e {
            CaptureError::CropRegionUnset(camera) => {
                debug!(%camera, "touch ignored, crop region not set yet");
            },
            _ => {
                warn!(error = %e, "capture operation failed");
                self.post(CaptureEvent::Warning(e.to_string()));
            },
        }
    }

    fn identity(&self, camera: CameraId) -> Option<&CameraIdentity> {
        self.inventory.cameras.iter().find(|c| c.id == camera)
    }

    fn split(&mut self) -> (&mut CaptureStateMachine, Issuer<'_>, &ResultDispatcher) {
        (
            &mut self.fsm,
            Issuer {
                hal: &mut *self.hal,
                sessions: &self.sessions,
                builder: &mut self.builder,
                controls: &mut self.controls,
                stills: &mut self.stills,
                settings: &self.snapshot,
                events: &self.events,
            },
            &self.dispatcher,
        )
    }

    // Lifecycle

    fn resume(&mut self) -> Result<(), CaptureError> {
        if !self.paused {
            return Ok(());
        }
        let record = self.record()?;
        self.paused = false;
        info!(mode = %self.mode, facing = %self.facing, "resuming capture");
        self.prepare_cameras(&record);
        self.open_next(&record).map(|_| ())
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        info!("pausing capture");
        self.teardown();
        self.fsm.clear();
    }

    fn restart_all(&mut self) -> Result<(), CaptureError> {
        let running = !self.paused;
        self.pause();
        if running { self.resume() } else { Ok(()) }
    }

    fn teardown(&mut self) {
        self.longshot.close(self.last_sensor_ts);
        if let Some(rec) = self.recording.take()
            && rec.started
        {
            self.post(CaptureEvent::RecordingStopped { camera: rec.camera });
        }
        self.touch_deadlines.clear();
        self.stills.clear();
        for controls in self.controls.values_mut() {
            controls.crop = None;
            controls.longshot = false;
            controls.reset_focus();
        }
        if let Err(e) = self.close_cameras() {
            self.report(&e);
        }
    }

    /// Closes every session and device. Surfaces are released even when a
    /// device close fails.
    fn close_cameras(&mut self) -> Result<(), CaptureError> {
        let surfaces = self.sessions.detach_all(&mut *self.hal);
        let mut guard = scopeguard::guard((&mut *self.hal, surfaces), |(hal, surfaces)| {
            super::session::release(hal, &surfaces);
        });
        let (hal, _) = &mut *guard;

        let mut first_error = None;
        for camera in self.registry.devices() {
            if let Err(e) = self.registry.close(camera, &mut **hal) {
                warn!(%camera, error = %e, "failed to close camera");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn prepare_cameras(&mut self, record: &TopologyRecord) {
        self.fsm.clear();
        self.controls.clear();
        self.fsm.set_dual(record.dual.map(|pair| DualContext {
            pair,
            mono_preview: self.snapshot.mono_preview,
        }));
        for id in &record.linked {
            let Some(identity) = self.inventory.cameras.iter().find(|c| c.id == *id) else {
                continue;
            };
            self.fsm.register(*id, camera_context(&self.snapshot, identity));
            self.controls.insert(*id, CameraControls::new(identity));
        }
    }

    /// Opens the next linked camera that is not open yet. Returns `true`
    /// when all of them are open.
    fn open_next(&mut self, record: &TopologyRecord) -> Result<bool, CaptureError> {
        for id in &record.linked {
            match self.registry.state(*id) {
                Some(DeviceState::Open) => continue,
                Some(DeviceState::Opening) => return Ok(false),
                None => {
                    self.registry.open(*id, &mut *self.hal)?;
                    return Ok(false);
                },
            }
        }
        Ok(true)
    }

    fn switch(&mut self, mode: CameraMode, facing: Facing) -> Result<(), CaptureError> {
        if mode == self.mode && facing == self.facing {
            return Ok(());
        }
        if !self.topology.supports(mode, facing) {
            return Err(CaptureError::NoTopology(mode));
        }
        if !self.sessions.switch_allowed() {
            return Err(CaptureError::ConfigurationInProgress);
        }
        if mode != self.mode {
            self.post(CaptureEvent::ModeChanged(mode));
        }
        self.mode = mode;
        self.facing = facing;
        self.restart_all()
    }

    // HAL events

    fn on_hal_event(&mut self, event: HalEvent) {
        match event {
            HalEvent::DeviceOpened { camera } => self.on_device_opened(camera),
            HalEvent::DeviceClosed { camera } => trace!(%camera, "device closed"),
            HalEvent::DeviceDisconnected { camera } => self.on_device_lost(camera, None),
            HalEvent::DeviceError { camera, code } => self.on_device_lost(camera, Some(code)),
            HalEvent::SessionConfigured {
                camera,
                generation,
                session,
            } => self.on_session_configured(camera, generation, session),
            HalEvent::SessionConfigureFailed {
                camera,
                generation,
                reason,
            } => {
                if self
                    .sessions
                    .on_configure_failed(camera, generation, &mut *self.hal)
                {
                    self.fail_session(camera, reason);
                }
            },
            HalEvent::CaptureProgressed(result) | HalEvent::CaptureCompleted(result) => {
                self.on_capture_result(result)
            },
            HalEvent::CaptureFailed {
                camera,
                token,
                intent,
            } => self.on_capture_failed(camera, token, intent),
            HalEvent::ImageAvailable(image) => self.on_image(image),
        }
    }

    fn on_device_opened(&mut self, camera: CameraId) {
        let wanted = !self.paused && self.registry.on_opened(camera);
        let record = match self.record() {
            Ok(record) if wanted && record.requires(camera) => record,
            _ => {
                debug!(%camera, "closing a device nobody is waiting for");
                self.registry.on_lost(camera);
                if let Err(e) = self.hal.close_device(camera) {
                    warn!(%camera, error = %e, "failed to close stray device");
                }
                return;
            },
        };

        info!(%camera, "camera opened");
        self.post(CaptureEvent::CameraOpened { camera });
        match self.open_next(&record) {
            Ok(true) => self.create_preview_sessions(&record),
            Ok(false) => {},
            Err(e) => self.report(&e),
        }
    }

    fn on_device_lost(&mut self, camera: CameraId, code: Option<i32>) {
        self.registry.on_lost(camera);
        self.stills.remove(&camera);
        self.sessions.close(camera, &mut *self.hal);
        match code {
            Some(code) => {
                error!(%camera, code, "unrecoverable camera device error");
                self.post(CaptureEvent::UnrecoverableDeviceError { camera, code });
                self.fatal = true;
                self.teardown();
                self.fsm.close_all();
            },
            None => {
                warn!(%camera, "camera disconnected");
                self.fsm.close(camera);
                self.post(CaptureEvent::Warning(format!("camera {camera} disconnected")));
            },
        }
    }

    fn create_preview_sessions(&mut self, record: &TopologyRecord) {
        if !self.preview_latch.wait_for(self.config.surface_timeout) {
            warn!(timeout = ?self.config.surface_timeout, "preview surface not ready");
            self.post(CaptureEvent::Warning("preview surface not ready".into()));
            return;
        }
        let plans = record
            .linked
            .iter()
            .filter(|id| self.registry.is_open(**id))
            .filter_map(|id| self.plan(*id, SessionPurpose::Preview))
            .collect();
        if let Err(e) = self.begin_sessions(plans) {
            self.report(&e);
        }
    }

    fn plan(&self, camera: CameraId, purpose: SessionPurpose) -> Option<SessionPlan> {
        let identity = self.identity(camera)?;
        Some(plan_session(
            identity,
            &self.snapshot,
            self.mode,
            purpose,
            &self.inventory.features,
            &self.config,
        ))
    }

    fn begin_sessions(&mut self, plans: Vec<SessionPlan>) -> Result<(), CaptureError> {
        let failures = self.sessions.begin(plans, &mut *self.hal)?;
        for failure in failures {
            self.fail_session(failure.camera, failure.error.to_string());
        }
        Ok(())
    }

    fn fail_session(&mut self, camera: CameraId, reason: String) {
        warn!(%camera, %reason, "session configuration failed");
        if self.recording.is_some_and(|r| r.camera == camera) {
            self.recording = None;
        }
        self.post(CaptureEvent::ConfigurationFailed { camera, reason });
    }

    fn on_session_configured(&mut self, camera: CameraId, generation: u64, handle: SessionHandle) {
        if self.paused || !self.registry.is_open(camera) {
            debug!(%camera, %handle, "closing session for a closed camera");
            self.hal.close_session(handle);
            return;
        }
        let Some(descriptor) = self.sessions.on_configured(camera, generation, handle) else {
            self.hal.close_session(handle);
            return;
        };
        let (kind, purpose, high_speed) =
            (descriptor.kind, descriptor.purpose, descriptor.high_speed_fps.is_some());
        info!(%camera, %kind, %purpose, "session configured");

        if let Some(identity) = self.inventory.cameras.iter().find(|c| c.id == camera)
            && let Some(controls) = self.controls.get_mut(&camera)
        {
            let zoom = self
                .snapshot
                .zoom
                .min(identity.capabilities.max_zoom.max(1.0));
            controls.crop = Some(crop_region_for_zoom(&identity.active_array, zoom));
        }
        self.fsm.reset(camera);

        let intent = match purpose {
            SessionPurpose::Preview => CaptureIntent::Preview,
            SessionPurpose::Recording => CaptureIntent::VideoRecord,
        };
        let (_, mut issuer, _) = self.split();
        if let Err(e) = issuer.repeat(camera, intent) {
            self.report(&e);
            return;
        }

        self.post(CaptureEvent::SessionReady { camera, kind });
        if purpose == SessionPurpose::Recording
            && let Some(rec) = self.recording.as_mut()
            && rec.camera == camera
        {
            rec.started = true;
            self.post(CaptureEvent::RecordingStarted { camera, high_speed });
        }
        if self.all_configured() {
            self.post(CaptureEvent::ShutterEnabled(true));
        }
    }

    fn all_configured(&self) -> bool {
        self.record().is_ok_and(|r| {
            r.linked
                .iter()
                .all(|id| self.sessions.phase(*id) == SessionPhase::Configured)
        })
    }

    fn on_capture_result(&mut self, result: CaptureResult) {
        let current = self.sessions.descriptor(result.camera).map(|d| d.handle);
        if self.paused
            || current.is_none()
            || result.session.is_some_and(|s| Some(s) != current)
        {
            trace!(camera = %result.camera, token = %result.token, "dropping result for a closed session");
            return;
        }
        self.last_sensor_ts = self.last_sensor_ts.max(result.timestamp_ns);
        {
            let (fsm, mut issuer, dispatcher) = self.split();
            dispatcher.dispatch(&result, |r| fsm.on_result(r, &mut issuer));
        }
        if !result.partial && result.intent == CaptureIntent::StillCapture {
            if self.take_still(result.camera, result.token) {
                self.on_still_done(result.camera);
            } else {
                debug!(camera = %result.camera, token = %result.token, "ignoring an unexpected still result");
            }
        }
    }

    /// Consumes the pending still of `camera` when `token` is the one issued.
    fn take_still(&mut self, camera: CameraId, token: RequestToken) -> bool {
        if self.stills.get(&camera) != Some(&token) {
            return false;
        }
        self.stills.remove(&camera);
        true
    }

    fn on_capture_failed(&mut self, camera: CameraId, token: RequestToken, intent: CaptureIntent) {
        warn!(%camera, %token, %intent, "capture failed");
        if intent != CaptureIntent::StillCapture || !self.take_still(camera, token) {
            return;
        }
        if self.longshot.is_active_for(camera) {
            self.finish_longshot(camera);
        } else {
            self.post(CaptureEvent::Warning("capture failed".into()));
            self.unlock(camera);
        }
    }

    fn on_image(&mut self, image: CapturedImage) {
        let camera = image.camera;
        if self.paused || !self.registry.is_open(camera) {
            debug!(%camera, ts = image.timestamp_ns, "discarding buffer from a closed camera");
            return;
        }
        if !self.longshot.accept_image(camera, image.timestamp_ns) {
            debug!(%camera, ts = image.timestamp_ns, "discarding out-of-order buffer");
            return;
        }
        self.last_sensor_ts = self.last_sensor_ts.max(image.timestamp_ns);
        self.image_seq += 1;
        let suffix = if self.identity(camera).is_some_and(CameraIdentity::is_mono) {
            "_MONO"
        } else {
            ""
        };
        let title = format!(
            "IMG_{}_{:04}{suffix}",
            image.timestamp_ns / 1_000_000,
            self.image_seq
        );
        let item = MediaItem::from_image(&image, title, self.view.display_orientation);
        if let Err(e) = self.saves.submit(item) {
            warn!(%camera, error = %e, "failed to queue image");
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let expired: Vec<CameraId> = self
            .touch_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(camera, _)| *camera)
            .collect();
        for camera in expired {
            self.touch_deadlines.remove(&camera);
            debug!(%camera, "touch focus timed out");
            let (fsm, mut issuer, _) = self.split();
            if let Err(e) = fsm.cancel_touch_focus(camera, &mut issuer) {
                warn!(%camera, error = %e, "failed to cancel touch focus");
            }
        }
    }

    // Still capture

    fn ensure_ready(&self) -> Result<TopologyRecord, CaptureError> {
        if self.paused {
            return Err(CaptureError::not_ready("capture is paused"));
        }
        let record = self.record()?;
        if let Some(id) = record
            .linked
            .iter()
            .find(|id| self.sessions.phase(**id) != SessionPhase::Configured)
        {
            return Err(CaptureError::not_ready(format!(
                "camera {id} has no configured session"
            )));
        }
        Ok(record)
    }

    fn check_resources(&self) -> Result<(), CaptureError> {
        if let Some(available) = self.monitor.available_storage()
            && available < self.config.low_storage_threshold
        {
            return Err(CaptureError::LowStorage {
                available,
                required: self.config.low_storage_threshold,
            });
        }
        if self.monitor.memory_low() {
            return Err(CaptureError::LowMemory);
        }
        Ok(())
    }

    fn take_picture(&mut self) -> Result<(), CaptureError> {
        let record = self.ensure_ready()?;
        if self.recording.is_some() {
            return Err(CaptureError::not_ready(
                "recording in progress, take a video snapshot instead",
            ));
        }
        if self.longshot.is_active() {
            return Err(CaptureError::not_ready("a longshot is in progress"));
        }
        self.check_resources()?;
        self.touch_deadlines.clear();

        let outcome = if let Some(pair) = record.dual {
            let (fsm, mut issuer, _) = self.split();
            fsm.lock_focus(pair.bayer, &mut issuer)
                .and_then(|_| fsm.lock_focus(pair.mono, &mut issuer))
        } else {
            let camera = record.primary;
            let zsl = self.session_kind(camera) == Some(SessionKind::Reprocessable)
                && self.snapshot.flash == FlashPolicy::Off;
            let locked = self.fsm.state(camera) == Some(CaptureState::AfAeLocked);
            let (fsm, mut issuer, _) = self.split();
            if zsl || locked {
                fsm.capture_now(camera, &mut issuer)
            } else {
                fsm.lock_focus(camera, &mut issuer)
            }
        };
        outcome?;
        self.post(CaptureEvent::ShutterEnabled(false));
        Ok(())
    }

    fn on_still_done(&mut self, camera: CameraId) {
        if self.longshot.is_active_for(camera) {
            let step = self.longshot.on_frame_completed();
            self.post(CaptureEvent::LongshotProgress {
                taken: self.longshot.frames(),
                limit: self.longshot.limit(),
            });
            let next = match step {
                BurstStep::Finish => None,
                BurstStep::Continue => Some(self.check_resources().and_then(|_| {
                    let (fsm, mut issuer, _) = self.split();
                    fsm.capture_next(camera, &mut issuer)
                })),
            };
            match next {
                Some(Ok(())) => {},
                Some(Err(e)) => {
                    self.report(&e);
                    self.finish_longshot(camera);
                },
                None => self.finish_longshot(camera),
            }
            return;
        }

        if self.config.intent_mode.is_still_intent() {
            if let Ok(session) = self.sessions.open_session(camera).map(|d| d.handle)
                && let Err(e) = self.hal.stop_repeating(session)
            {
                warn!(%camera, error = %e, "failed to stop preview for review");
            }
            self.post(CaptureEvent::ReviewRequested);
            return;
        }
        self.unlock(camera);
    }

    fn unlock(&mut self, camera: CameraId) {
        let (fsm, mut issuer, _) = self.split();
        if let Err(e) = fsm.unlock_focus(camera, &mut issuer) {
            warn!(%camera, error = %e, "failed to unlock focus");
        }
        self.post(CaptureEvent::ShutterEnabled(true));
    }

    fn unlock_all(&mut self) -> Result<(), CaptureError> {
        let record = self.ensure_ready()?;
        self.touch_deadlines.clear();
        for camera in record.linked {
            self.unlock(camera);
        }
        Ok(())
    }

    fn lock_af_ae(&mut self) -> Result<(), CaptureError> {
        let record = self.ensure_ready()?;
        self.touch_deadlines.clear();
        let (fsm, mut issuer, _) = self.split();
        for camera in record.linked {
            fsm.lock_af_ae(camera, &mut issuer)?;
        }
        Ok(())
    }

    fn start_longshot(&mut self) -> Result<(), CaptureError> {
        let record = self.ensure_ready()?;
        if self.recording.is_some() || self.longshot.is_active() {
            return Err(CaptureError::not_ready("another capture is in progress"));
        }
        if record.dual.is_some() {
            return Err(CaptureError::unsupported("longshot is not available in dual mode"));
        }
        self.check_resources()?;

        let camera = record.primary;
        let limit = self
            .snapshot
            .longshot_limit
            .unwrap_or(self.config.longshot_limit);
        self.longshot.begin(camera, limit);
        if let Some(controls) = self.controls.get_mut(&camera) {
            controls.longshot = true;
        }
        let (fsm, mut issuer, _) = self.split();
        if let Err(e) = fsm.capture_now(camera, &mut issuer) {
            self.longshot.finalize();
            if let Some(controls) = self.controls.get_mut(&camera) {
                controls.longshot = false;
            }
            return Err(e);
        }
        info!(%camera, limit, "longshot started");
        self.post(CaptureEvent::ShutterEnabled(false));
        Ok(())
    }

    fn finish_longshot(&mut self, camera: CameraId) {
        if !self.longshot.finalize() {
            return;
        }
        if let Some(controls) = self.controls.get_mut(&camera) {
            controls.longshot = false;
        }
        let taken = self.longshot.frames();
        info!(%camera, taken, "longshot finished");
        self.post(CaptureEvent::LongshotFinished { taken });
        self.unlock(camera);
    }

    // Touch focus

    fn touch_focus(&mut self, x: f32, y: f32) -> Result<(), CaptureError> {
        if self.paused {
            return Err(CaptureError::not_ready("capture is paused"));
        }
        let camera = self.record()?.primary;
        let identity = self
            .inventory
            .cameras
            .iter()
            .find(|c| c.id == camera)
            .ok_or(CaptureError::NoCamera)?;
        let crop = self
            .controls
            .get(&camera)
            .ok_or(CaptureError::SessionClosed(camera))?
            .crop
            .ok_or(CaptureError::CropRegionUnset(camera))?;
        self.ensure_ready()?;

        let Some(controls) = self.controls.get_mut(&camera) else {
            return Err(CaptureError::SessionClosed(camera));
        };
        let view = self.view.with_mirror(identity.facing == Facing::Front);
        let region = |kind| metering_region(x, y, &view, kind, &identity.active_array, &crop);
        controls.af_regions = region(RegionKind::Focus).into_iter().collect();
        controls.ae_regions = region(RegionKind::Exposure).into_iter().collect();
        if self.snapshot.touch_tracking
            && let Some(t) = region(RegionKind::Tracking)
        {
            controls.vendor.set(
                TRACKING_ROI_KEY,
                VendorValue::Ints(vec![t.rect.left, t.rect.top, t.rect.width(), t.rect.height()]),
            );
        }

        self.touch_deadlines.remove(&camera);
        let (fsm, mut issuer, _) = self.split();
        fsm.autofocus_trigger(camera, &mut issuer)?;
        self.touch_deadlines
            .insert(camera, Instant::now() + self.config.touch_focus_timeout);
        Ok(())
    }

    fn cancel_touch_focus(&mut self) {
        let cameras: Vec<CameraId> = std::mem::take(&mut self.touch_deadlines)
            .into_keys()
            .collect();
        for camera in cameras {
            let (fsm, mut issuer, _) = self.split();
            if let Err(e) = fsm.cancel_touch_focus(camera, &mut issuer) {
                warn!(%camera, error = %e, "failed to cancel touch focus");
            }
        }
    }

    // Recording

    fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.config.intent_mode.is_still_intent() {
            return Err(CaptureError::unsupported(
                "recording is not available for a still capture request",
            ));
        }
        if !self.mode.is_video() {
            return Err(CaptureError::unsupported(format!(
                "recording needs video or hfr mode, not {}",
                self.mode
            )));
        }
        if self.recording.is_some() {
            return Ok(());
        }
        let record = self.ensure_ready()?;
        self.check_resources()?;

        let camera = record.primary;
        let plan = self
            .plan(camera, SessionPurpose::Recording)
            .ok_or(CaptureError::NoCamera)?;
        self.recording = Some(Recording {
            camera,
            high_speed: plan.high_speed_fps.is_some(),
            started: false,
        });
        self.touch_deadlines.clear();
        if let Err(e) = self.begin_sessions(vec![plan]) {
            self.recording = None;
            return Err(e);
        }
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<(), CaptureError> {
        let Some(rec) = self.recording.take() else {
            return Ok(());
        };
        self.sessions.close(rec.camera, &mut *self.hal);
        if rec.started {
            info!(camera = %rec.camera, "recording stopped");
            self.post(CaptureEvent::RecordingStopped { camera: rec.camera });
        }
        if self.config.intent_mode == super::CaptureIntentMode::VideoCaptureIntent {
            self.post(CaptureEvent::ReviewRequested);
        }
        let record = self.record()?;
        self.create_preview_sessions(&record);
        Ok(())
    }

    fn video_snapshot(&mut self) -> Result<(), CaptureError> {
        let Some(rec) = self.recording.filter(|r| r.started) else {
            return Err(CaptureError::not_ready("not recording"));
        };
        if rec.high_speed {
            return Err(CaptureError::unsupported(
                "snapshots are not available while recording at high speed",
            ));
        }
        self.check_resources()?;
        let (_, mut issuer, _) = self.split();
        issuer.capture(rec.camera, CaptureIntent::VideoSnapshot)?;
        Ok(())
    }

    // Settings

    fn on_settings_changed(&mut self, changed: &BTreeSet<String>) -> Result<(), CaptureError> {
        let snapshot = SettingsSnapshot::load(&*self.settings);
        if keys::needs_restart(changed) {
            let (mode, facing) = resolve_mode(&self.config, &snapshot, &self.topology)?;
            self.snapshot = snapshot;
            if !self.sessions.switch_allowed() {
                return Err(CaptureError::ConfigurationInProgress);
            }
            if mode != self.mode {
                self.post(CaptureEvent::ModeChanged(mode));
            }
            self.mode = mode;
            self.facing = facing;
            info!(keys = ?changed, "settings change requires a restart");
            return self.restart_all();
        }

        self.snapshot = snapshot;
        self.dispatcher.set_stats_enabled(self.snapshot.histogram);
        if let Ok(record) = self.record() {
            self.fsm.set_dual(record.dual.map(|pair| DualContext {
                pair,
                mono_preview: self.snapshot.mono_preview,
            }));
        }
        for identity in &self.inventory.cameras {
            self.fsm
                .set_context(identity.id, camera_context(&self.snapshot, identity));
        }
        if changed.contains(keys::ZOOM) {
            self.apply_zoom();
        }
        self.refresh_previews();
        Ok(())
    }

    fn apply_zoom(&mut self) {
        for (camera, controls) in self.controls.iter_mut() {
            let Some(identity) = self.inventory.cameras.iter().find(|c| c.id == *camera) else {
                continue;
            };
            if controls.crop.is_some() {
                let zoom = self
                    .snapshot
                    .zoom
                    .min(identity.capabilities.max_zoom.max(1.0));
                controls.crop = Some(crop_region_for_zoom(&identity.active_array, zoom));
            }
        }
    }

    /// Re-issues the repeating request of every idle configured session.
    fn refresh_previews(&mut self) {
        for camera in self.sessions.configured() {
            if !self.fsm.state(camera).is_some_and(CaptureState::is_idle) {
                continue;
            }
            let (_, mut issuer, _) = self.split();
            if let Err(e) = issuer.repeat(camera, CaptureIntent::Preview) {
                warn!(%camera, error = %e, "failed to refresh preview");
            }
        }
    }
}

fn camera_context(snapshot: &SettingsSnapshot, identity: &CameraIdentity) -> CameraContext {
    let caps = &identity.capabilities;
    CameraContext {
        flash: if caps.flash {
            snapshot.flash
        } else {
            FlashPolicy::Off
        },
        fixed_focus: !caps.autofocus || snapshot.scene.is_fixed_focus(),
    }
}

/// Mode and facing to run, honoring the launch intent and what the device
/// can actually do.
fn resolve_mode(
    config: &CaptureConfig,
    snapshot: &SettingsSnapshot,
    topology: &ModeTopology,
) -> Result<(CameraMode, Facing), CaptureError> {
    let mut mode = snapshot.mode;
    if config.intent_mode == super::CaptureIntentMode::VideoCaptureIntent && !mode.is_video() {
        mode = CameraMode::Video;
    }
    if config.intent_mode.is_still_intent() && mode.is_video() {
        mode = CameraMode::Photo;
    }
    let candidates = [
        (mode, snapshot.facing),
        (CameraMode::Photo, snapshot.facing),
        (CameraMode::Photo, Facing::Back),
        (CameraMode::Photo, Facing::Front),
    ];
    candidates
        .into_iter()
        .find(|(m, f)| topology.supports(*m, *f))
        .ok_or(CaptureError::NoTopology(mode))
}

/// The engine's [`RequestIssuer`]: builds requests from the current
/// controls and submits them to the configured session.
struct Issuer<'a> {
    hal: &'a mut dyn CameraHal,
    sessions: &'a SessionOrchestrator,
    builder: &'a mut RequestBuilder,
    controls: &'a mut BTreeMap<CameraId, CameraControls>,
    stills: &'a mut BTreeMap<CameraId, RequestToken>,
    settings: &'a SettingsSnapshot,
    events: &'a SyncSender<CaptureEvent>,
}

impl Issuer<'_> {
    fn build(
        &mut self,
        camera: CameraId,
        intent: CaptureIntent,
    ) -> Result<(SessionHandle, CaptureRequest, Option<u32>), CaptureError> {
        let session = self.sessions.open_session(camera)?;
        let controls = self
            .controls
            .get(&camera)
            .ok_or(CaptureError::SessionClosed(camera))?;
        let request = self
            .builder
            .build(controls, intent, self.settings, session.targets_for(intent));
        Ok((session.handle, request, session.high_speed_fps))
    }

    fn capture(
        &mut self,
        camera: CameraId,
        intent: CaptureIntent,
    ) -> Result<RequestToken, CaptureError> {
        let (session, request, _) = self.build(camera, intent)?;
        trace!(%camera, %intent, token = %request.token, "capture");
        self.hal.capture(session, &request)?;
        Ok(request.token)
    }

    /// Replaces the repeating request. A recording session keeps recording.
    fn repeat(
        &mut self,
        camera: CameraId,
        intent: CaptureIntent,
    ) -> Result<RequestToken, CaptureError> {
        let recording = self.sessions.open_session(camera)?.purpose == SessionPurpose::Recording;
        let intent = if recording && intent == CaptureIntent::Preview {
            CaptureIntent::VideoRecord
        } else {
            intent
        };
        let (session, request, high_speed_fps) = self.build(camera, intent)?;
        match high_speed_fps {
            Some(fps) => self
                .hal
                .set_repeating(session, &high_speed_list(&request, fps))?,
            None => self
                .hal
                .set_repeating(session, std::slice::from_ref(&request))?,
        }
        Ok(request.token)
    }
}

impl RequestIssuer for Issuer<'_> {
    fn lock_focus(&mut self, camera: CameraId) -> Result<RequestToken, CaptureError> {
        self.capture(camera, CaptureIntent::LockFocus)
    }

    fn run_precapture(&mut self, camera: CameraId) -> Result<RequestToken, CaptureError> {
        self.capture(camera, CaptureIntent::Precapture(PrecaptureTrigger::Start))
    }

    fn lock_exposure(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        self.repeat(camera, CaptureIntent::LockExposure)?;
        if let Some(controls) = self.controls.get_mut(&camera) {
            controls.ae_locked = true;
        }
        Ok(())
    }

    fn capture_still(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        let token = self.capture(camera, CaptureIntent::StillCapture)?;
        self.stills.insert(camera, token);
        post_event(self.events, CaptureEvent::PictureTaken { camera });
        Ok(())
    }

    fn hold_preview(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        self.repeat(camera, CaptureIntent::Preview).map(|_| ())
    }

    fn stop_preview(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        let session = self.sessions.open_session(camera)?.handle;
        self.hal.stop_repeating(session)
    }

    fn unlock_focus(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        self.capture(camera, CaptureIntent::UnlockFocus)?;
        if let Some(controls) = self.controls.get_mut(&camera) {
            controls.reset_focus();
        }
        self.repeat(camera, CaptureIntent::Preview).map(|_| ())
    }

    fn auto_focus(&mut self, camera: CameraId) -> Result<(), CaptureError> {
        self.capture(camera, CaptureIntent::AutoFocus)?;
        if let Some(controls) = self.controls.get_mut(&camera)
            && controls.af_mode != super::AfMode::Off
        {
            controls.af_mode = super::AfMode::Auto;
        }
        self.repeat(camera, CaptureIntent::Preview).map(|_| ())
    }

    fn touch_precapture(
        &mut self,
        camera: CameraId,
        trigger: PrecaptureTrigger,
    ) -> Result<RequestToken, CaptureError> {
        self.capture(camera, CaptureIntent::Precapture(trigger))
    }

    fn focus_settled(&mut self, camera: CameraId, focused: bool) {
        post_event(self.events, CaptureEvent::FocusSettled { camera, focused });
    }
}
