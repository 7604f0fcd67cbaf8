// This is free and unencumbered software released into the public domain.

#![cfg(feature = "simulator")]

use asimov_capture_module::shared::{
    CameraId, CameraMode, CaptureConfig, CaptureEngine, CaptureError, CaptureEvent, CaptureIntent,
    CaptureIntentMode, CaptureResult, CaptureState, Collaborators, Command, EngineMsg, HalEvent,
    MemorySettings, PrecaptureTrigger, RequestToken, SessionKind, SessionPhase,
    drivers::simulated::{DEVICE_ERROR_CODE, Journal, JournalEntry, SimProfile, SimulatedHal},
    keys,
};
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        mpsc::{Receiver, channel, sync_channel},
    },
    time::{Duration, Instant},
};

const BACK: CameraId = CameraId(0);
const MONO: CameraId = CameraId(2);

/// An engine driven on the test thread. Every HAL completion is queued
/// before the call that caused it returns, so draining the queue runs a
/// flow to quiescence.
struct Rig {
    engine: CaptureEngine,
    rx: Receiver<EngineMsg>,
    events: Receiver<CaptureEvent>,
    journal: Journal,
    settings: MemorySettings,
    saved: Vec<String>,
}

impl Rig {
    fn new(profile: SimProfile, settings: MemorySettings) -> Self {
        Self::with_config(profile, settings, CaptureConfig::default())
    }

    fn with_config(profile: SimProfile, settings: MemorySettings, config: CaptureConfig) -> Self {
        let hal = SimulatedHal::new(profile);
        let journal = hal.journal();
        let (tx, rx) = channel();
        let (events_tx, events) = sync_channel(256);
        let collaborators = Collaborators::default().with_settings(Arc::new(settings.clone()));
        let engine = CaptureEngine::new(Box::new(hal), config, collaborators, tx, events_tx)
            .expect("engine starts");
        engine.preview_latch().open();
        Self {
            engine,
            rx,
            events,
            journal,
            settings,
            saved: Vec::new(),
        }
    }

    fn pump(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.engine.handle(msg);
        }
    }

    fn run(&mut self, cmd: Command) -> Vec<CaptureEvent> {
        self.engine.handle(EngineMsg::Command(cmd));
        self.pump();
        self.drain()
    }

    /// Engine events so far. Saved-image notifications come from the save
    /// thread at any time, so they are set aside for [`Rig::saved`].
    fn drain(&mut self) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        for event in self.events.try_iter() {
            match event {
                CaptureEvent::ImageSaved { title, .. } => self.saved.push(title),
                other => events.push(other),
            }
        }
        events
    }

    /// Waits up to `timeout` for `n` images to come back from the save thread.
    fn saved_within(&mut self, n: usize, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        while self.saved.len() < n {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(CaptureEvent::ImageSaved { title, .. }) => self.saved.push(title),
                Ok(_) => {},
                Err(_) => break,
            }
        }
        std::mem::take(&mut self.saved)
    }

    fn saved(&mut self, n: usize) -> Vec<String> {
        self.saved_within(n, Duration::from_secs(5))
    }

    fn captures_on(&self, camera: CameraId, intent: CaptureIntent) -> usize {
        self.journal.count(|e| {
            matches!(e, JournalEntry::Capture { camera: c, intent: i, .. } if *c == camera && *i == intent)
        })
    }
}

fn photo() -> MemorySettings {
    MemorySettings::new()
}

fn has(events: &[CaptureEvent], event: &CaptureEvent) -> bool {
    events.iter().any(|e| e == event)
}

fn warned(events: &[CaptureEvent]) -> bool {
    events.iter().any(|e| matches!(e, CaptureEvent::Warning(_)))
}

#[test]
fn open_configures_one_session_per_camera() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    let events = rig.run(Command::Open);

    assert!(has(&events, &CaptureEvent::CameraOpened { camera: BACK }));
    assert!(has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configured);
    assert_eq!(rig.engine.session_kind(BACK), Some(SessionKind::Regular));
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
    assert_eq!(
        rig.journal.count(|e| matches!(e, JournalEntry::CreateSession { .. })),
        1
    );
    assert_eq!(rig.journal.entries()[0], JournalEntry::OpenDevice(BACK));
}

#[test]
fn photo_locks_focus_then_exposure_then_captures() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);
    let events = rig.run(Command::TakePicture);

    assert!(has(&events, &CaptureEvent::ShutterEnabled(false)));
    assert!(has(&events, &CaptureEvent::PictureTaken { camera: BACK }));
    assert_eq!(rig.journal.captures(CaptureIntent::LockFocus), 1);
    assert_eq!(
        rig.journal
            .captures(CaptureIntent::Precapture(PrecaptureTrigger::Start)),
        0
    );
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
    assert_eq!(rig.journal.captures(CaptureIntent::UnlockFocus), 1);
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
    assert_eq!(events.last(), Some(&CaptureEvent::ShutterEnabled(true)));

    let titles = rig.saved(1);
    assert_eq!(titles.len(), 1);
    assert!(titles[0].starts_with("IMG_"), "{titles:?}");
}

#[test]
fn low_light_runs_precapture_before_the_still() {
    let mut rig = Rig::new(SimProfile::single().with_low_light(), photo());
    rig.run(Command::Open);
    rig.run(Command::TakePicture);

    assert_eq!(
        rig.journal
            .captures(CaptureIntent::Precapture(PrecaptureTrigger::Start)),
        1
    );
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
}

#[test]
fn forced_flash_always_runs_precapture() {
    let settings = photo().with(keys::FLASH, "on");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);
    rig.run(Command::TakePicture);

    assert_eq!(
        rig.journal
            .captures(CaptureIntent::Precapture(PrecaptureTrigger::Start)),
        1
    );
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
}

#[test]
fn missing_ae_state_counts_as_converged() {
    let mut rig = Rig::new(SimProfile::single().with_null_ae(), photo());
    rig.run(Command::Open);
    rig.run(Command::TakePicture);

    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
}

#[test]
fn zsl_session_captures_without_a_focus_lock() {
    let settings = photo().with(keys::ZSL, "true");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);
    assert_eq!(rig.engine.session_kind(BACK), Some(SessionKind::Reprocessable));

    rig.run(Command::TakePicture);
    assert_eq!(rig.journal.captures(CaptureIntent::LockFocus), 0);
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
}

#[test]
fn longshot_issues_exactly_the_limit() {
    let settings = photo().with(keys::LONGSHOT_LIMIT, "4");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);
    let events = rig.run(Command::StartLongshot);

    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 4);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::LongshotProgress { .. }))
            .count(),
        4
    );
    assert!(has(&events, &CaptureEvent::LongshotFinished { taken: 4 }));
    assert!(!rig.engine.longshot().is_active());
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
    assert_eq!(rig.saved(4).len(), 4);
}

#[test]
fn longshot_is_refused_in_dual_mode() {
    let settings = photo().with(keys::CAMERA_MODE, "dual");
    let mut rig = Rig::new(SimProfile::dual(), settings);
    rig.run(Command::Open);
    let events = rig.run(Command::StartLongshot);

    assert!(warned(&events));
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 0);
}

#[test]
fn dual_capture_waits_for_both_cameras() {
    let settings = photo().with(keys::CAMERA_MODE, "dual");
    let mut rig = Rig::new(SimProfile::dual(), settings);
    let events = rig.run(Command::Open);

    let opens: Vec<JournalEntry> = rig
        .journal
        .entries()
        .into_iter()
        .filter(|e| matches!(e, JournalEntry::OpenDevice(_)))
        .collect();
    assert_eq!(
        opens,
        vec![JournalEntry::OpenDevice(BACK), JournalEntry::OpenDevice(MONO)]
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::ShutterEnabled(true)))
            .count(),
        1
    );

    rig.run(Command::TakePicture);
    assert_eq!(rig.captures_on(BACK, CaptureIntent::StillCapture), 1);
    assert_eq!(rig.captures_on(MONO, CaptureIntent::StillCapture), 1);
    // Mono preview is off by default, so the mono stream stopped while waiting.
    assert_eq!(
        rig.journal
            .count(|e| matches!(e, JournalEntry::StopRepeating(_))),
        1
    );

    let titles = rig.saved(2);
    assert_eq!(titles.len(), 2);
    assert_eq!(titles.iter().filter(|t| t.ends_with("_MONO")).count(), 1);
}

#[test]
fn failed_configuration_leaves_no_session_and_allows_switching() {
    let settings = photo().with(keys::CAMERA_MODE, "dual");
    let mut rig = Rig::new(SimProfile::dual().with_configure_failures(2), settings);
    let events = rig.run(Command::Open);

    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::ConfigurationFailed { .. }))
            .count(),
        2
    );
    assert!(!has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::NoSession);
    assert_eq!(rig.engine.session_phase(MONO), SessionPhase::NoSession);
    assert!(rig.engine.switch_allowed());
    assert_eq!(rig.journal.live_surfaces(), 0);

    let events = rig.run(Command::SetMode(CameraMode::Photo));
    assert!(has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configured);
}

#[test]
fn repeated_configuration_failures_keep_switching_possible() {
    let mut rig = Rig::new(SimProfile::single().with_configure_failures(2), photo());

    for _ in 0..2 {
        let events = rig.run(Command::Open);
        assert!(events
            .iter()
            .any(|e| matches!(e, CaptureEvent::ConfigurationFailed { camera, .. } if *camera == BACK)));
        assert!(!has(&events, &CaptureEvent::ShutterEnabled(true)));
        assert_eq!(rig.engine.session_phase(BACK), SessionPhase::NoSession);
        assert!(rig.engine.switch_allowed());
        rig.run(Command::Close);
        assert_eq!(rig.journal.live_surfaces(), 0);
    }

    let events = rig.run(Command::Open);
    assert!(has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configured);
}

#[test]
fn mode_restart_leaves_no_token_behind() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);

    // The focus lock result is still queued when the mode changes.
    rig.engine.handle(EngineMsg::Command(Command::TakePicture));
    assert!(rig.engine.lock_token(BACK).is_some());

    let events = rig.run(Command::SetMode(CameraMode::Video));
    assert!(has(&events, &CaptureEvent::ModeChanged(CameraMode::Video)));
    assert!(has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(rig.engine.lock_token(BACK), None);
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configured);
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 0);
}

#[test]
fn results_from_a_replaced_session_are_ignored() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);
    rig.run(Command::Close);
    let old = rig
        .journal
        .entries()
        .into_iter()
        .find_map(|e| match e {
            JournalEntry::CloseSession(session) => Some(session),
            _ => None,
        })
        .expect("first session closed");
    rig.run(Command::Open);

    rig.engine.handle(EngineMsg::Command(Command::TakePicture));
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::WaitingAfLock));
    let token = rig.engine.lock_token(BACK).expect("focus lock issued");

    let late = CaptureResult::new(BACK, token, CaptureIntent::StillCapture).with_session(old);
    rig.engine.handle(EngineMsg::Hal(HalEvent::CaptureCompleted(late)));
    assert_eq!(rig.engine.lock_token(BACK), Some(token));

    let unknown = RequestToken::new(u64::MAX).expect("non-zero");
    let stray = CaptureResult::new(BACK, unknown, CaptureIntent::StillCapture);
    rig.engine.handle(EngineMsg::Hal(HalEvent::CaptureCompleted(stray)));
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::WaitingAfLock));
    assert_eq!(rig.journal.captures(CaptureIntent::UnlockFocus), 0);
    assert!(!has(&rig.drain(), &CaptureEvent::ShutterEnabled(true)));

    rig.pump();
    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
    assert_eq!(rig.journal.captures(CaptureIntent::UnlockFocus), 1);
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
}

#[test]
fn close_during_longshot_discards_late_buffers() {
    let settings = photo().with(keys::LONGSHOT_LIMIT, "5");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);

    // The first frame is still queued when the pause arrives.
    rig.engine
        .handle(EngineMsg::Command(Command::StartLongshot));
    rig.engine.handle(EngineMsg::Command(Command::Close));
    rig.pump();

    assert_eq!(rig.journal.captures(CaptureIntent::StillCapture), 1);
    assert_eq!(rig.engine.pending_saves(), 0);
    assert_eq!(rig.journal.live_surfaces(), 0);
    assert_eq!(
        rig.journal
            .count(|e| *e == JournalEntry::CloseDevice(BACK)),
        1
    );
    assert!(rig.saved_within(1, Duration::from_millis(300)).is_empty());
}

#[test]
fn touch_before_configuration_is_rejected() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    // Opening is requested but the device callback has not been handled yet.
    rig.engine.handle(EngineMsg::Command(Command::Open));

    let err = rig.engine.execute(Command::TouchFocus { x: 0.5, y: 0.5 });
    assert!(matches!(err, Err(CaptureError::CropRegionUnset(c)) if c == BACK));
    assert_eq!(rig.journal.captures(CaptureIntent::AutoFocus), 0);
}

#[test]
fn rejected_touch_keeps_the_metering_regions() {
    let settings = photo().with(keys::CAMERA_MODE, "video");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);

    // The recording session is still being configured.
    rig.engine.handle(EngineMsg::Command(Command::StartRecording));
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configuring);

    let err = rig.engine.execute(Command::TouchFocus { x: 0.5, y: 0.5 });
    assert!(matches!(err, Err(CaptureError::NotReady(_))));
    let controls = rig.engine.controls(BACK).expect("controls");
    assert!(controls.af_regions.is_empty());
    assert!(controls.ae_regions.is_empty());
    assert_eq!(rig.journal.captures(CaptureIntent::AutoFocus), 0);
}

#[test]
fn touch_focus_reports_and_times_out() {
    let config = CaptureConfig::default().with_touch_focus_timeout(Duration::ZERO);
    let mut rig = Rig::with_config(SimProfile::single(), photo(), config);
    rig.run(Command::Open);
    let events = rig.run(Command::TouchFocus { x: 0.25, y: 0.75 });

    assert_eq!(rig.journal.captures(CaptureIntent::AutoFocus), 1);
    assert!(has(
        &events,
        &CaptureEvent::FocusSettled {
            camera: BACK,
            focused: true
        }
    ));
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::WaitingTouchFocus));

    rig.engine.handle(EngineMsg::Tick);
    rig.pump();
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Preview));
    assert_eq!(rig.journal.captures(CaptureIntent::UnlockFocus), 1);
}

#[test]
fn failed_touch_scan_reports_unfocused() {
    let mut rig = Rig::new(SimProfile::single().with_af_failure(), photo());
    rig.run(Command::Open);
    let events = rig.run(Command::TouchFocus { x: 0.5, y: 0.5 });

    assert!(has(
        &events,
        &CaptureEvent::FocusSettled {
            camera: BACK,
            focused: false
        }
    ));
}

#[test]
fn device_error_closes_every_state() {
    let mut rig = Rig::new(SimProfile::single().with_open_failure(BACK), photo());
    let events = rig.run(Command::Open);

    assert!(has(
        &events,
        &CaptureEvent::UnrecoverableDeviceError {
            camera: BACK,
            code: DEVICE_ERROR_CODE
        }
    ));
    assert_eq!(rig.engine.state(BACK), Some(CaptureState::Closed));
    assert!(matches!(
        rig.engine.execute(Command::TakePicture),
        Err(CaptureError::Closed)
    ));
    assert!(rig.engine.execute(Command::Close).is_ok());
}

#[test]
fn recording_swaps_sessions_and_takes_snapshots() {
    let settings = photo().with(keys::CAMERA_MODE, "video");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);

    let events = rig.run(Command::StartRecording);
    assert!(has(
        &events,
        &CaptureEvent::RecordingStarted {
            camera: BACK,
            high_speed: false
        }
    ));
    assert!(rig.engine.is_recording());
    assert!(rig.journal.count(|e| matches!(
        e,
        JournalEntry::Repeating {
            intent: CaptureIntent::VideoRecord,
            ..
        }
    )) >= 1);

    rig.run(Command::VideoSnapshot);
    assert_eq!(rig.journal.captures(CaptureIntent::VideoSnapshot), 1);
    assert_eq!(rig.saved(1).len(), 1);

    let events = rig.run(Command::StopRecording);
    assert!(has(&events, &CaptureEvent::RecordingStopped { camera: BACK }));
    assert!(!rig.engine.is_recording());
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::Configured);
}

#[test]
fn high_speed_recording_uses_a_constrained_session() {
    let settings = photo().with(keys::CAMERA_MODE, "hfr");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);
    rig.run(Command::StartRecording);

    assert_eq!(
        rig.engine.session_kind(BACK),
        Some(SessionKind::ConstrainedHighSpeed)
    );
    assert!(rig.journal.count(|e| matches!(
        e,
        JournalEntry::Repeating {
            intent: CaptureIntent::VideoRecord,
            count: 4,
            ..
        }
    )) >= 1);
    assert!(matches!(
        rig.engine.execute(Command::VideoSnapshot),
        Err(CaptureError::Unsupported(_))
    ));
}

#[test]
fn recording_is_refused_in_photo_mode() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);
    assert!(matches!(
        rig.engine.execute(Command::StartRecording),
        Err(CaptureError::Unsupported(_))
    ));
}

#[test]
fn pause_releases_every_surface() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);
    assert!(rig.journal.live_surfaces() > 0);

    rig.run(Command::Close);
    assert!(rig.engine.is_paused());
    assert_eq!(rig.journal.live_surfaces(), 0);
    assert_eq!(rig.engine.session_phase(BACK), SessionPhase::NoSession);
    assert!(matches!(
        rig.engine.execute(Command::TakePicture),
        Err(CaptureError::NotReady(_))
    ));
}

#[test]
fn mode_setting_change_restarts_the_cameras() {
    let mut rig = Rig::new(SimProfile::single(), photo());
    rig.run(Command::Open);

    rig.settings.set(keys::CAMERA_MODE, "video");
    let changed = BTreeSet::from([keys::CAMERA_MODE.to_string()]);
    let events = rig.run(Command::SettingsChanged(changed));

    assert_eq!(
        rig.engine.mode(),
        CameraMode::Video
    );
    assert!(has(
        &events,
        &CaptureEvent::ModeChanged(CameraMode::Video)
    ));
    assert!(has(&events, &CaptureEvent::ShutterEnabled(true)));
    assert_eq!(
        rig.journal
            .count(|e| *e == JournalEntry::OpenDevice(BACK)),
        2
    );
}

#[test]
fn still_intent_stops_for_review() {
    let config = CaptureConfig::new(CaptureIntentMode::StillCaptureIntent);
    let mut rig = Rig::with_config(SimProfile::single(), photo(), config);
    rig.run(Command::Open);
    let events = rig.run(Command::TakePicture);

    assert!(has(&events, &CaptureEvent::ReviewRequested));
    assert_eq!(
        rig.journal
            .count(|e| matches!(e, JournalEntry::StopRepeating(_))),
        1
    );
    assert_eq!(rig.journal.captures(CaptureIntent::UnlockFocus), 0);
}

#[test]
fn histogram_statistics_reach_the_shared_buffers() {
    let settings = photo().with(keys::HISTOGRAM, "true");
    let mut rig = Rig::new(SimProfile::single(), settings);
    rig.run(Command::Open);
    rig.run(Command::TakePicture);

    let stats = rig.engine.stats();
    assert!(stats.updates() > 0);
    assert_eq!(stats.histogram().len(), 16);
}
