// This is free and unencumbered software released into the public domain.

#![cfg(feature = "simulator")]

use asimov_capture_module::shared::{
    CameraMode, CaptureConfig, CaptureEvent, CaptureResult, CaptureRuntime, Collaborators,
    Command, MemorySettings, drivers::simulated::{SimProfile, SimulatedHal}, keys,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

fn wait_for(runtime: &CaptureRuntime, done: impl Fn(&CaptureEvent) -> bool) -> Vec<CaptureEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = runtime
            .events()
            .recv_timeout(left)
            .unwrap_or_else(|_| panic!("timed out; events so far: {seen:?}"));
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

#[test]
fn runs_a_photo_on_the_capture_thread() {
    let hal = SimulatedHal::new(SimProfile::single());
    let mut runtime =
        CaptureRuntime::start(Box::new(hal), CaptureConfig::default(), Collaborators::default())
            .unwrap();

    let results = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&results);
    runtime.add_result_sink(Arc::new(move |_: &CaptureResult| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    runtime.preview_surface_ready();
    runtime.send(Command::Open).unwrap();
    wait_for(&runtime, |e| *e == CaptureEvent::ShutterEnabled(true));

    runtime.send(Command::TakePicture).unwrap();
    let events = wait_for(&runtime, |e| matches!(e, CaptureEvent::ImageSaved { .. }));
    assert!(events.contains(&CaptureEvent::ShutterEnabled(false)));
    assert!(results.load(Ordering::Relaxed) > 0);

    runtime.stop();
    assert!(runtime.send(Command::TakePicture).is_err());
}

#[test]
fn settings_changes_reach_the_engine() {
    let settings = MemorySettings::new();
    let collaborators = Collaborators::default().with_settings(Arc::new(settings.clone()));
    let hal = SimulatedHal::new(SimProfile::single());
    let runtime = CaptureRuntime::start(Box::new(hal), CaptureConfig::default(), collaborators)
        .unwrap();

    runtime.preview_surface_ready();
    runtime.send(Command::Open).unwrap();
    wait_for(&runtime, |e| *e == CaptureEvent::ShutterEnabled(true));

    settings.set(keys::CAMERA_MODE, "video");
    wait_for(&runtime, |e| *e == CaptureEvent::ModeChanged(CameraMode::Video));
    wait_for(&runtime, |e| *e == CaptureEvent::ShutterEnabled(true));

    runtime.send(Command::StartRecording).unwrap();
    wait_for(&runtime, |e| matches!(e, CaptureEvent::RecordingStarted { .. }));
}

#[test]
fn open_waits_for_the_preview_surface() {
    let hal = SimulatedHal::new(SimProfile::single());
    let config = CaptureConfig::default().with_surface_timeout(Duration::from_millis(50));
    let runtime = CaptureRuntime::start(Box::new(hal), config, Collaborators::default()).unwrap();

    runtime.send(Command::Open).unwrap();
    let events = wait_for(&runtime, |e| matches!(e, CaptureEvent::Warning(_)));
    assert!(!events.contains(&CaptureEvent::ShutterEnabled(true)));
}
