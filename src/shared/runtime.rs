// This is free and unencumbered software released into the public domain.

use super::{
    CameraHal, CaptureConfig, CaptureEngine, CaptureError, CaptureEvent, Collaborators, Command,
    EngineMsg, Latch, ResultSink, ResultSinks, StatsBuffers,
};
use std::{
    sync::{
        Arc,
        mpsc::{Receiver, RecvTimeoutError, Sender, channel, sync_channel},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Runs a [`CaptureEngine`] on its own capture-callback thread.
///
/// Commands and HAL completions share one queue, so the engine sees them in
/// arrival order and never needs a lock. UI effects come back on the bounded
/// [`events`](Self::events) channel.
pub struct CaptureRuntime {
    tx: Sender<EngineMsg>,
    events: Receiver<CaptureEvent>,
    stats: StatsBuffers,
    sinks: ResultSinks,
    preview_latch: Arc<Latch>,
    join: Option<JoinHandle<()>>,
}

impl CaptureRuntime {
    pub fn start(
        hal: Box<dyn CameraHal>,
        config: CaptureConfig,
        collaborators: Collaborators,
    ) -> Result<Self, CaptureError> {
        let (tx, rx) = channel::<EngineMsg>();
        let (events_tx, events) = sync_channel(config.event_capacity.max(1));
        let tick = config.tick_interval;
        let settings = Arc::clone(&collaborators.settings);

        let engine = CaptureEngine::new(hal, config, collaborators, tx.clone(), events_tx)?;
        let stats = engine.stats();
        let sinks = engine.result_sinks();
        let preview_latch = engine.preview_latch();

        let settings_tx = tx.clone();
        settings.subscribe(Box::new(move |keys| {
            let cmd = Command::SettingsChanged(keys.clone());
            if settings_tx.send(EngineMsg::Command(cmd)).is_err() {
                trace!("capture thread gone, settings change dropped");
            }
        }));

        let join = std::thread::Builder::new()
            .name("capture-callback".into())
            .spawn(move || run(engine, rx, tick))
            .map_err(|e| CaptureError::access("spawning the capture thread", e))?;

        Ok(Self {
            tx,
            events,
            stats,
            sinks,
            preview_latch,
            join: Some(join),
        })
    }

    pub fn send(&self, cmd: Command) -> Result<(), CaptureError> {
        self.tx
            .send(EngineMsg::Command(cmd))
            .map_err(|_| CaptureError::Closed)
    }

    pub fn events(&self) -> &Receiver<CaptureEvent> {
        &self.events
    }

    pub fn stats(&self) -> StatsBuffers {
        self.stats.clone()
    }

    pub fn add_result_sink(&self, sink: ResultSink) {
        self.sinks.add(sink);
    }

    /// Lets session creation proceed.
    pub fn preview_surface_ready(&self) {
        self.preview_latch.open();
    }

    pub fn preview_surface_destroyed(&self) {
        self.preview_latch.close();
    }

    /// Pauses the engine, waits for pending saves and joins the thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(EngineMsg::Shutdown);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for CaptureRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut engine: CaptureEngine, rx: Receiver<EngineMsg>, tick: Duration) {
    debug!("capture thread started");
    let tick = tick.max(Duration::from_millis(1));
    let mut next_tick = Instant::now() + tick;
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(msg) => {
                if !engine.handle(msg) {
                    break;
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if Instant::now() >= next_tick {
            engine.handle(EngineMsg::Tick);
            next_tick = Instant::now() + tick;
        }
    }
    engine.shutdown();
    debug!("capture thread stopped");
}
