// This is free and unencumbered software released into the public domain.

#[cfg(not(feature = "std"))]
compile_error!("asimov-capture-runner requires the 'std' feature");

use asimov_capture_module::{
    cli,
    shared::{
        self, CameraMode, CaptureConfig, CaptureError, CaptureEvent, CaptureIntentMode,
        CaptureResult, CaptureRuntime, Collaborators, Command, DirectorySaver, Facing,
        FlashPolicy, MemorySettings, NullSaver, keys,
    },
};
use asimov_module::SysexitsError::{self, *};
use clap::Parser;
use clientele::StandardOptions;
use dogma::Named;
use serde_json::json;
use std::{
    error::Error as StdError,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::{Duration, Instant},
};

/// Drives a capture session through a scripted list of actions and prints
/// every event as a JSON line.
#[derive(Debug, Parser)]
struct Options {
    #[clap(flatten)]
    flags: StandardOptions,

    /// Camera driver URL, e.g. `sim:dual` or `sim:single+low-light`.
    #[arg(value_name = "URL", long = "driver", default_value = "sim:dual")]
    driver: String,

    /// Camera mode: photo, video, hfr, dual, pro.
    #[arg(value_name = "MODE", short = 'm', long = "mode", value_parser = parse_mode, default_value = "photo")]
    mode: CameraMode,

    #[arg(value_name = "FACING", long = "facing", value_parser = parse_facing, default_value = "back")]
    facing: Facing,

    #[arg(value_name = "INTENT", long = "intent", value_enum, default_value = "normal")]
    intent: Intent,

    /// Directory to save captured media to. Without it, media is discarded.
    #[arg(value_name = "DIR", short = 'O', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Preview size as WxH.
    #[arg(value_name = "WxH", long = "preview-size", value_parser = parse_dimensions)]
    preview_size: Option<(u32, u32)>,

    /// Picture size as WxH.
    #[arg(value_name = "WxH", long = "picture-size", value_parser = parse_dimensions)]
    picture_size: Option<(u32, u32)>,

    #[arg(value_name = "POLICY", long = "flash", value_parser = parse_flash)]
    flash: Option<FlashPolicy>,

    /// Enable zero-shutter-lag sessions when the camera supports them.
    #[arg(long = "zsl")]
    zsl: bool,

    /// Maximum number of frames in one burst.
    #[arg(value_name = "N", long = "burst-limit")]
    burst_limit: Option<u32>,

    /// Collect histogram statistics and print them on exit.
    #[arg(long = "histogram")]
    histogram: bool,

    /// Extra setting as KEY=VALUE. May be repeated.
    #[arg(value_name = "KEY=VALUE", long = "set", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Print every capture result on stderr.
    #[arg(long = "print-results")]
    print_results: bool,

    /// Seconds to wait for each step before giving up.
    #[arg(value_name = "SECS", long = "step-timeout", default_value_t = 10)]
    step_timeout: u64,

    /// Actions to run in order: photo, burst, lock, unlock, snapshot,
    /// touch:X:Y, record:SECS, mode:NAME, facing:NAME, zoom:F, wait:MS.
    #[arg(value_name = "ACTION", value_parser = parse_action)]
    actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Intent {
    Normal,
    Still,
    Video,
    SecureStill,
}

impl From<Intent> for CaptureIntentMode {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Normal => CaptureIntentMode::Normal,
            Intent::Still => CaptureIntentMode::StillCaptureIntent,
            Intent::Video => CaptureIntentMode::VideoCaptureIntent,
            Intent::SecureStill => CaptureIntentMode::SecureStillCaptureIntent,
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Photo,
    Burst,
    Lock,
    Unlock,
    Snapshot,
    Touch(f32, f32),
    Record(Duration),
    Mode(CameraMode),
    Facing(Facing),
    Zoom(f32),
    Wait(Duration),
}

pub fn main() -> Result<SysexitsError, Box<dyn StdError>> {
    asimov_module::dotenv().ok();
    let args = asimov_module::args_os()?;
    let options = Options::parse_from(args);

    if options.flags.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(EX_OK);
    }

    if options.flags.license {
        print!("{}", include_str!("../../UNLICENSE"));
        return Ok(EX_OK);
    }

    #[cfg(feature = "tracing")]
    asimov_module::init_tracing_subscriber(&options.flags).expect("failed to initialize logging");

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        ctrlc::set_handler(move || {
            quit.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Box::<dyn StdError>::from(format!("failed to install Ctrl-C handler: {e}")))?;
    }

    let exit_code = match run_script(&options, &quit) {
        Ok(()) => EX_OK,
        Err(err) => cli::handle_error(&err, &options.flags),
    };

    Ok(exit_code)
}

fn run_script(options: &Options, quit: &AtomicBool) -> Result<(), CaptureError> {
    let hal = shared::open(&options.driver)?;
    cli::info_user(&options.flags, &format!("using the {} driver", hal.name()));

    let mut config = CaptureConfig::new(options.intent.into())
        .with_diagnostics(options.flags.debug || options.flags.verbose >= 3);
    if let Some((w, h)) = options.preview_size {
        config = config.with_preview_size(w, h);
    }
    if let Some((w, h)) = options.picture_size {
        config = config.with_picture_size(w, h);
    }

    let collaborators = Collaborators::default().with_settings(Arc::new(settings_of(options)));
    let collaborators = match &options.output_dir {
        Some(dir) => collaborators.with_saver(Box::new(DirectorySaver::new(dir)?)),
        None => collaborators.with_saver(Box::new(NullSaver)),
    };

    let mut runtime = CaptureRuntime::start(hal, config, collaborators)?;
    if options.print_results {
        runtime.add_result_sink(Arc::new(|result: &CaptureResult| {
            eprintln!(
                "RESULT: camera={} token={} intent={} frame={} af={:?} ae={:?}",
                result.camera,
                result.token,
                result.intent,
                result.frame_number,
                result.af_state,
                result.ae_state
            );
        }));
    }

    let step = Step {
        runtime: &runtime,
        flags: &options.flags,
        quit,
        timeout: Duration::from_secs(options.step_timeout.max(1)),
    };

    runtime.preview_surface_ready();
    runtime.send(Command::Open)?;
    step.wait(|e| matches!(e, CaptureEvent::ShutterEnabled(true)))?;

    let result = options
        .actions
        .iter()
        .take_while(|_| !quit.load(Ordering::SeqCst))
        .try_for_each(|action| step.run(action));

    let _ = runtime.send(Command::Close);
    step.drain(Duration::from_millis(200));
    runtime.stop();
    while let Ok(event) = runtime.events().try_recv() {
        cli::print_event(&options.flags, &event);
    }

    if options.histogram {
        let stats = runtime.stats();
        println!(
            "{}",
            json!({
                "type": "stats",
                "updates": stats.updates(),
                "histogram": stats.histogram(),
                "bg_grid": stats.bg_grid(),
            })
        );
    }

    result
}

fn settings_of(options: &Options) -> MemorySettings {
    let mut settings = MemorySettings::new()
        .with(keys::CAMERA_MODE, options.mode.to_string())
        .with(keys::FACING, options.facing.to_string())
        .with(keys::ZSL, options.zsl.to_string())
        .with(keys::HISTOGRAM, options.histogram.to_string());
    if let Some(flash) = options.flash {
        settings = settings.with(keys::FLASH, flash.to_string());
    }
    if let Some(n) = options.burst_limit {
        settings = settings.with(keys::LONGSHOT_LIMIT, n.to_string());
    }
    for (key, value) in &options.settings {
        settings = settings.with(key, value.clone());
    }
    settings
}

struct Step<'a> {
    runtime: &'a CaptureRuntime,
    flags: &'a StandardOptions,
    quit: &'a AtomicBool,
    timeout: Duration,
}

impl Step<'_> {
    fn run(&self, action: &Action) -> Result<(), CaptureError> {
        cli::info_user(self.flags, &format!("running {action:?}"));
        match *action {
            Action::Photo => {
                self.runtime.send(Command::TakePicture)?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::ImageSaved { .. }
                            | CaptureEvent::ReviewRequested
                            | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Burst => {
                self.runtime.send(Command::StartLongshot)?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::LongshotFinished { .. } | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Lock => {
                self.runtime.send(Command::LockAfAe)?;
                self.drain(Duration::from_millis(300));
                Ok(())
            },
            Action::Unlock => {
                self.runtime.send(Command::Unlock)?;
                self.drain(Duration::from_millis(100));
                Ok(())
            },
            Action::Snapshot => {
                self.runtime.send(Command::VideoSnapshot)?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::ImageSaved { .. } | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Touch(x, y) => {
                self.runtime.send(Command::TouchFocus { x, y })?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::FocusSettled { .. } | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Record(length) => {
                self.runtime.send(Command::StartRecording)?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::RecordingStarted { .. }
                            | CaptureEvent::ConfigurationFailed { .. }
                            | CaptureEvent::Warning(_)
                    )
                })?;
                self.drain(length);
                self.runtime.send(Command::StopRecording)?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::RecordingStopped { .. } | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Mode(mode) => {
                self.runtime.send(Command::SetMode(mode))?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::ShutterEnabled(true) | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Facing(facing) => {
                self.runtime.send(Command::SwitchFacing(facing))?;
                self.wait(|e| {
                    matches!(
                        e,
                        CaptureEvent::ShutterEnabled(true) | CaptureEvent::Warning(_)
                    )
                })
            },
            Action::Zoom(zoom) => {
                self.runtime.send(Command::SetZoom(zoom))?;
                self.drain(Duration::from_millis(100));
                Ok(())
            },
            Action::Wait(length) => {
                self.drain(length);
                Ok(())
            },
        }
    }

    /// Prints events until `done` matches one, the step times out or the
    /// user interrupts.
    fn wait(&self, done: impl Fn(&CaptureEvent) -> bool) -> Result<(), CaptureError> {
        let deadline = Instant::now() + self.timeout;
        while !self.quit.load(Ordering::SeqCst) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(CaptureError::not_ready(format!(
                    "no answer from the camera within {:?}",
                    self.timeout
                )));
            }
            match self
                .runtime
                .events()
                .recv_timeout(left.min(Duration::from_millis(100)))
            {
                Ok(event) => {
                    cli::print_event(self.flags, &event);
                    if let CaptureEvent::UnrecoverableDeviceError { camera, code } = event {
                        return Err(CaptureError::UnrecoverableDevice { camera, code });
                    }
                    if done(&event) {
                        return Ok(());
                    }
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::Closed),
            }
        }
        Ok(())
    }

    fn drain(&self, length: Duration) {
        let deadline = Instant::now() + length;
        while !self.quit.load(Ordering::SeqCst) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.runtime.events().recv_timeout(left) {
                Ok(event) => cli::print_event(self.flags, &event),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

fn parse_action(s: &str) -> Result<Action, String> {
    let s = s.trim();
    let (name, arg) = match s.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (s, None),
    };
    let need = |what: &str| arg.ok_or_else(|| format!("'{name}' needs {what}, e.g. {name}:{}", example(name)));

    let action = match name.to_ascii_lowercase().as_str() {
        "photo" => Action::Photo,
        "burst" | "longshot" => Action::Burst,
        "lock" => Action::Lock,
        "unlock" => Action::Unlock,
        "snapshot" => Action::Snapshot,
        "touch" => {
            let arg = need("a position")?;
            let (x, y) = arg
                .split_once(':')
                .ok_or_else(|| format!("Invalid position '{arg}'. Use X:Y in 0..1"))?;
            Action::Touch(parse_unit(x)?, parse_unit(y)?)
        },
        "record" => {
            let secs: f64 = need("a length")?
                .parse()
                .map_err(|_| format!("Invalid recording length in '{s}'"))?;
            if !(secs > 0.0) {
                return Err("Recording length must be positive".to_string());
            }
            Action::Record(Duration::from_secs_f64(secs))
        },
        "mode" => Action::Mode(parse_mode(need("a mode")?)?),
        "facing" => Action::Facing(parse_facing(need("a facing")?)?),
        "zoom" => {
            let zoom: f32 = need("a factor")?
                .parse()
                .map_err(|_| format!("Invalid zoom in '{s}'"))?;
            if !(zoom >= 1.0) {
                return Err("Zoom must be at least 1.0".to_string());
            }
            Action::Zoom(zoom)
        },
        "wait" => {
            let ms: u64 = need("milliseconds")?
                .parse()
                .map_err(|_| format!("Invalid wait in '{s}'"))?;
            Action::Wait(Duration::from_millis(ms))
        },
        _ => return Err(format!("Unknown action '{s}'")),
    };
    Ok(action)
}

fn example(name: &str) -> &'static str {
    match name {
        "touch" => "0.5:0.5",
        "record" => "2",
        "mode" => "video",
        "facing" => "front",
        "zoom" => "2.0",
        _ => "500",
    }
}

fn parse_unit(s: &str) -> Result<f32, String> {
    let v: f32 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid coordinate: {s}"))?;
    if !(0.0..=1.0).contains(&v) {
        return Err(format!("Coordinate {v} is out of range (0-1)"));
    }
    Ok(v)
}

fn parse_mode(s: &str) -> Result<CameraMode, String> {
    CameraMode::parse(s).ok_or_else(|| format!("Unknown camera mode '{s}'"))
}

fn parse_facing(s: &str) -> Result<Facing, String> {
    Facing::parse(s).ok_or_else(|| format!("Unknown facing '{s}'. Use back or front"))
}

fn parse_flash(s: &str) -> Result<FlashPolicy, String> {
    FlashPolicy::parse(s).ok_or_else(|| format!("Unknown flash policy '{s}'"))
}

fn parse_setting(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid setting '{s}'. Use KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid setting '{s}': empty key"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_dimensions(s: &str) -> Result<(u32, u32), String> {
    let s = s.trim().replace('×', "x");
    let parts: Vec<&str> = s.split('x').map(|t| t.trim()).collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(format!("Invalid format '{s}'. Use WxH (e.g., 1920x1080)"));
    }

    let width: u32 = parts[0]
        .parse()
        .map_err(|_| format!("Invalid width: {}", parts[0]))?;
    let height: u32 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid height: {}", parts[1]))?;

    if !(160..=8192).contains(&width) {
        return Err(format!("Width {width} is out of reasonable range (160-8192)"));
    }
    if !(120..=6144).contains(&height) {
        return Err(format!("Height {height} is out of reasonable range (120-6144)"));
    }

    Ok((width, height))
}
