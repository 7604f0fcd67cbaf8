// This is free and unencumbered software released into the public domain.

#[cfg(not(feature = "std"))]
compile_error!("asimov-capture-cataloger requires the 'std' feature");

use asimov_capture_module::{
    cli,
    shared::{self, CameraIdentity, CaptureError, HalInventory, ModeTopology},
};
use asimov_module::SysexitsError::{self, *};
use clap::Parser;
use clientele::StandardOptions;
use dogma::Named;
use serde_json::json;
use std::error::Error as StdError;

#[derive(Debug, Parser)]
struct Options {
    #[clap(flatten)]
    flags: StandardOptions,

    /// Camera driver URL, e.g. `sim:dual` or `sim:single`.
    #[arg(value_name = "URL", long = "driver", default_value = "sim:dual")]
    driver: String,

    #[arg(
        value_name = "FORMAT",
        short = 'o',
        long = "output",
        value_enum,
        default_value = "text"
    )]
    output: OutputFormat,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Jsonl,
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

    let exit_code = match run_cataloger(&options) {
        Ok(()) => EX_OK,
        Err(err) => cli::handle_error(&err, &options.flags),
    };

    Ok(exit_code)
}

fn run_cataloger(options: &Options) -> Result<(), CaptureError> {
    let mut hal = shared::open(&options.driver)?;
    cli::info_user(
        &options.flags,
        &format!("enumerating cameras of the {} driver", hal.name()),
    );

    let HalInventory {
        mut cameras,
        features,
    } = hal.probe()?;
    if cameras.is_empty() {
        cli::warn_user(&options.flags, "no camera devices found");
        return Ok(());
    }
    cameras.sort_by_key(|c| c.id);
    let topology = ModeTopology::probe(&cameras);

    for camera in &cameras {
        let modes = modes_of(&topology, camera);
        match options.output {
            OutputFormat::Text => {
                println!(
                    "{}: {} {} [{}] modes: {}",
                    camera.id,
                    camera.role,
                    camera.facing,
                    capability_tags(camera).join(", "),
                    modes.join(", ")
                );
            },
            OutputFormat::Jsonl => {
                let caps = &camera.capabilities;
                println!(
                    "{}",
                    json!({
                        "id": camera.id.0,
                        "role": camera.role.to_string(),
                        "facing": camera.facing.to_string(),
                        "active_array": [camera.active_array.width(), camera.active_array.height()],
                        "flash": caps.flash,
                        "autofocus": caps.autofocus,
                        "reprocessing": caps.reprocessing,
                        "high_speed_fps": caps.high_speed_fps,
                        "max_zoom": caps.max_zoom,
                        "modes": modes,
                    })
                );
            },
        }
    }

    if let OutputFormat::Text = options.output {
        println!(
            "features: custom-session={} reprocessing={} high-speed={}",
            features.custom_session, features.reprocessing, features.high_speed
        );
    }

    Ok(())
}

/// Modes whose topology includes `camera`.
fn modes_of(topology: &ModeTopology, camera: &CameraIdentity) -> Vec<String> {
    topology
        .modes(camera.facing)
        .into_iter()
        .filter(|m| {
            topology
                .resolve(*m, camera.facing)
                .is_some_and(|r| r.requires(camera.id))
        })
        .map(|m| m.to_string())
        .collect()
}

fn capability_tags(camera: &CameraIdentity) -> Vec<String> {
    let caps = &camera.capabilities;
    let mut tags = Vec::new();
    if caps.flash {
        tags.push("flash".to_string());
    }
    if caps.autofocus {
        tags.push("af".to_string());
    }
    if caps.reprocessing {
        tags.push("zsl".to_string());
    }
    if !caps.high_speed_fps.is_empty() {
        let rates: Vec<String> = caps.high_speed_fps.iter().map(u32::to_string).collect();
        tags.push(format!("hfr {}", rates.join("/")));
    }
    tags.push(format!("zoom x{}", caps.max_zoom));
    tags
}
