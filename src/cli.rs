// This is free and unencumbered software released into the public domain.

//! CLI helpers (error reporting, verbosity handling, event output).
//!
//! This module must compile even when the crate feature `cli` is disabled,
//! because the library is built in non-CLI configurations.

#[cfg(feature = "cli")]
use crate::shared::{CaptureError, CaptureEvent};

#[cfg(feature = "cli")]
use asimov_module::SysexitsError::{self, *};

#[cfg(feature = "cli")]
use clientele::StandardOptions;

#[cfg(feature = "cli")]
pub fn handle_error(err: &CaptureError, flags: &StandardOptions) -> SysexitsError {
    error!(%err, "capture command failed");
    if flags.debug || flags.verbose >= 2 {
        debug!(?err, "detailed error");
    }

    report_error(err, flags);
    map_error_to_sysexit(err)
}

#[cfg(feature = "cli")]
pub fn info_user(flags: &StandardOptions, msg: &str) {
    if flags.debug || flags.verbose >= 1 {
        eprintln!("INFO: {msg}");
    }

    info!("{msg}");
}

#[cfg(feature = "cli")]
pub fn warn_user(flags: &StandardOptions, msg: &str) {
    if flags.debug || flags.verbose >= 1 {
        eprintln!("WARN: {msg}");
    }

    warn!("{msg}");
}

#[cfg(feature = "cli")]
pub fn warn_user_with_error(flags: &StandardOptions, msg: &str, error: &dyn std::error::Error) {
    if flags.debug || flags.verbose >= 2 {
        eprintln!("WARN: {msg}: {error}");
    } else if flags.verbose >= 1 {
        eprintln!("WARN: {msg}");
    }

    warn!(error = %error, "{msg}");
}

/// Prints one capture event as a JSON line on stdout. Warnings and
/// failures are echoed to stderr as well when running verbosely.
#[cfg(feature = "cli")]
pub fn print_event(flags: &StandardOptions, event: &CaptureEvent) {
    match event {
        CaptureEvent::Warning(message) => warn_user(flags, message),
        CaptureEvent::ConfigurationFailed { camera, reason } => {
            warn_user(flags, &format!("camera {camera}: {reason}"))
        },
        _ => {},
    }
    println!("{}", event.to_json());
}

#[cfg(feature = "cli")]
fn report_error(err: &CaptureError, flags: &StandardOptions) {
    use std::error::Error as _;
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "ERROR: {err}");

    if flags.debug || flags.verbose >= 2 {
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = writeln!(stderr, "  Caused by: {}", cause);
            source = cause.source();
        }
    }
}

#[cfg(feature = "cli")]
pub fn map_error_to_sysexit(err: &CaptureError) -> SysexitsError {
    match err {
        CaptureError::ResourceBusy { .. }
        | CaptureError::NotReady(_)
        | CaptureError::ConfigurationInProgress => EX_TEMPFAIL,
        CaptureError::NoCamera | CaptureError::NoTopology(_) | CaptureError::Unsupported(_) => {
            EX_UNAVAILABLE
        },
        CaptureError::InvalidConfig(_) => EX_USAGE,
        CaptureError::UnrecoverableDevice { .. } | CaptureError::CameraAccess { .. } => EX_IOERR,
        CaptureError::LowStorage { .. } => EX_CANTCREAT,
        CaptureError::LowMemory => EX_OSERR,
        CaptureError::SessionClosed(_)
        | CaptureError::ConfigurationFailed { .. }
        | CaptureError::CropRegionUnset(_)
        | CaptureError::Closed
        | CaptureError::Other(_) => EX_SOFTWARE,
    }
}

// When `cli` is disabled, keep the module linkable without exposing CLI-only types.
#[cfg(not(feature = "cli"))]
#[inline]
pub fn info_user(_msg: &str) {}

#[cfg(not(feature = "cli"))]
#[inline]
pub fn warn_user(_msg: &str) {}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;
    use crate::shared::{CameraId, CameraMode};
    use clap::Parser;
    use std::time::Duration;

    #[derive(Parser)]
    struct Flags {
        #[clap(flatten)]
        flags: StandardOptions,
    }

    #[test]
    fn transient_failures_map_to_tempfail() {
        let busy = CaptureError::ResourceBusy {
            camera: CameraId(0),
            timeout: Duration::from_millis(5000),
        };
        assert_eq!(map_error_to_sysexit(&busy), EX_TEMPFAIL);
        assert_eq!(
            map_error_to_sysexit(&CaptureError::ConfigurationInProgress),
            EX_TEMPFAIL
        );
    }

    #[test]
    fn missing_hardware_is_unavailable() {
        assert_eq!(map_error_to_sysexit(&CaptureError::NoCamera), EX_UNAVAILABLE);
        assert_eq!(
            map_error_to_sysexit(&CaptureError::NoTopology(CameraMode::Dual)),
            EX_UNAVAILABLE
        );
        assert_eq!(
            map_error_to_sysexit(&CaptureError::invalid_config("bad size")),
            EX_USAGE
        );
    }

    #[test]
    fn handle_error_reports_and_maps() {
        let Flags { flags } = Flags::parse_from(["capture"]);
        assert_eq!(handle_error(&CaptureError::NoCamera, &flags), EX_UNAVAILABLE);
        assert_eq!(
            handle_error(&CaptureError::ConfigurationInProgress, &flags),
            EX_TEMPFAIL
        );
    }
}
