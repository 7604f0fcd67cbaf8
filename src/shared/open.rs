// This is free and unencumbered software released into the public domain.

use super::{CameraHal, CaptureError};

/// Opens the camera HAL named by `url`.
///
/// `sim:<profile>` (or an empty URL) selects the in-process simulator. No
/// platform driver is compiled into this crate.
pub fn open(url: impl AsRef<str>) -> Result<Box<dyn CameraHal>, CaptureError> {
    let url = url.as_ref().trim();
    let (scheme, rest) = url.split_once(':').unwrap_or((url, ""));
    match scheme {
        "" | "sim" | "simulator" => {
            if cfg!(feature = "simulator") {
                #[cfg(feature = "simulator")]
                return Ok(Box::new(
                    super::drivers::simulated::SimulatedHal::from_url(rest)?,
                ));
            }
            Err(CaptureError::unsupported(format!(
                "simulator profile `{rest}` requested, but the simulator is not compiled in"
            )))
        },
        other => Err(CaptureError::unsupported(format!(
            "no camera driver for `{other}`"
        ))),
    }
}
