// This is free and unencumbered software released into the public domain.

use super::{
    CameraId, CameraIdentity, CaptureError, CaptureIntent, CaptureRequest, CaptureResult,
    CapturedImage, EngineMsg, Permit, RequestToken, SessionHandle, SessionKind, Surface,
    SurfaceSpec,
};
use std::sync::{Arc, mpsc::Sender};

/// Optional platform features discovered at probe time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HalFeatures {
    pub custom_session: bool,
    pub reprocessing: bool,
    pub high_speed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct HalInventory {
    pub cameras: Vec<CameraIdentity>,
    pub features: HalFeatures,
}

/// Asynchronous completions reported by a HAL.
#[derive(Clone, Debug)]
pub enum HalEvent {
    DeviceOpened {
        camera: CameraId,
    },
    DeviceClosed {
        camera: CameraId,
    },
    DeviceDisconnected {
        camera: CameraId,
    },
    DeviceError {
        camera: CameraId,
        code: i32,
    },
    SessionConfigured {
        camera: CameraId,
        generation: u64,
        session: SessionHandle,
    },
    SessionConfigureFailed {
        camera: CameraId,
        generation: u64,
        reason: String,
    },
    CaptureProgressed(CaptureResult),
    CaptureCompleted(CaptureResult),
    CaptureFailed {
        camera: CameraId,
        token: RequestToken,
        intent: CaptureIntent,
    },
    ImageAvailable(CapturedImage),
}

impl HalEvent {
    /// Events that end a pending device open.
    fn settles_open(&self) -> bool {
        matches!(
            self,
            Self::DeviceOpened { .. } | Self::DeviceError { .. } | Self::DeviceDisconnected { .. }
        )
    }
}

/// The HAL's way back into the engine. Cheap to clone; safe to use from
/// any HAL thread.
#[derive(Clone, Debug)]
pub struct HalCallbacks {
    tx: Sender<EngineMsg>,
    open_permit: Arc<Permit>,
}

impl HalCallbacks {
    pub fn new(tx: Sender<EngineMsg>, open_permit: Arc<Permit>) -> Self {
        Self { tx, open_permit }
    }

    pub fn post(&self, event: HalEvent) {
        // Released before queuing: the engine thread may be blocked in a
        // close waiting for this permit.
        if event.settles_open() {
            self.open_permit.release();
        }
        if self.tx.send(EngineMsg::Hal(event)).is_err() {
            trace!("engine gone, dropping HAL event");
        }
    }
}

/// The platform camera stack.
pub trait CameraHal: dogma::Named + Send {
    fn probe(&mut self) -> Result<HalInventory, CaptureError>;

    fn attach(&mut self, callbacks: HalCallbacks);

    /// Starts opening a device. Completion arrives as `DeviceOpened`,
    /// `DeviceError` or `DeviceDisconnected`.
    fn open_device(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    fn close_device(&mut self, camera: CameraId) -> Result<(), CaptureError>;

    fn allocate_surface(
        &mut self,
        camera: CameraId,
        spec: SurfaceSpec,
    ) -> Result<Surface, CaptureError>;

    fn release_surface(&mut self, surface: &Surface);

    /// Starts configuring a session. Completion arrives as
    /// `SessionConfigured` or `SessionConfigureFailed` carrying `generation`.
    fn create_session(
        &mut self,
        camera: CameraId,
        generation: u64,
        kind: SessionKind,
        surfaces: &[Surface],
    ) -> Result<(), CaptureError>;

    fn close_session(&mut self, session: SessionHandle);

    fn capture(
        &mut self,
        session: SessionHandle,
        request: &CaptureRequest,
    ) -> Result<(), CaptureError>;

    fn capture_burst(
        &mut self,
        session: SessionHandle,
        requests: &[CaptureRequest],
    ) -> Result<(), CaptureError>;

    fn set_repeating(
        &mut self,
        session: SessionHandle,
        requests: &[CaptureRequest],
    ) -> Result<(), CaptureError>;

    fn stop_repeating(&mut self, session: SessionHandle) -> Result<(), CaptureError>;
}
