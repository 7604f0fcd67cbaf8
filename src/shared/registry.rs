// This is free and unencumbered software released into the public domain.

use super::{CameraHal, CameraId, CaptureError};
use derive_more::Display;
use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// A counting semaphore with timed acquisition.
///
/// Guards device open and close: an open holds the permit until the HAL
/// reports the outcome, and a close must win the permit before it runs.
#[derive(Debug)]
pub struct Permit {
    available: Mutex<usize>,
    max: usize,
    cv: Condvar,
}

impl Permit {
    pub fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            max: permits,
            cv: Condvar::new(),
        }
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock().unwrap_or_else(|p| p.into_inner());
        while *available == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(available, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            available = guard;
        }
        *available -= 1;
        true
    }

    /// Returns a permit. Releasing more than were taken is a no-op.
    pub fn release(&self) {
        let mut available = self.available.lock().unwrap_or_else(|p| p.into_inner());
        if *available < self.max {
            *available += 1;
            self.cv.notify_one();
        }
    }

    pub fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A resettable gate, opened once the preview surface exists.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.cv.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocks until the latch opens or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        let (open, _) = self
            .cv
            .wait_timeout_while(open, timeout, |open| !*open)
            .unwrap_or_else(|p| p.into_inner());
        *open
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum DeviceState {
    #[display("opening")]
    Opening,
    #[display("open")]
    Open,
}

/// Tracks which devices are open and serializes open against close.
#[derive(Debug)]
pub struct DeviceRegistry {
    permit: Arc<Permit>,
    devices: BTreeMap<CameraId, DeviceState>,
    open_timeout: Duration,
    close_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(permit: Arc<Permit>, open_timeout: Duration, close_timeout: Duration) -> Self {
        Self {
            permit,
            devices: BTreeMap::new(),
            open_timeout,
            close_timeout,
        }
    }

    pub fn permit(&self) -> Arc<Permit> {
        Arc::clone(&self.permit)
    }

    pub fn state(&self, camera: CameraId) -> Option<DeviceState> {
        self.devices.get(&camera).copied()
    }

    pub fn is_open(&self, camera: CameraId) -> bool {
        self.state(camera) == Some(DeviceState::Open)
    }

    pub fn devices(&self) -> Vec<CameraId> {
        self.devices.keys().copied().collect()
    }

    /// Starts opening `camera`. The permit stays held until the HAL reports
    /// the device opened, failed or disconnected.
    pub fn open(&mut self, camera: CameraId, hal: &mut dyn CameraHal) -> Result<(), CaptureError> {
        if self.devices.contains_key(&camera) {
            return Ok(());
        }
        if !self.permit.try_acquire_for(self.open_timeout) {
            return Err(CaptureError::ResourceBusy {
                camera,
                timeout: self.open_timeout,
            });
        }
        self.devices.insert(camera, DeviceState::Opening);
        debug!(%camera, "opening camera");
        if let Err(e) = hal.open_device(camera) {
            self.devices.remove(&camera);
            self.permit.release();
            return Err(e);
        }
        Ok(())
    }

    /// Records a successful open. Returns `false` when nobody is waiting for
    /// this device any more.
    pub fn on_opened(&mut self, camera: CameraId) -> bool {
        match self.devices.get_mut(&camera) {
            Some(state) if *state == DeviceState::Opening => {
                *state = DeviceState::Open;
                true
            },
            _ => false,
        }
    }

    /// Forgets a device that errored or disconnected.
    pub fn on_lost(&mut self, camera: CameraId) {
        self.devices.remove(&camera);
    }

    pub fn close(&mut self, camera: CameraId, hal: &mut dyn CameraHal) -> Result<(), CaptureError> {
        self.devices.remove(&camera);
        if !self.permit.try_acquire_for(self.close_timeout) {
            return Err(CaptureError::ResourceBusy {
                camera,
                timeout: self.close_timeout,
            });
        }
        let permit = Arc::clone(&self.permit);
        let _release = scopeguard::guard((), move |_| permit.release());
        debug!(%camera, "closing camera");
        hal.close_device(camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permit_times_out_when_held() {
        let permit = Permit::new(1);
        assert!(permit.try_acquire_for(Duration::ZERO));
        assert!(!permit.try_acquire_for(Duration::from_millis(20)));
        permit.release();
        assert!(permit.try_acquire_for(Duration::ZERO));
    }

    #[test]
    fn permit_release_saturates() {
        let permit = Permit::new(1);
        permit.release();
        permit.release();
        assert_eq!(permit.available(), 1);
    }

    #[test]
    fn permit_wakes_a_waiter() {
        let permit = Arc::new(Permit::new(1));
        assert!(permit.try_acquire_for(Duration::ZERO));
        let p2 = Arc::clone(&permit);
        let waiter = thread::spawn(move || p2.try_acquire_for(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        permit.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn latch_waits_then_opens() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.wait_for(Duration::from_millis(10)));
        let l2 = Arc::clone(&latch);
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            l2.open();
        });
        assert!(latch.wait_for(Duration::from_secs(5)));
        opener.join().unwrap();
        latch.close();
        assert!(!latch.is_open());
    }
}
