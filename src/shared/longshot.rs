// This is free and unencumbered software released into the public domain.

use super::CameraId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurstStep {
    /// Issue the next capture.
    Continue,
    /// The burst is over; finalize it.
    Finish,
}

/// Bookkeeping for a longshot burst: one capture is chained per completed
/// frame until the limit is reached, so no request past the limit is ever
/// issued.
#[derive(Debug, Default)]
pub struct LongshotTracker {
    camera: Option<CameraId>,
    limit: u32,
    frames_arrived: u32,
    active: bool,
    stop_requested: bool,
    completed: bool,
    last_accepted_ts: Option<u64>,
    closed_at: Option<u64>,
}

impl LongshotTracker {
    pub fn begin(&mut self, camera: CameraId, limit: u32) {
        *self = Self {
            camera: Some(camera),
            limit: limit.max(1),
            active: true,
            ..Default::default()
        };
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_active_for(&self, camera: CameraId) -> bool {
        self.active && self.camera == Some(camera)
    }

    pub fn camera(&self) -> Option<CameraId> {
        self.camera
    }

    pub fn frames(&self) -> u32 {
        self.frames_arrived
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn on_frame_completed(&mut self) -> BurstStep {
        self.frames_arrived += 1;
        if self.frames_arrived >= self.limit || self.stop_requested {
            BurstStep::Finish
        } else {
            BurstStep::Continue
        }
    }

    /// Ends the burst. Returns `true` only the first time.
    pub fn finalize(&mut self) -> bool {
        self.active = false;
        self.last_accepted_ts = None;
        if self.completed {
            return false;
        }
        self.completed = true;
        true
    }

    /// Marks the camera closed at sensor time `ts`. Buffers stamped at or
    /// before it are rejected from then on.
    pub fn close(&mut self, ts: u64) {
        self.active = false;
        self.closed_at = Some(self.closed_at.map_or(ts, |c| c.max(ts)));
    }

    /// Whether an image of `camera` with sensor timestamp `ts` should be
    /// written. Burst buffers must arrive in strictly increasing order.
    pub fn accept_image(&mut self, camera: CameraId, ts: u64) -> bool {
        if self.closed_at.is_some_and(|c| ts <= c) {
            return false;
        }
        if self.is_active_for(camera) {
            if self.last_accepted_ts.is_some_and(|last| ts <= last) {
                return false;
            }
            self.last_accepted_ts = Some(ts);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finishes_exactly_at_the_limit() {
        let mut t = LongshotTracker::default();
        t.begin(CameraId(0), 3);
        assert_eq!(t.on_frame_completed(), BurstStep::Continue);
        assert_eq!(t.on_frame_completed(), BurstStep::Continue);
        assert_eq!(t.on_frame_completed(), BurstStep::Finish);
        assert!(t.finalize());
        assert!(!t.finalize());
        assert!(!t.is_active());
    }

    #[test]
    fn stop_request_ends_early() {
        let mut t = LongshotTracker::default();
        t.begin(CameraId(0), 10);
        t.request_stop();
        assert_eq!(t.on_frame_completed(), BurstStep::Finish);
    }

    #[test]
    fn out_of_order_and_duplicate_buffers_are_discarded() {
        let mut t = LongshotTracker::default();
        t.begin(CameraId(0), 10);
        assert!(t.accept_image(CameraId(0), 100));
        assert!(!t.accept_image(CameraId(0), 100));
        assert!(!t.accept_image(CameraId(0), 90));
        assert!(t.accept_image(CameraId(0), 133));
    }

    #[test]
    fn buffers_older_than_close_are_discarded() {
        let mut t = LongshotTracker::default();
        t.begin(CameraId(0), 10);
        assert!(t.accept_image(CameraId(0), 100));
        t.close(200);
        assert!(!t.accept_image(CameraId(0), 150));
        assert!(!t.accept_image(CameraId(0), 200));
        assert!(!t.is_active());
    }

    #[test]
    fn ordering_is_only_enforced_during_the_burst() {
        let mut t = LongshotTracker::default();
        t.begin(CameraId(0), 1);
        assert!(t.accept_image(CameraId(0), 1000));
        assert!(!t.accept_image(CameraId(0), 1000));
        // Another camera is not part of the burst.
        assert!(t.accept_image(CameraId(2), 900));
        assert_eq!(t.on_frame_completed(), BurstStep::Finish);
        assert!(t.finalize());

        assert!(t.accept_image(CameraId(0), 2000));
        assert!(t.accept_image(CameraId(2), 1990));
        assert!(t.accept_image(CameraId(2), 1990));
    }
}
