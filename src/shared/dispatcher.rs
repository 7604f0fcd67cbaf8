// This is free and unencumbered software released into the public domain.

use super::{CaptureError, CaptureEvent, CaptureResult, MediaItem, MediaSaver, VendorValue, post_event};
use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{SyncSender, sync_channel},
    },
    thread::JoinHandle,
};

pub type ResultSink = Arc<dyn Fn(&CaptureResult) + Send + Sync + 'static>;

pub const HISTOGRAM_KEY: &str = "stats.histogram";
pub const BG_GRID_KEY: &str = "stats.bg_grid";

/// Latest statistics copied out of result metadata, shared with readers.
#[derive(Clone, Debug, Default)]
pub struct StatsBuffers {
    histogram: Arc<Mutex<Vec<u32>>>,
    bg_grid: Arc<Mutex<Vec<u32>>>,
    updates: Arc<AtomicU64>,
}

impl StatsBuffers {
    pub fn histogram(&self) -> Vec<u32> {
        self.histogram.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn bg_grid(&self) -> Vec<u32> {
        self.bg_grid.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    fn update(&self, result: &CaptureResult) {
        let mut touched = false;
        for (key, buffer) in [(HISTOGRAM_KEY, &self.histogram), (BG_GRID_KEY, &self.bg_grid)] {
            if let Some(VendorValue::Ints(values)) = result.vendor.get(key) {
                let mut g = buffer.lock().unwrap_or_else(|p| p.into_inner());
                g.clear();
                g.extend(values.iter().map(|v| (*v).max(0) as u32));
                touched = true;
            }
        }
        if touched {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Result observers registered after the engine started. Cheap to clone.
#[derive(Clone, Default)]
pub struct ResultSinks(Arc<RwLock<Vec<ResultSink>>>);

impl ResultSinks {
    pub fn add(&self, sink: ResultSink) {
        if let Ok(mut g) = self.0.write() {
            g.push(sink);
        }
    }

    fn each(&self, result: &CaptureResult) {
        if let Ok(list) = self.0.read() {
            for sink in list.iter() {
                (sink)(result);
            }
        }
    }
}

impl core::fmt::Debug for ResultSinks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let n = self.0.read().map_or(0, |g| g.len());
        f.debug_tuple("ResultSinks").field(&n).finish()
    }
}

/// Single ingress for capture results. The state machine always sees a
/// result first, then the statistics buffers, then registered sinks.
#[derive(Debug)]
pub struct ResultDispatcher {
    stats: StatsBuffers,
    stats_enabled: bool,
    sinks: ResultSinks,
}

impl ResultDispatcher {
    pub fn new(stats: StatsBuffers) -> Self {
        Self {
            stats,
            stats_enabled: false,
            sinks: ResultSinks::default(),
        }
    }

    pub fn stats(&self) -> StatsBuffers {
        self.stats.clone()
    }

    pub fn sinks(&self) -> ResultSinks {
        self.sinks.clone()
    }

    pub fn set_stats_enabled(&mut self, enabled: bool) {
        self.stats_enabled = enabled;
    }

    pub fn add_sink(&self, sink: ResultSink) {
        self.sinks.add(sink);
    }

    pub fn dispatch(&self, result: &CaptureResult, advance: impl FnOnce(&CaptureResult)) {
        advance(result);
        if self.stats_enabled && !result.partial {
            self.stats.update(result);
        }
        self.sinks.each(result);
    }
}

enum SaveMsg {
    Item(MediaItem),
    Stop,
}

/// Persists images on a dedicated thread. Submission blocks when the
/// bounded queue is full.
pub struct SaveQueue {
    tx: SyncSender<SaveMsg>,
    pending: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl SaveQueue {
    pub fn new(
        capacity: usize,
        mut saver: Box<dyn MediaSaver>,
        events_tx: SyncSender<CaptureEvent>,
    ) -> Result<Self, CaptureError> {
        let (tx, rx) = sync_channel::<SaveMsg>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let pending2 = Arc::clone(&pending);

        let join = std::thread::Builder::new()
            .name("capture-save".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        SaveMsg::Item(item) => {
                            let title = item.title.clone();
                            match saver.save(item) {
                                Ok(location) => {
                                    debug!(%title, %location, "image saved");
                                    post_event(&events_tx, CaptureEvent::ImageSaved { title, location });
                                },
                                Err(e) => {
                                    warn!(%title, error = %e, "failed to save image");
                                    post_event(&events_tx, CaptureEvent::Warning(e.to_string()));
                                },
                            }
                            pending2.fetch_sub(1, Ordering::AcqRel);
                        },
                        SaveMsg::Stop => break,
                    }
                }
            })
            .map_err(|e| CaptureError::access("spawning the save thread", e))?;

        Ok(Self {
            tx,
            pending,
            join: Some(join),
        })
    }

    pub fn submit(&self, item: MediaItem) -> Result<(), CaptureError> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(SaveMsg::Item(item)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            CaptureError::Closed
        })
    }

    /// Items submitted but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Drains everything already queued, then joins the thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(SaveMsg::Stop);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for SaveQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{CameraId, CaptureIntent, CapturedImage, RequestToken, VendorTags};
    use bytes::Bytes;

    #[test]
    fn state_machine_sees_results_before_sinks() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ResultDispatcher::new(StatsBuffers::default());
        dispatcher.set_stats_enabled(true);
        let o2 = Arc::clone(&order);
        dispatcher.add_sink(Arc::new(move |_| o2.lock().unwrap().push("sink")));

        let mut result = CaptureResult::new(CameraId(0), RequestToken::new(1).unwrap(), CaptureIntent::Preview);
        result.vendor = VendorTags::new().with(HISTOGRAM_KEY, VendorValue::Ints(vec![1, 2, -3]));

        let stats = dispatcher.stats();
        dispatcher.dispatch(&result, |_| {
            assert_eq!(stats.updates(), 0);
            order.lock().unwrap().push("fsm");
        });
        assert_eq!(*order.lock().unwrap(), vec!["fsm", "sink"]);
        assert_eq!(stats.histogram(), vec![1, 2, 0]);
        assert_eq!(stats.updates(), 1);
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    impl MediaSaver for Recording {
        fn save(&mut self, item: MediaItem) -> Result<String, CaptureError> {
            self.0.lock().unwrap().push(item.title.clone());
            Ok(item.title)
        }
    }

    #[test]
    fn save_queue_drains_before_stopping() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = sync_channel(16);
        let mut queue = SaveQueue::new(2, Box::new(Recording(Arc::clone(&saved))), events_tx).unwrap();
        for n in 0..5 {
            let image = CapturedImage::new_jpeg(CameraId(0), n, 1, 1, Bytes::from_static(b"x"));
            queue.submit(MediaItem::from_image(&image, format!("IMG_{n}"), 0)).unwrap();
        }
        queue.stop();
        assert_eq!(saved.lock().unwrap().len(), 5);
        assert_eq!(queue.pending(), 0);
        let saved_events = events_rx
            .try_iter()
            .filter(|e| matches!(e, CaptureEvent::ImageSaved { .. }))
            .count();
        assert_eq!(saved_events, 5);
    }
}
