// This is free and unencumbered software released into the public domain.

use super::{CameraId, CapturedImage, CaptureError, ImageFormat};
use bytes::Bytes;
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// A finished image on its way to storage.
#[derive(Clone, Debug)]
pub struct MediaItem {
    pub camera: CameraId,
    pub title: String,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub orientation: i32,
    pub format: ImageFormat,
    pub data: Bytes,
}

impl MediaItem {
    pub fn from_image(image: &CapturedImage, title: String, orientation: i32) -> Self {
        Self {
            camera: image.camera,
            title,
            timestamp_ns: image.timestamp_ns,
            width: image.width,
            height: image.height,
            orientation,
            format: image.format,
            data: image.data.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.title, self.format.extension())
    }
}

pub trait MediaSaver: Send {
    /// Persists `item` and returns where it went.
    fn save(&mut self, item: MediaItem) -> Result<String, CaptureError>;

    fn available_bytes(&self) -> Option<u64> {
        None
    }
}

/// Storage and memory probe consulted before captures.
pub trait ResourceMonitor: Send + Sync {
    fn available_storage(&self) -> Option<u64> {
        None
    }

    fn memory_low(&self) -> bool {
        false
    }
}

/// A monitor that never reports pressure.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unmonitored;

impl ResourceMonitor for Unmonitored {}

/// Drops everything it is given.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSaver;

impl MediaSaver for NullSaver {
    fn save(&mut self, item: MediaItem) -> Result<String, CaptureError> {
        Ok(item.file_name())
    }
}

/// A byte budget shared between a saver and the engine.
#[derive(Clone, Debug)]
pub struct StorageQuota(Arc<AtomicU64>);

impl StorageQuota {
    pub fn new(bytes: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes)))
    }

    pub fn remaining(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn consume(&self, bytes: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(bytes))
            });
    }
}

impl ResourceMonitor for StorageQuota {
    fn available_storage(&self) -> Option<u64> {
        Some(self.remaining())
    }
}

/// Writes each item as a file in one directory.
#[derive(Debug)]
pub struct DirectorySaver {
    dir: PathBuf,
    quota: Option<StorageQuota>,
}

impl DirectorySaver {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CaptureError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CaptureError::access("creating the output directory", e))?;
        Ok(Self { dir, quota: None })
    }

    pub fn with_quota(mut self, quota: StorageQuota) -> Self {
        self.quota = Some(quota);
        self
    }
}

impl MediaSaver for DirectorySaver {
    fn save(&mut self, item: MediaItem) -> Result<String, CaptureError> {
        let size = item.data.len() as u64;
        if let Some(available) = self.available_bytes()
            && available < size
        {
            return Err(CaptureError::LowStorage {
                available,
                required: size,
            });
        }
        let path = self.dir.join(item.file_name());
        fs::write(&path, &item.data).map_err(|e| CaptureError::access("writing an image", e))?;
        if let Some(quota) = &self.quota {
            quota.consume(size);
        }
        Ok(path.display().to_string())
    }

    fn available_bytes(&self) -> Option<u64> {
        self.quota.as_ref().map(StorageQuota::remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, len: usize) -> MediaItem {
        let image = CapturedImage::new_jpeg(CameraId(0), 1, 4, 3, Bytes::from(vec![7u8; len]));
        MediaItem::from_image(&image, title.to_string(), 90)
    }

    #[test]
    fn directory_saver_writes_and_charges_quota() {
        let dir = std::env::temp_dir().join(format!("capture-saver-{}", std::process::id()));
        let quota = StorageQuota::new(100);
        let mut saver = DirectorySaver::new(&dir).unwrap().with_quota(quota.clone());

        let location = saver.save(item("IMG_1", 60)).unwrap();
        assert!(location.ends_with("IMG_1.jpg"));
        assert_eq!(fs::read(&location).unwrap().len(), 60);
        assert_eq!(quota.remaining(), 40);

        assert!(matches!(
            saver.save(item("IMG_2", 60)),
            Err(CaptureError::LowStorage { available: 40, .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
