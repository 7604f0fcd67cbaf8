// This is free and unencumbered software released into the public domain.

//! Persisted user settings, as seen by the capture core.
//!
//! The store itself lives outside the core. The engine only reads string
//! values by key and gets told which keys changed. A change to any of
//! [`keys::RESTART`] tears down and rebuilds the whole pipeline; everything
//! else is re-applied to the running preview.

use super::{CameraMode, Facing};
use derive_more::Display;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

pub mod keys {
    pub const CAMERA_MODE: &str = "camera_mode";
    pub const FACING: &str = "facing";
    pub const FLASH: &str = "flash_mode";
    pub const ZOOM: &str = "zoom";
    pub const SCENE: &str = "scene_mode";
    pub const ISO: &str = "iso";
    pub const EXPOSURE: &str = "exposure_compensation";
    pub const WHITE_BALANCE: &str = "white_balance";
    pub const FACE_DETECTION: &str = "face_detection";
    pub const TOUCH_TRACKING: &str = "touch_tracking";
    pub const ZSL: &str = "zsl";
    pub const SAVE_RAW: &str = "save_raw";
    pub const VIDEO_HFR: &str = "video_hfr";
    pub const VIDEO_EIS: &str = "video_eis";
    pub const SUPER_SLOW_MOTION: &str = "super_slow_motion";
    pub const FAST_SHUTTER: &str = "fast_shutter";
    pub const LONGSHOT_LIMIT: &str = "longshot_limit";
    pub const HISTOGRAM: &str = "histogram";
    pub const MONO_PREVIEW: &str = "mono_preview";
    pub const JPEG_QUALITY: &str = "jpeg_quality";

    /// Keys whose change requires closing and reopening every camera.
    pub const RESTART: &[&str] = &[
        CAMERA_MODE,
        FACING,
        ZSL,
        VIDEO_HFR,
        VIDEO_EIS,
        SUPER_SLOW_MOTION,
        SAVE_RAW,
        FAST_SHUTTER,
    ];

    pub fn needs_restart<'a>(changed: impl IntoIterator<Item = &'a String>) -> bool {
        changed.into_iter().any(|k| RESTART.contains(&k.as_str()))
    }
}

pub type SettingsListener = Box<dyn Fn(&BTreeSet<String>) + Send + Sync + 'static>;

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Registers a listener called with the set of keys that changed.
    fn subscribe(&self, listener: SettingsListener);
}

/// In-memory settings store.
#[derive(Clone, Default)]
pub struct MemorySettings {
    values: Arc<RwLock<HashMap<String, String>>>,
    listeners: Arc<RwLock<Vec<SettingsListener>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.into());
        self
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.set_many([(key, value.into())]);
    }

    /// Writes several values and notifies listeners once with the keys whose
    /// value actually changed.
    pub fn set_many<'a>(&self, entries: impl IntoIterator<Item = (&'a str, String)>) {
        let mut changed = BTreeSet::new();
        {
            let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
            for (key, value) in entries {
                if values.get(key) != Some(&value) {
                    values.insert(key.to_string(), value);
                    changed.insert(key.to_string());
                }
            }
        }
        if changed.is_empty() {
            return;
        }
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                (listener)(&changed);
            }
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn subscribe(&self, listener: SettingsListener) {
        if let Ok(mut g) = self.listeners.write() {
            g.push(listener);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum FlashPolicy {
    #[default]
    #[display("off")]
    Off,
    #[display("auto")]
    Auto,
    #[display("on")]
    On,
    #[display("torch")]
    Torch,
}

impl FlashPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "auto" => Some(Self::Auto),
            "on" => Some(Self::On),
            "torch" => Some(Self::Torch),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum SceneMode {
    #[default]
    #[display("auto")]
    Auto,
    #[display("hdr")]
    Hdr,
    #[display("night")]
    Night,
    #[display("sports")]
    Sports,
    #[display("portrait")]
    Portrait,
    #[display("landscape")]
    Landscape,
}

impl SceneMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "hdr" => Some(Self::Hdr),
            "night" => Some(Self::Night),
            "sports" => Some(Self::Sports),
            "portrait" => Some(Self::Portrait),
            "landscape" => Some(Self::Landscape),
            _ => None,
        }
    }

    /// Scenes that pin the lens at infinity; AF triggers are meaningless.
    pub fn is_fixed_focus(self) -> bool {
        matches!(self, Self::Landscape)
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum WhiteBalance {
    #[default]
    #[display("auto")]
    Auto,
    #[display("incandescent")]
    Incandescent,
    #[display("fluorescent")]
    Fluorescent,
    #[display("daylight")]
    Daylight,
    #[display("cloudy")]
    Cloudy,
}

impl WhiteBalance {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "incandescent" => Some(Self::Incandescent),
            "fluorescent" => Some(Self::Fluorescent),
            "daylight" => Some(Self::Daylight),
            "cloudy" | "cloudy-daylight" => Some(Self::Cloudy),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum EisMode {
    #[default]
    #[display("off")]
    Off,
    #[display("realtime")]
    Realtime,
    #[display("lookahead")]
    Lookahead,
}

impl EisMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "disable" => Some(Self::Off),
            "realtime" | "v2" => Some(Self::Realtime),
            "lookahead" | "v3" => Some(Self::Lookahead),
            _ => None,
        }
    }
}

/// A typed, point-in-time read of every key the engine cares about.
/// Malformed values fall back to their defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct SettingsSnapshot {
    pub mode: CameraMode,
    pub facing: Facing,
    pub flash: FlashPolicy,
    pub zoom: f32,
    pub scene: SceneMode,
    /// `None` means automatic sensitivity.
    pub iso: Option<u32>,
    pub exposure_compensation: i32,
    pub white_balance: WhiteBalance,
    pub face_detection: bool,
    pub touch_tracking: bool,
    pub zsl: bool,
    pub save_raw: bool,
    /// `None` means normal-rate recording.
    pub hfr_fps: Option<u32>,
    pub eis: EisMode,
    pub super_slow_motion: bool,
    pub fast_shutter: bool,
    pub longshot_limit: Option<u32>,
    pub histogram: bool,
    pub mono_preview: bool,
    pub jpeg_quality: u8,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            mode: CameraMode::Photo,
            facing: Facing::Back,
            flash: FlashPolicy::Off,
            zoom: 1.0,
            scene: SceneMode::Auto,
            iso: None,
            exposure_compensation: 0,
            white_balance: WhiteBalance::Auto,
            face_detection: false,
            touch_tracking: false,
            zsl: false,
            save_raw: false,
            hfr_fps: None,
            eis: EisMode::Off,
            super_slow_motion: false,
            fast_shutter: false,
            longshot_limit: None,
            histogram: false,
            mono_preview: false,
            jpeg_quality: 95,
        }
    }
}

impl SettingsSnapshot {
    pub fn load(store: &dyn SettingsStore) -> Self {
        let d = Self::default();
        Self {
            mode: read(store, keys::CAMERA_MODE, CameraMode::parse).unwrap_or(d.mode),
            facing: read(store, keys::FACING, Facing::parse).unwrap_or(d.facing),
            flash: read(store, keys::FLASH, FlashPolicy::parse).unwrap_or(d.flash),
            zoom: read(store, keys::ZOOM, parse_zoom).unwrap_or(d.zoom),
            scene: read(store, keys::SCENE, SceneMode::parse).unwrap_or(d.scene),
            iso: read(store, keys::ISO, parse_iso).unwrap_or(d.iso),
            exposure_compensation: read(store, keys::EXPOSURE, |s| s.trim().parse().ok())
                .unwrap_or(d.exposure_compensation),
            white_balance: read(store, keys::WHITE_BALANCE, WhiteBalance::parse)
                .unwrap_or(d.white_balance),
            face_detection: read(store, keys::FACE_DETECTION, parse_bool)
                .unwrap_or(d.face_detection),
            touch_tracking: read(store, keys::TOUCH_TRACKING, parse_bool)
                .unwrap_or(d.touch_tracking),
            zsl: read(store, keys::ZSL, parse_bool).unwrap_or(d.zsl),
            save_raw: read(store, keys::SAVE_RAW, parse_bool).unwrap_or(d.save_raw),
            hfr_fps: read(store, keys::VIDEO_HFR, parse_hfr).unwrap_or(d.hfr_fps),
            eis: read(store, keys::VIDEO_EIS, EisMode::parse).unwrap_or(d.eis),
            super_slow_motion: read(store, keys::SUPER_SLOW_MOTION, parse_bool)
                .unwrap_or(d.super_slow_motion),
            fast_shutter: read(store, keys::FAST_SHUTTER, parse_bool).unwrap_or(d.fast_shutter),
            longshot_limit: read(store, keys::LONGSHOT_LIMIT, |s| {
                s.trim().parse::<u32>().ok().filter(|n| *n > 0).map(Some)
            })
            .unwrap_or(d.longshot_limit),
            histogram: read(store, keys::HISTOGRAM, parse_bool).unwrap_or(d.histogram),
            mono_preview: read(store, keys::MONO_PREVIEW, parse_bool).unwrap_or(d.mono_preview),
            jpeg_quality: read(store, keys::JPEG_QUALITY, |s| {
                s.trim().parse::<u8>().ok().filter(|q| (1..=100).contains(q))
            })
            .unwrap_or(d.jpeg_quality),
        }
    }
}

fn read<T>(store: &dyn SettingsStore, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = store.get(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring malformed setting");
    }
    parsed
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

fn parse_zoom(s: &str) -> Option<f32> {
    s.trim()
        .parse::<f32>()
        .ok()
        .filter(|z| z.is_finite() && *z >= 1.0)
}

fn parse_iso(s: &str) -> Option<Option<u32>> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(None),
        n => n.parse::<u32>().ok().filter(|v| *v > 0).map(Some),
    }
}

fn parse_hfr(s: &str) -> Option<Option<u32>> {
    match s.trim().to_ascii_lowercase().as_str() {
        "off" | "0" => Some(None),
        n => n
            .trim_start_matches("hfr")
            .trim_start_matches("hsr")
            .parse::<u32>()
            .ok()
            .filter(|fps| *fps >= 60)
            .map(Some),
    }
}
