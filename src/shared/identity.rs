// This is free and unencumbered software released into the public domain.

use super::Rect;
use derive_more::Display;
use std::collections::BTreeMap;

/// Logical camera index as enumerated by the HAL.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct CameraId(pub u32);

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CameraRole {
    #[display("bayer")]
    Bayer,
    #[display("mono")]
    Mono,
    #[display("front")]
    Front,
    #[display("aux")]
    Aux,
    #[display("switch")]
    Switch,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum Facing {
    #[default]
    #[display("back")]
    Back,
    #[display("front")]
    Front,
    #[display("external")]
    External,
}

impl Facing {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "back" | "rear" => Some(Self::Back),
            "front" => Some(Self::Front),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Capabilities {
    pub flash: bool,
    pub autofocus: bool,
    pub af_regions: bool,
    pub ae_regions: bool,
    /// Supports private reprocessing, which is what zero-shutter-lag needs.
    pub reprocessing: bool,
    /// Frame rates available to constrained high-speed sessions.
    pub high_speed_fps: Vec<u32>,
    pub max_zoom: f32,
}

impl Capabilities {
    pub fn supports_high_speed(&self, fps: u32) -> bool {
        self.high_speed_fps.contains(&fps)
    }
}

/// An opaque vendor metadata value.
#[derive(Clone, Debug, PartialEq)]
pub enum VendorValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i32>),
    Text(String),
}

/// Extensible key/value bag for vendor capabilities, request extensions
/// and result metadata. Keys are never interpreted by the capture core
/// except for the few statistics keys the dispatcher knows about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VendorTags(BTreeMap<String, VendorValue>);

impl VendorTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: VendorValue) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: VendorValue) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<VendorValue> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&VendorValue> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            VendorValue::Bool(b) => Some(*b),
            VendorValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn get_ints(&self, key: &str) -> Option<&[i32]> {
        match self.get(key)? {
            VendorValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn merge(&mut self, other: &VendorTags) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VendorValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A camera as enumerated once at startup. Never mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraIdentity {
    pub id: CameraId,
    pub role: CameraRole,
    pub facing: Facing,
    pub capabilities: Capabilities,
    /// Sensor active pixel array, the reference frame for crop and
    /// metering regions.
    pub active_array: Rect,
    pub vendor: VendorTags,
}

impl CameraIdentity {
    pub fn new(id: u32, role: CameraRole, facing: Facing, active_array: Rect) -> Self {
        Self {
            id: CameraId(id),
            role,
            facing,
            capabilities: Capabilities {
                max_zoom: 1.0,
                ..Default::default()
            },
            active_array,
            vendor: VendorTags::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_vendor(mut self, vendor: VendorTags) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn is_mono(&self) -> bool {
        self.role == CameraRole::Mono
    }
}
