// This is free and unencumbered software released into the public domain.

use super::{CameraId, CameraIdentity, CameraRole, Facing};
use derive_more::Display;
use std::collections::HashMap;

/// User-facing capture mode.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum CameraMode {
    #[default]
    #[display("photo")]
    Photo,
    #[display("video")]
    Video,
    /// High-frame-rate / slow-motion recording.
    #[display("hfr")]
    Hfr,
    /// Bayer + mono fusion (bokeh, clear-sight).
    #[display("dual")]
    Dual,
    /// Manual controls and longshot.
    #[display("pro")]
    Pro,
}

impl CameraMode {
    pub const ALL: [CameraMode; 5] = [
        CameraMode::Photo,
        CameraMode::Video,
        CameraMode::Hfr,
        CameraMode::Dual,
        CameraMode::Pro,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "hfr" | "slow-motion" => Some(Self::Hfr),
            "dual" | "bokeh" => Some(Self::Dual),
            "pro" | "burst" => Some(Self::Pro),
            _ => None,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::Video | Self::Hfr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DualPair {
    pub bayer: CameraId,
    pub mono: CameraId,
}

/// The concrete cameras a mode needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyRecord {
    pub primary: CameraId,
    /// Every camera that must be opened, in open order. Always starts with
    /// `primary`.
    pub linked: Vec<CameraId>,
    pub dual: Option<DualPair>,
}

impl TopologyRecord {
    fn single(id: CameraId) -> Self {
        Self {
            primary: id,
            linked: vec![id],
            dual: None,
        }
    }

    pub fn requires(&self, id: CameraId) -> bool {
        self.linked.contains(&id)
    }
}

/// Mode → camera set mapping, probed once from the enumerated identities.
#[derive(Clone, Debug, Default)]
pub struct ModeTopology {
    entries: HashMap<(CameraMode, Facing), TopologyRecord>,
}

impl ModeTopology {
    pub fn probe(identities: &[CameraIdentity]) -> Self {
        let find = |pred: &dyn Fn(&CameraIdentity) -> bool| identities.iter().find(|c| pred(c));

        let rear = find(&|c| c.role == CameraRole::Bayer && c.facing == Facing::Back)
            .or_else(|| find(&|c| c.facing == Facing::Back && !c.is_mono()));
        let front = find(&|c| c.facing == Facing::Front);
        let mono = find(&|c| c.role == CameraRole::Mono);

        let mut entries = HashMap::new();
        for (facing, camera) in [(Facing::Back, rear), (Facing::Front, front)] {
            let Some(camera) = camera else { continue };
            for mode in [CameraMode::Photo, CameraMode::Video, CameraMode::Pro] {
                entries.insert((mode, facing), TopologyRecord::single(camera.id));
            }
            if !camera.capabilities.high_speed_fps.is_empty() {
                entries.insert((CameraMode::Hfr, facing), TopologyRecord::single(camera.id));
            }
        }

        if let (Some(bayer), Some(mono)) = (rear, mono) {
            entries.insert(
                (CameraMode::Dual, Facing::Back),
                TopologyRecord {
                    primary: bayer.id,
                    linked: vec![bayer.id, mono.id],
                    dual: Some(DualPair {
                        bayer: bayer.id,
                        mono: mono.id,
                    }),
                },
            );
        }

        Self { entries }
    }

    pub fn resolve(&self, mode: CameraMode, facing: Facing) -> Option<&TopologyRecord> {
        self.entries.get(&(mode, facing))
    }

    pub fn supports(&self, mode: CameraMode, facing: Facing) -> bool {
        self.entries.contains_key(&(mode, facing))
    }

    pub fn modes(&self, facing: Facing) -> Vec<CameraMode> {
        CameraMode::ALL
            .into_iter()
            .filter(|m| self.supports(*m, facing))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{Capabilities, Rect};

    fn cameras(with_mono: bool) -> Vec<CameraIdentity> {
        let array = Rect::from_size(4000, 3000);
        let mut v = vec![
            CameraIdentity::new(0, CameraRole::Bayer, Facing::Back, array).with_capabilities(
                Capabilities {
                    high_speed_fps: vec![120],
                    ..Default::default()
                },
            ),
            CameraIdentity::new(1, CameraRole::Front, Facing::Front, array),
        ];
        if with_mono {
            v.push(CameraIdentity::new(2, CameraRole::Mono, Facing::Back, array));
        }
        v
    }

    #[test]
    fn dual_mode_links_bayer_then_mono() {
        let topology = ModeTopology::probe(&cameras(true));
        let dual = topology.resolve(CameraMode::Dual, Facing::Back).unwrap();
        assert_eq!(dual.linked, vec![CameraId(0), CameraId(2)]);
        assert_eq!(
            dual.dual,
            Some(DualPair {
                bayer: CameraId(0),
                mono: CameraId(2)
            })
        );
    }

    #[test]
    fn dual_mode_needs_a_mono_sensor() {
        let topology = ModeTopology::probe(&cameras(false));
        assert!(!topology.supports(CameraMode::Dual, Facing::Back));
        assert!(topology.supports(CameraMode::Photo, Facing::Back));
    }

    #[test]
    fn hfr_only_where_high_speed_is_advertised() {
        let topology = ModeTopology::probe(&cameras(true));
        assert!(topology.supports(CameraMode::Hfr, Facing::Back));
        assert!(!topology.supports(CameraMode::Hfr, Facing::Front));
        assert_eq!(
            topology.modes(Facing::Front),
            vec![CameraMode::Photo, CameraMode::Video, CameraMode::Pro]
        );
    }
}
