//! The slice of the settings JSON the compositor cares about. The
//! configuration UI that writes this file is a separate program; unknown
//! fields are ignored and missing ones take defaults.

use crate::shm::{quirks, NonVrLayout, VrLayout, VR_LAYOUT_KIND_INDEPENDENT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonVrAlignment {
    TopLeft,
    TopCenter,
    TopRight,
    CenterLeft,
    Center,
    CenterRight,
    BottomLeft,
    BottomCenter,
    #[default]
    BottomRight,
}

impl NonVrAlignment {
    const ALL: [NonVrAlignment; 9] = [
        Self::TopLeft,
        Self::TopCenter,
        Self::TopRight,
        Self::CenterLeft,
        Self::Center,
        Self::CenterRight,
        Self::BottomLeft,
        Self::BottomCenter,
        Self::BottomRight,
    ];

    pub fn to_wire(self) -> u32 {
        Self::ALL.iter().position(|a| *a == self).unwrap() as u32
    }

    pub fn from_wire(value: u32) -> Self {
        Self::ALL.get(value as usize).copied().unwrap_or_default()
    }

    /// 0 = left, 1 = centre, 2 = right.
    pub fn horizontal(self) -> u32 {
        self.to_wire() % 3
    }

    /// 0 = top, 1 = centre, 2 = bottom.
    pub fn vertical(self) -> u32 {
        self.to_wire() / 3
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VrPoseSettings {
    /// Metres, in the local reference space.
    pub x: f32,
    pub eye_y: f32,
    pub z: f32,
    /// Radians.
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
}

impl Default for VrPoseSettings {
    fn default() -> Self {
        // A kneeboard: on the right thigh, tilted up toward the eyes.
        Self {
            x: 0.15,
            eye_y: -0.7,
            z: -0.4,
            rx: -std::f32::consts::FRAC_PI_2,
            ry: 0.0,
            rz: 0.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GazeSettings {
    pub enabled: bool,
    pub zoom_scale: [f32; 2],
    /// Multiple of the kneeboard size the gaze must fall within.
    pub target_scale: [f32; 2],
}

impl Default for GazeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            zoom_scale: [2.0, 2.0],
            target_scale: [1.0, 1.0],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewVrSettings {
    pub enabled: bool,
    pub pose: VrPoseSettings,
    /// Physical quad size in metres.
    pub size: [f32; 2],
    pub opacity: f32,
    pub gaze: GazeSettings,
}

impl Default for ViewVrSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pose: VrPoseSettings::default(),
            size: [0.25, 0.25],
            opacity: 1.0,
            gaze: GazeSettings::default(),
        }
    }
}

impl ViewVrSettings {
    pub fn to_wire(&self) -> VrLayout {
        VrLayout {
            position: [self.pose.x, self.pose.eye_y, self.pose.z],
            euler_radians: [self.pose.rx, self.pose.ry, self.pose.rz],
            size_metres: self.size,
            gaze_target_scale: if self.gaze.enabled {
                self.gaze.target_scale
            } else {
                [0.0, 0.0]
            },
            zoom_scale: if self.gaze.enabled {
                self.gaze.zoom_scale
            } else {
                [1.0, 1.0]
            },
            opacity: self.opacity,
            kind: VR_LAYOUT_KIND_INDEPENDENT,
            mirror_of: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewNonVrSettings {
    pub enabled: bool,
    pub alignment: NonVrAlignment,
    pub height_percent: u32,
    pub padding_pixels: u32,
    pub opacity: f32,
}

impl Default for ViewNonVrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            alignment: NonVrAlignment::BottomRight,
            height_percent: 60,
            padding_pixels: 10,
            opacity: 0.8,
        }
    }
}

impl ViewNonVrSettings {
    pub fn to_wire(&self) -> NonVrLayout {
        NonVrLayout {
            alignment: self.alignment.to_wire(),
            height_percent: self.height_percent,
            padding_pixels: self.padding_pixels,
            opacity: self.opacity,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Upscaling {
    #[default]
    Automatic,
    AlwaysOn,
    AlwaysOff,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VrQuirks {
    pub upscaling: Upscaling,
    /// Oculus-SDK only; recorded but ignored on the OpenXR path.
    pub oculus_discard_depth: bool,
}

impl VrQuirks {
    pub fn to_wire(&self) -> u64 {
        let mut bits = 0;
        match self.upscaling {
            Upscaling::Automatic => {}
            Upscaling::AlwaysOn => bits |= quirks::UPSCALING_ALWAYS_ON,
            Upscaling::AlwaysOff => bits |= quirks::UPSCALING_ALWAYS_OFF,
        }
        if self.oculus_discard_depth {
            bits |= quirks::OCULUS_DISCARD_DEPTH;
        }
        bits
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub vr: ViewVrSettings,
    pub non_vr: ViewNonVrSettings,
    pub quirks: VrQuirks,
}

impl Settings {
    fn path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("OPENKNEEBOARD_SETTINGS") {
            return Some(PathBuf::from(path));
        }
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
            .ok()?;
        Some(config_dir.join("openkneeboard").join("compositor.json"))
    }

    /// Load from the settings file, falling back to defaults; a malformed
    /// file is logged and ignored rather than killing the host process.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("ignoring malformed settings file {path:?}: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_all_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.vr.enabled);
        assert_eq!(settings.non_vr.alignment, NonVrAlignment::BottomRight);
    }

    #[test]
    fn round_trip() {
        let mut settings = Settings::default();
        settings.vr.size = [0.4, 0.3];
        settings.non_vr.alignment = NonVrAlignment::TopCenter;
        settings.quirks.upscaling = Upscaling::AlwaysOn;

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn alignment_wire_round_trip() {
        for (index, alignment) in NonVrAlignment::ALL.iter().enumerate() {
            assert_eq!(alignment.to_wire(), index as u32);
            assert_eq!(NonVrAlignment::from_wire(index as u32), *alignment);
        }
        // Out-of-range falls back rather than overrunning.
        assert_eq!(NonVrAlignment::from_wire(99), NonVrAlignment::BottomRight);

        assert_eq!(NonVrAlignment::TopRight.horizontal(), 2);
        assert_eq!(NonVrAlignment::TopRight.vertical(), 0);
        assert_eq!(NonVrAlignment::BottomLeft.horizontal(), 0);
        assert_eq!(NonVrAlignment::BottomLeft.vertical(), 2);
    }

    #[test]
    fn quirk_bits() {
        assert_eq!(VrQuirks::default().to_wire(), 0);
        let on = VrQuirks {
            upscaling: Upscaling::AlwaysOn,
            oculus_discard_depth: true,
        };
        assert_eq!(
            on.to_wire(),
            quirks::UPSCALING_ALWAYS_ON | quirks::OCULUS_DISCARD_DEPTH
        );
        let off = VrQuirks {
            upscaling: Upscaling::AlwaysOff,
            oculus_discard_depth: false,
        };
        assert_eq!(off.to_wire(), quirks::UPSCALING_ALWAYS_OFF);
    }

    #[test]
    fn disabled_gaze_publishes_identity_zoom() {
        let mut vr = ViewVrSettings::default();
        vr.gaze.enabled = false;
        let wire = vr.to_wire();
        assert_eq!(wire.zoom_scale, [1.0, 1.0]);
        assert_eq!(wire.gaze_target_scale, [0.0, 0.0]);
    }
}
