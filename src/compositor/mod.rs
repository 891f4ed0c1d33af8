//! Per-API frame consumers: resolve a frame snapshot plus the viewer's head
//! pose into a draw list (pure, in [`placement`]) and render it into the
//! swapchain atlas through the matching sprite batch.

pub mod placement;

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;
pub mod vulkan;

use crate::geometry::Rect;
use openxr_sys as xr;

/// A viewer or layer pose in the local reference space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pose {
    pub position: glam::Vec3,
    pub orientation: glam::Quat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: glam::Vec3::ZERO,
        orientation: glam::Quat::IDENTITY,
    };

    pub fn to_xr(self) -> xr::Posef {
        xr::Posef {
            orientation: xr::Quaternionf {
                x: self.orientation.x,
                y: self.orientation.y,
                z: self.orientation.z,
                w: self.orientation.w,
            },
            position: xr::Vector3f {
                x: self.position.x,
                y: self.position.y,
                z: self.position.z,
            },
        }
    }

    pub fn from_xr(pose: xr::Posef) -> Self {
        Self {
            position: glam::Vec3::new(pose.position.x, pose.position.y, pose.position.z),
            orientation: glam::Quat::from_xyzw(
                pose.orientation.x,
                pose.orientation.y,
                pose.orientation.z,
                pose.orientation.w,
            ),
        }
    }
}

/// One sprite of the composition draw list.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LayerSprite {
    pub source_rect: Rect<u32>,
    pub dest_rect: Rect<u32>,
    pub opacity: f32,
}

/// A VR quad: where the sprite's atlas cell is shown in space.
#[derive(Copy, Clone, Debug)]
pub struct VrQuadLayer {
    pub layer_id: u64,
    pub pose: Pose,
    pub size_metres: [f32; 2],
    pub sprite: LayerSprite,
}

/// A non-VR overlay placement within the host viewport.
#[derive(Copy, Clone, Debug)]
pub struct NonVrLayer {
    pub layer_id: u64,
    pub sprite: LayerSprite,
}
