//! Pure placement: (snapshot, pose, settings) in, draw list out. No GPU
//! state anywhere in this module.

use super::{LayerSprite, NonVrLayer, Pose, VrQuadLayer};
use crate::geometry::{Point, Rect, Size};
use crate::settings::NonVrAlignment;
use crate::shm::{
    quirks, FrameSnapshot, LayerEntry, VrLayout, VR_LAYOUT_KIND_HORIZONTAL_MIRROR,
};
use crate::spriting;
use glam::{EulerRot, Quat, Vec3};

/// Whether dest rects are upscaled to [`spriting::MAX_VIEW_RENDER_SIZE`]
/// before composition, letting the runtime rescale back.
pub fn should_upscale(frame_quirks: u64, runtime_is_varjo: bool) -> bool {
    if frame_quirks & quirks::UPSCALING_ALWAYS_ON != 0 {
        return true;
    }
    if frame_quirks & quirks::UPSCALING_ALWAYS_OFF != 0 {
        return false;
    }
    runtime_is_varjo
}

pub fn vr_layout_pose(layout: &VrLayout) -> Pose {
    Pose {
        position: Vec3::from_array(layout.position),
        // yaw, then pitch, then roll, matching RollPitchYaw conventions
        orientation: Quat::from_euler(
            EulerRot::YXZ,
            layout.euler_radians[1],
            layout.euler_radians[0],
            layout.euler_radians[2],
        ),
    }
}

/// Reflect a pose across the YZ plane for the horizontal-mirror view kind.
pub fn mirror_pose(pose: Pose) -> Pose {
    Pose {
        position: Vec3::new(-pose.position.x, pose.position.y, pose.position.z),
        orientation: Quat::from_xyzw(
            pose.orientation.x,
            -pose.orientation.y,
            -pose.orientation.z,
            pose.orientation.w,
        ),
    }
}

/// Where the viewer's gaze ray lands on the layer plane, in layer-local
/// metres from the layer centre. `None` when looking away from the plane.
fn gaze_point_on_layer(hmd: Pose, layer: Pose) -> Option<(f32, f32)> {
    let direction = hmd.orientation * Vec3::NEG_Z;
    let normal = layer.orientation * Vec3::Z;
    let denominator = direction.dot(normal);
    if denominator.abs() < 1e-6 {
        return None;
    }
    let t = (layer.position - hmd.position).dot(normal) / denominator;
    if t <= 0.0 {
        return None;
    }
    let hit = hmd.position + direction * t;
    let local = layer.orientation.inverse() * (hit - layer.position);
    Some((local.x, local.y))
}

fn resolve_vr_size(layout: &VrLayout, pose: Pose, hmd: Option<Pose>) -> [f32; 2] {
    let mut size = layout.size_metres;
    let zoom = layout.zoom_scale;
    if zoom[0] > 0.0 && zoom[1] > 0.0 && (zoom[0] != 1.0 || zoom[1] != 1.0) {
        if let Some((x, y)) = hmd.and_then(|hmd| gaze_point_on_layer(hmd, pose)) {
            let half_w = size[0] * 0.5 * layout.gaze_target_scale[0].max(0.0);
            let half_h = size[1] * 0.5 * layout.gaze_target_scale[1].max(0.0);
            if x.abs() <= half_w && y.abs() <= half_h {
                size = [size[0] * zoom[0], size[1] * zoom[1]];
            }
        }
    }
    size
}

fn resolve_vr_pose(layer: &LayerEntry, all_layers: &[LayerEntry]) -> Pose {
    if layer.vr.kind == VR_LAYOUT_KIND_HORIZONTAL_MIRROR {
        // First match wins if several layers share the referenced id.
        let referenced = all_layers
            .iter()
            .find(|other| other.layer_id == layer.vr.mirror_of);
        if let Some(other) = referenced {
            return mirror_pose(vr_layout_pose(&other.vr));
        }
    }
    vr_layout_pose(&layer.vr)
}

/// Resolve the VR draw list: one quad plus one atlas sprite per enabled
/// layer, laid out cell-by-cell by [`spriting`].
pub fn build_vr_layers(
    snapshot: &FrameSnapshot,
    hmd_pose: Option<Pose>,
    upscale: bool,
) -> (Vec<VrQuadLayer>, Size<u32>) {
    let enabled: Vec<&LayerEntry> = snapshot
        .layers()
        .iter()
        .filter(|layer| layer.vr_enabled() && layer.vr.opacity > 0.0)
        .filter(|layer| !layer.location_on_texture.is_empty())
        .collect();

    let cell = if upscale {
        spriting::MAX_VIEW_RENDER_SIZE
    } else {
        spriting::cell_size(enabled.iter().map(|layer| &layer.location_on_texture))
    };
    let atlas_size = spriting::buffer_size(enabled.len(), cell);

    let quads = enabled
        .iter()
        .enumerate()
        .map(|(index, layer)| {
            let mut dest_rect = Rect::new(
                spriting::layer_offset(index, cell),
                layer.location_on_texture.size,
            );
            if upscale {
                dest_rect.size = dest_rect.size.scaled_to_fit(spriting::MAX_VIEW_RENDER_SIZE);
            }

            let pose = resolve_vr_pose(layer, snapshot.layers());
            let size_metres = resolve_vr_size(&layer.vr, pose, hmd_pose);

            VrQuadLayer {
                layer_id: layer.layer_id,
                pose,
                size_metres,
                sprite: LayerSprite {
                    source_rect: layer.location_on_texture,
                    dest_rect,
                    opacity: layer.vr.opacity,
                },
            }
        })
        .collect();

    (quads, atlas_size)
}

fn aligned_origin(
    alignment: NonVrAlignment,
    viewport: Size<u32>,
    size: Size<u32>,
    padding: u32,
) -> Point<u32> {
    let x = match alignment.horizontal() {
        0 => padding,
        1 => (viewport.width.saturating_sub(size.width)) / 2,
        _ => viewport
            .width
            .saturating_sub(size.width)
            .saturating_sub(padding),
    };
    let y = match alignment.vertical() {
        0 => padding,
        1 => (viewport.height.saturating_sub(size.height)) / 2,
        _ => viewport
            .height
            .saturating_sub(size.height)
            .saturating_sub(padding),
    };
    Point::new(x, y)
}

/// Resolve the non-VR draw list against the host viewport.
pub fn build_nonvr_layers(snapshot: &FrameSnapshot, viewport: Size<u32>) -> Vec<NonVrLayer> {
    if viewport.is_empty() {
        return Vec::new();
    }
    snapshot
        .layers()
        .iter()
        .filter(|layer| layer.nonvr_enabled() && layer.nonvr.opacity > 0.0)
        .filter(|layer| !layer.location_on_texture.is_empty())
        .filter_map(|layer| {
            let source = layer.location_on_texture;
            let height = viewport.height * layer.nonvr.height_percent.min(100) / 100;
            let size = source
                .size
                .scaled_to_fit(Size::new(viewport.width, height));
            if size.is_empty() {
                return None;
            }
            let origin = aligned_origin(
                NonVrAlignment::from_wire(layer.nonvr.alignment),
                viewport,
                size,
                layer.nonvr.padding_pixels,
            );
            Some(NonVrLayer {
                layer_id: layer.layer_id,
                sprite: LayerSprite {
                    source_rect: source,
                    dest_rect: Rect::new(origin, size),
                    opacity: layer.nonvr.opacity,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::writer::{FrameLayout, LayerConfig, Writer};
    use crate::shm::{ConsumerKind, NonVrLayout, Reader, VR_LAYOUT_KIND_INDEPENDENT};
    use std::f32::consts::FRAC_PI_2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot_of(layers: Vec<LayerConfig>, texture: Size<u32>) -> FrameSnapshot {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        #[cfg(unix)]
        let name = format!("/okb-placement-{}-{n}", std::process::id());
        #[cfg(windows)]
        let name = format!("Local\\okb-placement-{}-{n}", std::process::id());

        let mut writer = Writer::create_with_name(&name, 2).unwrap();
        let mut guard = writer.begin_frame().unwrap();
        guard
            .set_layers(&FrameLayout {
                texture_size: texture,
                fence_value: 1,
                layers,
                ..Default::default()
            })
            .unwrap();
        guard.commit().unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();
        reader.maybe_get().unwrap()
    }

    fn vr_layer(id: u64, location: Rect<u32>) -> LayerConfig {
        LayerConfig {
            layer_id: id,
            location_on_texture: location,
            vr: VrLayout {
                size_metres: [0.25, 0.25],
                opacity: 1.0,
                kind: VR_LAYOUT_KIND_INDEPENDENT,
                position: [0.0, 0.0, -1.0],
                ..Default::default()
            },
            vr_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn single_layer_fills_atlas() {
        let rect = Rect::new(Point::new(0, 0), Size::new(1024, 1024));
        let snapshot = snapshot_of(vec![vr_layer(1, rect)], Size::new(1024, 1024));

        let (quads, atlas) = build_vr_layers(&snapshot, None, false);
        assert_eq!(atlas, Size::new(1024, 1024));
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].sprite.source_rect, rect);
        assert_eq!(quads[0].sprite.dest_rect, rect);
        assert_eq!(quads[0].sprite.opacity, 1.0);
    }

    #[test]
    fn two_layers_land_side_by_side() {
        let left = Rect::new(Point::new(0, 0), Size::new(512, 512));
        let right = Rect::new(Point::new(512, 0), Size::new(512, 512));
        let snapshot = snapshot_of(
            vec![vr_layer(1, left), vr_layer(2, right)],
            Size::new(1024, 512),
        );

        let (quads, atlas) = build_vr_layers(&snapshot, None, false);
        assert_eq!(atlas, Size::new(1024, 512));
        assert_eq!(quads[0].sprite.dest_rect.origin, Point::new(0, 0));
        assert_eq!(quads[1].sprite.dest_rect.origin, Point::new(512, 0));
        let atlas_rect = Rect::new(Point::new(0, 0), atlas);
        for quad in &quads {
            assert!(atlas_rect.contains_rect(&quad.sprite.dest_rect));
        }
    }

    #[test]
    fn upscaling_grows_dest_but_not_source() {
        let rect = Rect::new(Point::new(0, 0), Size::new(512, 512));
        let snapshot = snapshot_of(vec![vr_layer(1, rect)], Size::new(512, 512));

        let (quads, atlas) = build_vr_layers(&snapshot, None, true);
        assert_eq!(quads[0].sprite.dest_rect.size, Size::new(2048, 2048));
        assert_eq!(quads[0].sprite.source_rect, rect);
        assert_eq!(atlas, Size::new(2048, 2048));
    }

    #[test]
    fn upscale_quirks_override_runtime_detection() {
        assert!(should_upscale(0, true));
        assert!(!should_upscale(0, false));
        assert!(should_upscale(quirks::UPSCALING_ALWAYS_ON, false));
        assert!(!should_upscale(quirks::UPSCALING_ALWAYS_OFF, true));
    }

    #[test]
    fn disabled_and_transparent_layers_are_skipped() {
        let rect = Rect::new(Point::new(0, 0), Size::new(256, 256));
        let mut transparent = vr_layer(2, rect);
        transparent.vr.opacity = 0.0;
        let mut disabled = vr_layer(3, rect);
        disabled.vr_enabled = false;
        let mut degenerate = vr_layer(4, Rect::new(Point::new(0, 0), Size::new(0, 256)));
        degenerate.vr.opacity = 1.0;

        let snapshot = snapshot_of(
            vec![vr_layer(1, rect), transparent, disabled, degenerate],
            Size::new(1024, 1024),
        );
        let (quads, _) = build_vr_layers(&snapshot, None, false);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].layer_id, 1);
    }

    #[test]
    fn mirror_reflects_the_referenced_view() {
        let rect = Rect::new(Point::new(0, 0), Size::new(256, 256));
        let mut primary = vr_layer(1, rect);
        primary.vr.position = [0.3, -0.2, -0.5];
        primary.vr.euler_radians = [0.0, FRAC_PI_2, 0.0];

        let mut mirror = vr_layer(2, rect);
        mirror.vr.kind = VR_LAYOUT_KIND_HORIZONTAL_MIRROR;
        mirror.vr.mirror_of = 1;

        let snapshot = snapshot_of(vec![primary, mirror], Size::new(1024, 1024));
        let (quads, _) = build_vr_layers(&snapshot, None, false);

        let p = quads[0].pose;
        let m = quads[1].pose;
        assert_eq!(m.position.x, -p.position.x);
        assert_eq!(m.position.y, p.position.y);
        assert_eq!(m.position.z, p.position.z);

        // A mirrored yaw turns the other way.
        let (yaw_p, _, _) = p.orientation.to_euler(EulerRot::YXZ);
        let (yaw_m, _, _) = m.orientation.to_euler(EulerRot::YXZ);
        assert!((yaw_p + yaw_m).abs() < 1e-5);
    }

    #[test]
    fn gaze_zoom_applies_inside_target_only() {
        let rect = Rect::new(Point::new(0, 0), Size::new(256, 256));
        let mut layer = vr_layer(1, rect);
        layer.vr.position = [0.0, 0.0, -1.0];
        layer.vr.zoom_scale = [2.0, 2.0];
        layer.vr.gaze_target_scale = [1.0, 1.0];
        let snapshot = snapshot_of(vec![layer], Size::new(1024, 1024));

        // Looking straight at the layer centre: zoomed.
        let centred = Pose::IDENTITY;
        let (quads, _) = build_vr_layers(&snapshot, Some(centred), false);
        assert_eq!(quads[0].size_metres, [0.5, 0.5]);

        // Looking 90 degrees away: not zoomed.
        let away = Pose {
            position: Vec3::ZERO,
            orientation: Quat::from_euler(EulerRot::YXZ, FRAC_PI_2, 0.0, 0.0),
        };
        let (quads, _) = build_vr_layers(&snapshot, Some(away), false);
        assert_eq!(quads[0].size_metres, [0.25, 0.25]);

        // No pose available: not zoomed.
        let (quads, _) = build_vr_layers(&snapshot, None, false);
        assert_eq!(quads[0].size_metres, [0.25, 0.25]);
    }

    #[test]
    fn nonvr_nine_way_alignment() {
        let rect = Rect::new(Point::new(0, 0), Size::new(400, 400));
        let layer = |alignment: NonVrAlignment| LayerConfig {
            layer_id: 1,
            location_on_texture: rect,
            nonvr: NonVrLayout {
                alignment: alignment.to_wire(),
                height_percent: 50,
                padding_pixels: 10,
                opacity: 0.8,
            },
            nonvr_enabled: true,
            ..Default::default()
        };
        let viewport = Size::new(1920, 1080);

        let snapshot = snapshot_of(vec![layer(NonVrAlignment::TopLeft)], Size::new(512, 512));
        let placed = build_nonvr_layers(&snapshot, viewport);
        // 50% of 1080 = 540px square, padded 10px from the corner.
        assert_eq!(placed[0].sprite.dest_rect, Rect::new(Point::new(10, 10), Size::new(540, 540)));
        assert_eq!(placed[0].sprite.opacity, 0.8);

        let snapshot = snapshot_of(vec![layer(NonVrAlignment::BottomRight)], Size::new(512, 512));
        let placed = build_nonvr_layers(&snapshot, viewport);
        assert_eq!(
            placed[0].sprite.dest_rect,
            Rect::new(Point::new(1920 - 540 - 10, 1080 - 540 - 10), Size::new(540, 540))
        );

        let snapshot = snapshot_of(vec![layer(NonVrAlignment::Center)], Size::new(512, 512));
        let placed = build_nonvr_layers(&snapshot, viewport);
        assert_eq!(
            placed[0].sprite.dest_rect,
            Rect::new(Point::new((1920 - 540) / 2, (1080 - 540) / 2), Size::new(540, 540))
        );
    }
}
