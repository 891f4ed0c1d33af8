//! CPU-side vertex and constant-buffer generation, shared verbatim by all
//! three backends so their draws are semantically identical.

use super::{OpenBatch, SpriteInfo, MAX_SPRITES_PER_BATCH};
use bytemuck::{Pod, Zeroable};

/// Matches the shader input layout exactly; positions and texture
/// coordinates are in pixels, converted in the vertex shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
    pub tex_coord: [f32; 2],
    pub texture_index: u32,
}

/// Matches the shader constant block; `source_dimensions` entries are padded
/// to vec4 for std140/HLSL agreement, only xy is read.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SpriteConstants {
    pub target_dimensions: [f32; 2],
    pub _padding: [f32; 2],
    pub source_dimensions: [[f32; 4]; MAX_SPRITES_PER_BATCH],
    pub source_clamp: [[f32; 4]; MAX_SPRITES_PER_BATCH],
}

pub struct DrawData {
    pub vertices: Vec<Vertex>,
    pub constants: SpriteConstants,
}

pub(crate) fn build_draw_data(batch: &OpenBatch) -> DrawData {
    let mut constants = SpriteConstants {
        target_dimensions: [
            batch.dest_size.width as f32,
            batch.dest_size.height as f32,
        ],
        _padding: [0.0; 2],
        source_dimensions: [[0.0; 4]; MAX_SPRITES_PER_BATCH],
        source_clamp: [[0.0; 4]; MAX_SPRITES_PER_BATCH],
    };

    let mut vertices = Vec::with_capacity(batch.sprites.len() * super::VERTICES_PER_SPRITE);
    for (index, sprite) in batch.sprites.iter().enumerate() {
        let SpriteInfo {
            source_size,
            source_rect,
            dest_rect,
            tint,
        } = *sprite;
        let (sw, sh) = (source_size.width as f32, source_size.height as f32);

        constants.source_dimensions[index] = [sw, sh, 0.0, 0.0];
        // Half-pixel inset stops bilinear sampling from bleeding in texels
        // of a neighbouring sprite.
        constants.source_clamp[index] = [
            (source_rect.left() as f32 + 0.5) / sw,
            (source_rect.top() as f32 + 0.5) / sh,
            (source_rect.right() as f32 - 0.5) / sw,
            (source_rect.bottom() as f32 - 0.5) / sh,
        ];

        let src_tl = [source_rect.left() as f32, source_rect.top() as f32];
        let src_br = [source_rect.right() as f32, source_rect.bottom() as f32];
        let src_bl = [src_tl[0], src_br[1]];
        let src_tr = [src_br[0], src_tl[1]];

        let dst_tl = [dest_rect.left() as f32, dest_rect.top() as f32];
        let dst_br = [dest_rect.right() as f32, dest_rect.bottom() as f32];
        let dst_tr = [dst_br[0], dst_tl[1]];
        let dst_bl = [dst_tl[0], dst_br[1]];

        let vertex = |tex_coord: [f32; 2], position: [f32; 2]| Vertex {
            position,
            color: tint.to_array(),
            tex_coord,
            texture_index: index as u32,
        };

        // A rectangle is two triangles.

        // First triangle: excludes top right
        vertices.push(vertex(src_bl, dst_bl));
        vertices.push(vertex(src_tl, dst_tl));
        vertices.push(vertex(src_br, dst_br));

        // Second triangle: excludes bottom left
        vertices.push(vertex(src_tl, dst_tl));
        vertices.push(vertex(src_tr, dst_tr));
        vertices.push(vertex(src_br, dst_br));
    }

    DrawData {
        vertices,
        constants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Color, Point, Rect, Size};

    fn batch_of(sprites: Vec<SpriteInfo>, dest: Size<u32>) -> OpenBatch {
        OpenBatch {
            dest_size: dest,
            sprites,
            clear_color: None,
        }
    }

    #[test]
    fn identity_draw_covers_source_exactly() {
        // draw(view, size, src, src, identity) into a src-sized target: the
        // quad must cover the whole target and UV the whole source.
        let size = Size::new(1024, 1024);
        let rect = Rect::new(Point::new(0, 0), size);
        let data = build_draw_data(&batch_of(
            vec![SpriteInfo {
                source_size: size,
                source_rect: rect,
                dest_rect: rect,
                tint: Color::WHITE,
            }],
            size,
        ));

        assert_eq!(data.vertices.len(), 6);
        let xs: Vec<f32> = data.vertices.iter().map(|v| v.position[0]).collect();
        let ys: Vec<f32> = data.vertices.iter().map(|v| v.position[1]).collect();
        assert_eq!(xs.iter().cloned().fold(f32::MAX, f32::min), 0.0);
        assert_eq!(xs.iter().cloned().fold(f32::MIN, f32::max), 1024.0);
        assert_eq!(ys.iter().cloned().fold(f32::MAX, f32::min), 0.0);
        assert_eq!(ys.iter().cloned().fold(f32::MIN, f32::max), 1024.0);

        for v in &data.vertices {
            assert_eq!(v.position, v.tex_coord, "identity draw maps 1:1");
            assert_eq!(v.color, [1.0; 4]);
            assert_eq!(v.texture_index, 0);
        }
        assert_eq!(data.constants.target_dimensions, [1024.0, 1024.0]);
        assert_eq!(data.constants.source_dimensions[0], [1024.0, 1024.0, 0.0, 0.0]);
    }

    #[test]
    fn source_clamp_is_half_pixel_inset() {
        let data = build_draw_data(&batch_of(
            vec![SpriteInfo {
                source_size: Size::new(100, 200),
                source_rect: Rect::new(Point::new(10, 20), Size::new(30, 40)),
                dest_rect: Rect::new(Point::new(0, 0), Size::new(30, 40)),
                tint: Color::WHITE,
            }],
            Size::new(64, 64),
        ));

        let clamp = data.constants.source_clamp[0];
        assert_eq!(clamp[0], 10.5 / 100.0);
        assert_eq!(clamp[1], 20.5 / 200.0);
        assert_eq!(clamp[2], 39.5 / 100.0);
        assert_eq!(clamp[3], 59.5 / 200.0);
    }

    #[test]
    fn sprites_keep_draw_order_and_indices() {
        let sprite = |x: u32| SpriteInfo {
            source_size: Size::new(512, 512),
            source_rect: Rect::new(Point::new(0, 0), Size::new(512, 512)),
            dest_rect: Rect::new(Point::new(x, 0), Size::new(512, 512)),
            tint: Color::opacity(0.5),
        };
        let data = build_draw_data(&batch_of(
            vec![sprite(0), sprite(512)],
            Size::new(1024, 512),
        ));

        assert_eq!(data.vertices.len(), 12);
        assert!(data.vertices[..6].iter().all(|v| v.texture_index == 0));
        assert!(data.vertices[6..].iter().all(|v| v.texture_index == 1));

        // Z-order: the second sprite's quad comes later in the vertex stream.
        let second_min_x = data.vertices[6..]
            .iter()
            .map(|v| v.position[0])
            .fold(f32::MAX, f32::min);
        assert_eq!(second_min_x, 512.0);
    }

    #[test]
    fn vertex_layout_matches_shader_stride() {
        assert_eq!(std::mem::size_of::<Vertex>(), 36);
        assert_eq!(std::mem::offset_of!(Vertex, color), 8);
        assert_eq!(std::mem::offset_of!(Vertex, tex_coord), 24);
        assert_eq!(std::mem::offset_of!(Vertex, texture_index), 32);
        assert_eq!(std::mem::size_of::<SpriteConstants>(), 16 + 256 + 256);
    }
}
