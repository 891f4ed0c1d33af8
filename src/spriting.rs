//! Atlas layout: composited layers are sprited side-by-side into a single
//! horizontal strip, one fixed-width cell per layer.

use crate::geometry::{Point, Rect, Size};

/// Hard cap on layers in one frame; the wire format stores `u8` counts but
/// nothing past this index is ever read.
pub const MAX_VIEW_COUNT: usize = 8;

/// Per-layer worst case; also the upscale target for runtimes that want
/// full-resolution quads (see the Varjo quirk).
pub const MAX_VIEW_RENDER_SIZE: Size<u32> = Size::new(2048, 2048);

/// The cell size for a frame: the smallest box holding every layer's source
/// rectangle. Upscaling consumers pass [`MAX_VIEW_RENDER_SIZE`] instead.
pub fn cell_size<'a>(layer_rects: impl IntoIterator<Item = &'a Rect<u32>>) -> Size<u32> {
    let mut cell = Size::new(0, 0);
    for rect in layer_rects {
        cell.width = cell.width.max(rect.size.width);
        cell.height = cell.height.max(rect.size.height);
    }
    cell
}

/// Atlas size for `layer_count` layers of the given cell size. Width is
/// monotone in `layer_count`.
pub fn buffer_size(layer_count: usize, cell: Size<u32>) -> Size<u32> {
    Size::new(cell.width * layer_count as u32, cell.height)
}

/// Destination offset of layer `index` within the atlas.
pub fn layer_offset(index: usize, cell: Size<u32>) -> Point<u32> {
    Point::new(cell.width * index as u32, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_layer_fills_atlas() {
        let rects = [Rect::new(Point::new(0, 0), Size::new(1024, 1024))];
        let cell = cell_size(&rects);
        assert_eq!(buffer_size(1, cell), Size::new(1024, 1024));
        assert_eq!(layer_offset(0, cell), Point::new(0, 0));
    }

    #[test]
    fn two_layers_side_by_side() {
        let rects = [
            Rect::new(Point::new(0, 0), Size::new(512, 512)),
            Rect::new(Point::new(512, 0), Size::new(512, 512)),
        ];
        let cell = cell_size(&rects);
        assert_eq!(buffer_size(2, cell), Size::new(1024, 512));
        assert_eq!(layer_offset(0, cell), Point::new(0, 0));
        assert_eq!(layer_offset(1, cell), Point::new(512, 0));
    }

    #[test]
    fn width_is_monotone_in_layer_count() {
        let cell = MAX_VIEW_RENDER_SIZE;
        let mut last = 0;
        for count in 0..=MAX_VIEW_COUNT {
            let size = buffer_size(count, cell);
            assert!(size.width >= last);
            last = size.width;
        }
    }

    #[test]
    fn offsets_lie_inside_buffer() {
        let cell = Size::new(800, 600);
        for count in 1..=MAX_VIEW_COUNT {
            let atlas = Rect::new(Point::new(0, 0), buffer_size(count, cell));
            for index in 0..count {
                let dest = Rect::new(layer_offset(index, cell), cell);
                assert!(atlas.contains_rect(&dest), "layer {index}/{count}");
            }
        }
    }
}
