//! Batched-quad renderer, one implementation per graphics API with identical
//! semantics: `begin` / `clear` / `draw`×N / `end` producing a single draw
//! call. Sources are premultiplied alpha; blending is ONE / INV_SRC_ALPHA on
//! both channels so later sprites correctly attenuate what is underneath.

pub mod geometry;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;
pub mod vulkan;

use crate::geometry::{Color, Rect, Size};
use thiserror::Error;

/// HLSL source for the D3D backends; compiled at runtime with D3DCompile so
/// no shader toolchain is needed at build time.
#[cfg(windows)]
pub(crate) const SPRITE_HLSL: &str = include_str!("../../shaders/src/sprite.hlsl");

/// One draw call renders at most this many sprites.
pub const MAX_SPRITES_PER_BATCH: usize = 16;

/// Descriptor windows cycled before reuse, so the GPU is never asked to
/// rebind descriptors it may still be reading.
pub const MAX_INFLIGHT_FRAMES: usize = 3;

pub const VERTICES_PER_SPRITE: usize = 6;

#[derive(Debug, Error)]
pub enum Error {
    #[error("batch already open; call end() first")]
    BatchAlreadyOpen,
    #[error("no batch open; call begin() first")]
    BatchNotOpen,
    #[error("batch holds the maximum of {MAX_SPRITES_PER_BATCH} sprites")]
    TooManySprites,
    #[error("end() with no sprites recorded")]
    NoSpritesRecorded,
    #[error("backend command failed: {0}")]
    Backend(String),
}

/// CPU-side description of one sprite, API-independent.
#[derive(Copy, Clone, Debug)]
pub struct SpriteInfo {
    pub source_size: Size<u32>,
    pub source_rect: Rect<u32>,
    pub dest_rect: Rect<u32>,
    pub tint: Color,
}

/// The begin/draw/end state machine shared by every backend. Backends embed
/// one of these and translate the recorded batch into API commands on `end`.
#[derive(Default)]
pub(crate) struct BatchRecorder {
    open: Option<OpenBatch>,
}

pub(crate) struct OpenBatch {
    pub dest_size: Size<u32>,
    pub sprites: Vec<SpriteInfo>,
    /// Applied to the target in end(), before the draw.
    pub clear_color: Option<Color>,
}

impl BatchRecorder {
    pub fn begin(&mut self, dest_size: Size<u32>) -> Result<(), Error> {
        if self.open.is_some() {
            return Err(Error::BatchAlreadyOpen);
        }
        self.open = Some(OpenBatch {
            dest_size,
            sprites: Vec::with_capacity(MAX_SPRITES_PER_BATCH),
            clear_color: None,
        });
        Ok(())
    }

    pub fn clear(&mut self, color: Color) -> Result<(), Error> {
        self.require_open()?.clear_color = Some(color);
        Ok(())
    }

    pub fn require_open(&mut self) -> Result<&mut OpenBatch, Error> {
        self.open.as_mut().ok_or(Error::BatchNotOpen)
    }

    pub fn draw(&mut self, sprite: SpriteInfo) -> Result<(), Error> {
        let batch = self.require_open()?;
        if batch.sprites.len() >= MAX_SPRITES_PER_BATCH {
            return Err(Error::TooManySprites);
        }
        batch.sprites.push(sprite);
        Ok(())
    }

    /// Close the batch, returning it for submission.
    pub fn end(&mut self) -> Result<OpenBatch, Error> {
        let batch = self.open.take().ok_or(Error::BatchNotOpen)?;
        if batch.sprites.is_empty() {
            return Err(Error::NoSpritesRecorded);
        }
        Ok(batch)
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    fn sprite() -> SpriteInfo {
        SpriteInfo {
            source_size: Size::new(64, 64),
            source_rect: Rect::new(Point::new(0, 0), Size::new(64, 64)),
            dest_rect: Rect::new(Point::new(0, 0), Size::new(64, 64)),
            tint: Color::WHITE,
        }
    }

    #[test]
    fn lifecycle_errors() {
        let mut recorder = BatchRecorder::default();
        assert!(matches!(recorder.draw(sprite()), Err(Error::BatchNotOpen)));
        assert!(matches!(recorder.end(), Err(Error::BatchNotOpen)));

        recorder.begin(Size::new(128, 128)).unwrap();
        assert!(matches!(
            recorder.begin(Size::new(128, 128)),
            Err(Error::BatchAlreadyOpen)
        ));
        assert!(matches!(recorder.end(), Err(Error::NoSpritesRecorded)));

        // NoSpritesRecorded closes the batch, like the drop in end().
        recorder.begin(Size::new(128, 128)).unwrap();
        recorder.draw(sprite()).unwrap();
        let batch = recorder.end().unwrap();
        assert_eq!(batch.sprites.len(), 1);
        assert!(!recorder.is_open());
    }

    #[test]
    fn sprite_cap() {
        let mut recorder = BatchRecorder::default();
        recorder.begin(Size::new(128, 128)).unwrap();
        for _ in 0..MAX_SPRITES_PER_BATCH {
            recorder.draw(sprite()).unwrap();
        }
        assert!(matches!(recorder.draw(sprite()), Err(Error::TooManySprites)));
    }
}
