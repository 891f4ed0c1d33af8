//! Producer side of the frame ring.
//!
//! The producer owns the mapping and the cross-process writer lock for its
//! whole lifetime; a restart regenerates the session id, which is what tells
//! consumers to drop their cached texture and fence handles.

use super::*;
use crate::geometry::{Point, Rect, Size};
use crate::spriting::MAX_VIEW_COUNT;
use std::sync::atomic::{fence, Ordering};

/// Producer-side description of one layer.
#[derive(Clone, Debug, Default)]
pub struct LayerConfig {
    pub layer_id: u64,
    pub location_on_texture: Rect<u32>,
    pub vr: VrLayout,
    pub nonvr: NonVrLayout,
    pub vr_enabled: bool,
    pub nonvr_enabled: bool,
}

/// Everything the producer publishes for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    pub texture_handle: u64,
    pub fence_handle: u64,
    /// Timeline value the texture reaches when rendering completes.
    pub fence_value: u64,
    pub texture_size: Size<u32>,
    pub global_input_layer_id: u64,
    pub tint: [f32; 4],
    pub quirks: u64,
    pub layers: Vec<LayerConfig>,
}

pub struct Writer {
    mapping: Mapping,
    slot_count: usize,
    session_id: u64,
    next_slot: usize,
    frame_counter: u64,
    committed_fence_value: u64,
}

impl Writer {
    /// Create the ring under the standard platform name.
    pub fn create(slot_count: usize) -> Result<Self, Error> {
        Self::create_with_name(&mapping_name(), slot_count)
    }

    /// Create the ring under an explicit object name.
    pub fn create_with_name(name: &str, slot_count: usize) -> Result<Self, Error> {
        assert!(
            (1..=MAX_SLOT_COUNT).contains(&slot_count),
            "slot count {slot_count} outside 1..={MAX_SLOT_COUNT}"
        );
        // Capacity is always MAX_SLOT_COUNT so the region size is a constant
        // of the wire version; slot_count is how much of it this producer
        // cycles through.
        let mapping = Mapping::create(name, region_len(MAX_SLOT_COUNT))?;
        mapping.lock_writer()?;

        let session_id = rand::random::<u64>();
        let header = Header {
            magic: MAGIC,
            version: WIRE_VERSION,
            slot_count: slot_count as u32,
            session_id,
            producer_pid: std::process::id() as u64,
            frame_counter: 0,
            latest_slot: 0,
            feedback: Feedback::default(),
        };
        // A stale mapping from a previous producer may still hold old slots;
        // zero everything before publishing the header.
        unsafe {
            std::ptr::write_bytes(mapping.as_ptr(), 0, mapping.len());
            std::ptr::write_volatile(mapping.as_ptr().cast::<Header>(), header);
        }
        fence(Ordering::Release);

        log::info!("created frame ring (session {session_id:#018x}, {slot_count} slots)");
        Ok(Self {
            mapping,
            slot_count,
            session_id,
            next_slot: 0,
            frame_counter: 0,
            committed_fence_value: 0,
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Acquire the next slot and mark it in-progress (sequence goes odd).
    pub fn begin_frame(&mut self) -> Result<WriterGuard<'_>, Error> {
        let slot = self.next_slot;
        let seq = unsafe { atomic_u64_at(&self.mapping, slot_offset(slot)) };
        let current = seq.load(Ordering::Relaxed);
        debug_assert!(current % 2 == 0, "writer found its own slot mid-write");
        seq.store(current + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        Ok(WriterGuard {
            writer: self,
            slot,
            fence_value: 0,
            layers_set: false,
            committed: false,
        })
    }

    /// Feedback slots stamped within the last second, for diagnostics.
    pub fn active_consumers(&self) -> Vec<&'static str> {
        let now = timestamp_us();
        let base = std::mem::offset_of!(Header, feedback)
            + std::mem::offset_of!(Feedback, last_seen_us);
        FEEDBACK_SLOT_NAMES
            .iter()
            .enumerate()
            .filter_map(|(index, name)| {
                let stamp = unsafe { atomic_u64_at(&self.mapping, base + index * 8) }
                    .load(Ordering::Relaxed);
                (stamp != 0 && now.saturating_sub(stamp) <= ACTIVE_CONSUMER_WINDOW_US)
                    .then_some(*name)
            })
            .collect()
    }

    /// The in-game view the consumers report as focused.
    pub fn active_in_game_view(&self) -> u64 {
        let offset = std::mem::offset_of!(Header, feedback)
            + std::mem::offset_of!(Feedback, active_in_game_view_id);
        unsafe { atomic_u64_at(&self.mapping, offset) }.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn mapping(&self) -> &Mapping {
        &self.mapping
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.mapping.unlock_writer();
    }
}

pub struct WriterGuard<'a> {
    writer: &'a mut Writer,
    slot: usize,
    fence_value: u64,
    layers_set: bool,
    committed: bool,
}

impl WriterGuard<'_> {
    /// Fill the slot body. The slot stays unpublished (sequence odd) until
    /// [`WriterGuard::commit`].
    pub fn set_layers(&mut self, layout: &FrameLayout) -> Result<(), Error> {
        if layout.layers.len() > MAX_VIEW_COUNT {
            return Err(Error::TooManyLayers {
                count: layout.layers.len(),
                max: MAX_VIEW_COUNT,
            });
        }
        if layout.fence_value < self.writer.committed_fence_value {
            return Err(Error::FenceNotReady {
                committed: self.writer.committed_fence_value,
                proposed: layout.fence_value,
            });
        }
        let texture_bounds = Rect::new(Point::new(0, 0), layout.texture_size);
        for layer in &layout.layers {
            if !texture_bounds.contains_rect(&layer.location_on_texture) {
                return Err(Error::InvalidOnWireLayout(format!(
                    "layer {:#x} rect {:?} outside texture {:?}",
                    layer.layer_id, layer.location_on_texture, layout.texture_size,
                )));
            }
        }

        let mut slot = Slot {
            session_id: self.writer.session_id,
            fence_value: layout.fence_value,
            texture_handle: layout.texture_handle,
            fence_handle: layout.fence_handle,
            texture_size: layout.texture_size,
            layer_count: layout.layers.len() as u8,
            global_input_layer_id: layout.global_input_layer_id,
            tint: layout.tint,
            quirks: layout.quirks,
            ..Default::default()
        };
        for (entry, config) in slot.layers.iter_mut().zip(&layout.layers) {
            *entry = LayerEntry {
                layer_id: config.layer_id,
                location_on_texture: config.location_on_texture,
                vr: config.vr,
                nonvr: config.nonvr,
                flags: (config.vr_enabled as u32 * LAYER_FLAG_VR_ENABLED)
                    | (config.nonvr_enabled as u32 * LAYER_FLAG_NONVR_ENABLED),
                ..Default::default()
            };
        }

        unsafe {
            let dst = self
                .writer
                .mapping
                .as_ptr()
                .add(slot_offset(self.slot))
                .cast::<Slot>();
            // Skip the sequence word; it is owned by the seqlock protocol.
            let seq_len = std::mem::size_of::<u64>();
            std::ptr::copy_nonoverlapping(
                (&slot as *const Slot).cast::<u8>().add(seq_len),
                dst.cast::<u8>().add(seq_len),
                std::mem::size_of::<Slot>() - seq_len,
            );
        }
        self.fence_value = layout.fence_value;
        self.layers_set = true;
        Ok(())
    }

    /// Publish: bump the sequence back to even and advance the ring. After
    /// this returns the producer must not touch the frame's texture until its
    /// own timeline reaches `fence_value`.
    pub fn commit(mut self) -> Result<(), Error> {
        if !self.layers_set {
            return Err(Error::InvalidOnWireLayout(
                "commit without set_layers".into(),
            ));
        }
        let writer = &mut *self.writer;
        fence(Ordering::Release);
        let seq = unsafe { atomic_u64_at(&writer.mapping, slot_offset(self.slot)) };
        seq.store(seq.load(Ordering::Relaxed) + 1, Ordering::Release);

        writer.frame_counter += 1;
        writer.committed_fence_value = self.fence_value;
        unsafe {
            atomic_u64_at(&writer.mapping, std::mem::offset_of!(Header, latest_slot))
                .store(self.slot as u64, Ordering::Release);
            atomic_u64_at(&writer.mapping, std::mem::offset_of!(Header, frame_counter))
                .store(writer.frame_counter, Ordering::Release);
        }
        writer.next_slot = (self.slot + 1) % writer.slot_count;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Abandoned frame: return the sequence to even so readers stop
        // spinning, without advancing the frame counter.
        fence(Ordering::Release);
        let seq = unsafe { atomic_u64_at(&self.writer.mapping, slot_offset(self.slot)) };
        seq.store(seq.load(Ordering::Relaxed) + 1, Ordering::Release);
    }
}
