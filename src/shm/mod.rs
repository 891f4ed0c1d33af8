//! The cross-process frame ring: a fixed header plus N seqlock-guarded frame
//! slots in a named shared mapping. One producer, any number of consumers.
//!
//! The wire layout is versioned through the object name; a consumer built
//! against a different layout simply never finds the mapping.

mod mapping;
pub mod reader;
pub mod writer;

pub use mapping::Mapping;
pub use reader::{FrameSnapshot, LazyReader, MapKey, Reader, SessionCache};
pub use writer::{FrameLayout, LayerConfig, Writer, WriterGuard};

use crate::geometry::{Rect, Size};
use thiserror::Error;

/// Bumped on any change to [`Header`], [`Slot`] or [`LayerEntry`].
pub const WIRE_VERSION: u32 = 1;

pub const DEFAULT_SLOT_COUNT: usize = 4;
pub const MAX_SLOT_COUNT: usize = 8;

/// Seqlock read attempts before `maybe_get` gives up for this frame.
pub const SEQLOCK_RETRY_LIMIT: u32 = 16;

/// A consumer is "active" if its feedback stamp is within this window.
pub const ACTIVE_CONSUMER_WINDOW_US: u64 = 1_000_000;

pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"OKBSHM\xF0\x9F");

// The writer mutex shares the mapping's name with a ".mutex" suffix; see
// `mapping::Platform`.
#[cfg(windows)]
pub(crate) fn mapping_name() -> String {
    format!("Local\\OpenKneeboard/SHM.v{WIRE_VERSION}")
}

#[cfg(unix)]
pub(crate) fn mapping_name() -> String {
    format!("/OpenKneeboard.SHM.v{WIRE_VERSION}")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("shared memory unavailable: {0}")]
    ShmNotAvailable(#[source] std::io::Error),
    #[error("wire version mismatch (found {found}, expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("on-wire layout invalid: {0}")]
    InvalidOnWireLayout(String),
    #[error("no frame has been published")]
    NoFrame,
    #[error("producer session changed mid-map")]
    StaleSession,
    #[error("seqlock retry limit exceeded")]
    SeqlockRetryExceeded,
    #[error("fence value {proposed} regresses from {committed} within one session")]
    FenceNotReady { committed: u64, proposed: u64 },
    #[error("{count} layers exceeds the {max}-layer cap")]
    TooManyLayers { count: usize, max: usize },
}

/// Identifies a consumer implementation for liveness diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    Viewer,
    OpenVr,
    OpenXrD3D11,
    OpenXrD3D12,
    OpenXrVulkan,
    OculusD3D11,
    NonVrD3D11,
}

impl ConsumerKind {
    /// Index into [`Feedback::last_seen_us`]; the three OpenXR backends share
    /// one diagnostic slot.
    pub(crate) fn feedback_index(self) -> usize {
        match self {
            Self::Viewer => 0,
            Self::OpenXrD3D11 | Self::OpenXrD3D12 | Self::OpenXrVulkan => 1,
            Self::OpenVr => 2,
            Self::OculusD3D11 => 3,
            Self::NonVrD3D11 => 4,
        }
    }

    pub const ALL: [ConsumerKind; 7] = [
        Self::Viewer,
        Self::OpenVr,
        Self::OpenXrD3D11,
        Self::OpenXrD3D12,
        Self::OpenXrVulkan,
        Self::OculusD3D11,
        Self::NonVrD3D11,
    ];
}

/// Diagnostic names for the feedback slots, index-aligned with
/// [`ConsumerKind::feedback_index`].
pub const FEEDBACK_SLOT_NAMES: [&str; 5] = ["Viewer", "OpenXR", "OpenVR", "Oculus", "NonVR-D3D11"];

/// Consumer-to-producer feedback. Producer reads, consumers store; all
/// access is through atomics over the mapping.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Feedback {
    /// Microseconds since UNIX epoch, indexed by `ConsumerKind::feedback_index`.
    pub last_seen_us: [u64; 5],
    pub consumer_pids: [u64; 5],
    pub active_in_game_view_id: u64,
    pub nonvr_pixel_size: Size<u32>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: u64,
    pub version: u32,
    pub slot_count: u32,
    pub session_id: u64,
    pub producer_pid: u64,
    /// Total frames committed; also selects the most recent slot.
    pub frame_counter: u64,
    pub latest_slot: u64,
    pub feedback: Feedback,
}

/// VR placement for one layer, as published by the producer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VrLayout {
    pub position: [f32; 3],
    pub euler_radians: [f32; 3],
    pub size_metres: [f32; 2],
    /// Gaze-target rectangle as a multiple of the kneeboard size.
    pub gaze_target_scale: [f32; 2],
    pub zoom_scale: [f32; 2],
    pub opacity: f32,
    /// 0 = independent view; 1 = horizontal mirror of `mirror_of`.
    pub kind: u32,
    pub mirror_of: u64,
}

pub const VR_LAYOUT_KIND_INDEPENDENT: u32 = 0;
pub const VR_LAYOUT_KIND_HORIZONTAL_MIRROR: u32 = 1;

/// Non-VR placement: nine-way anchor within the host viewport.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct NonVrLayout {
    pub alignment: u32,
    pub height_percent: u32,
    pub padding_pixels: u32,
    pub opacity: f32,
}

pub(crate) const LAYER_FLAG_VR_ENABLED: u32 = 1 << 0;
pub(crate) const LAYER_FLAG_NONVR_ENABLED: u32 = 1 << 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LayerEntry {
    pub layer_id: u64,
    pub location_on_texture: Rect<u32>,
    pub vr: VrLayout,
    pub nonvr: NonVrLayout,
    pub(crate) flags: u32,
    _pad: u32,
}

impl LayerEntry {
    #[inline]
    pub fn vr_enabled(&self) -> bool {
        self.flags & LAYER_FLAG_VR_ENABLED != 0
    }

    #[inline]
    pub fn nonvr_enabled(&self) -> bool {
        self.flags & LAYER_FLAG_NONVR_ENABLED != 0
    }
}

/// Quirk bits carried per frame. `OCULUS_DISCARD_DEPTH` is recorded but has
/// no effect on the OpenXR path.
pub mod quirks {
    pub const UPSCALING_ALWAYS_ON: u64 = 1 << 0;
    pub const UPSCALING_ALWAYS_OFF: u64 = 1 << 1;
    pub const OCULUS_DISCARD_DEPTH: u64 = 1 << 2;
}

/// One ring slot. `sequence` follows seqlock discipline: odd while the
/// writer is inside, even when consistent; consumers copy the whole slot
/// between two equal even reads.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Slot {
    pub sequence: u64,
    pub session_id: u64,
    pub fence_value: u64,
    pub texture_handle: u64,
    pub fence_handle: u64,
    pub texture_size: Size<u32>,
    pub layer_count: u8,
    _pad: [u8; 7],
    pub global_input_layer_id: u64,
    pub tint: [f32; 4],
    pub quirks: u64,
    pub layers: [LayerEntry; crate::spriting::MAX_VIEW_COUNT],
}

impl Default for Slot {
    fn default() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

impl Slot {
    /// Truncates rather than overruns if a foreign writer published a bogus
    /// count.
    #[inline]
    pub fn layers(&self) -> &[LayerEntry] {
        &self.layers[..(self.layer_count as usize).min(crate::spriting::MAX_VIEW_COUNT)]
    }
}

/// Slots start past the header on their own cache lines.
pub(crate) const SLOTS_OFFSET: usize = 192;

pub(crate) fn region_len(slot_count: usize) -> usize {
    SLOTS_OFFSET + slot_count * std::mem::size_of::<Slot>()
}

/// Atomic view of a `u64` field inside the mapping at `offset` bytes.
///
/// Safety: `offset` must be 8-aligned and within the mapping; the mapping
/// outlives the returned reference via the borrow.
pub(crate) unsafe fn atomic_u64_at(mapping: &Mapping, offset: usize) -> &std::sync::atomic::AtomicU64 {
    debug_assert!(offset % 8 == 0 && offset + 8 <= mapping.len());
    unsafe { std::sync::atomic::AtomicU64::from_ptr(mapping.as_ptr().add(offset).cast()) }
}

pub(crate) fn slot_offset(index: usize) -> usize {
    SLOTS_OFFSET + index * std::mem::size_of::<Slot>()
}

pub(crate) fn timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

const _: () = {
    assert!(std::mem::size_of::<Header>() <= SLOTS_OFFSET);
    assert!(std::mem::align_of::<Slot>() == 8);
    assert!(std::mem::size_of::<Slot>() % 8 == 0);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Size};

    #[test]
    fn wire_layout_is_stable() {
        // These are on-wire facts; a change here is a WIRE_VERSION bump.
        assert_eq!(std::mem::size_of::<VrLayout>(), 64);
        assert_eq!(std::mem::size_of::<NonVrLayout>(), 16);
        assert_eq!(std::mem::size_of::<LayerEntry>(), 112);
        assert_eq!(std::mem::size_of::<Slot>(), 984);
        assert_eq!(std::mem::offset_of!(Slot, sequence), 0);
    }

    #[test]
    fn layer_flags_round_trip() {
        let mut entry = LayerEntry {
            layer_id: 7,
            location_on_texture: Rect::new(Point::new(0, 0), Size::new(64, 64)),
            ..Default::default()
        };
        assert!(!entry.vr_enabled());
        entry.flags = LAYER_FLAG_VR_ENABLED | LAYER_FLAG_NONVR_ENABLED;
        assert!(entry.vr_enabled());
        assert!(entry.nonvr_enabled());
    }
}
