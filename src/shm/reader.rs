//! Consumer side of the frame ring.

use super::*;
use std::sync::atomic::{fence, Ordering};

/// A consistent seqlock-read copy of one slot, immutable for the duration of
/// one composition pass.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    slot: Slot,
    frame_counter: u64,
    cache_key: u64,
}

impl FrameSnapshot {
    #[inline]
    pub fn layers(&self) -> &[LayerEntry] {
        self.slot.layers()
    }

    #[inline]
    pub fn session_id(&self) -> u64 {
        self.slot.session_id
    }

    #[inline]
    pub fn texture_handle(&self) -> u64 {
        self.slot.texture_handle
    }

    #[inline]
    pub fn fence_handle(&self) -> u64 {
        self.slot.fence_handle
    }

    #[inline]
    pub fn fence_value(&self) -> u64 {
        self.slot.fence_value
    }

    #[inline]
    pub fn texture_size(&self) -> crate::geometry::Size<u32> {
        self.slot.texture_size
    }

    #[inline]
    pub fn global_input_layer_id(&self) -> u64 {
        self.slot.global_input_layer_id
    }

    #[inline]
    pub fn tint(&self) -> [f32; 4] {
        self.slot.tint
    }

    #[inline]
    pub fn quirks(&self) -> u64 {
        self.slot.quirks
    }

    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Changes whenever a subsequent `maybe_get` would return a different
    /// snapshot.
    #[inline]
    pub fn cache_key(&self) -> u64 {
        self.cache_key
    }
}

fn cache_key(session_id: u64, frame_counter: u64) -> u64 {
    session_id
        .rotate_left(17)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ frame_counter
}

pub struct Reader {
    mapping: Mapping,
    kind: ConsumerKind,
    seqlock_retry_exceeded: u64,
}

impl Reader {
    /// Attach to the standard ring.
    pub fn open(kind: ConsumerKind) -> Result<Self, Error> {
        Self::open_with_name(&mapping_name(), kind)
    }

    /// Attach to a ring under an explicit object name.
    pub fn open_with_name(name: &str, kind: ConsumerKind) -> Result<Self, Error> {
        let mapping = Mapping::open(name, region_len(MAX_SLOT_COUNT))?;
        let header = unsafe { std::ptr::read_volatile(mapping.as_ptr().cast::<Header>()) };
        if header.magic != MAGIC {
            return Err(Error::InvalidOnWireLayout(format!(
                "bad magic {:#018x}",
                header.magic
            )));
        }
        if header.version != WIRE_VERSION {
            return Err(Error::VersionMismatch {
                found: header.version,
                expected: WIRE_VERSION,
            });
        }
        let reader = Self {
            mapping,
            kind,
            seqlock_retry_exceeded: 0,
        };
        reader.record_attach();
        log::debug!("attached to frame ring as {kind:?}");
        Ok(reader)
    }

    fn feedback_u64(&self, field_offset: usize) -> &std::sync::atomic::AtomicU64 {
        unsafe {
            atomic_u64_at(
                &self.mapping,
                std::mem::offset_of!(Header, feedback) + field_offset,
            )
        }
    }

    fn record_attach(&self) {
        let index = self.kind.feedback_index();
        self.feedback_u64(std::mem::offset_of!(Feedback, consumer_pids) + index * 8)
            .store(std::process::id() as u64, Ordering::Relaxed);
        self.touch_feedback();
    }

    /// Stamp this consumer's liveness slot; called on every successful map.
    pub fn touch_feedback(&self) {
        let index = self.kind.feedback_index();
        self.feedback_u64(std::mem::offset_of!(Feedback, last_seen_us) + index * 8)
            .store(timestamp_us(), Ordering::Relaxed);
    }

    /// Report which view currently has input focus in-game.
    pub fn set_active_in_game_view(&self, layer_id: u64) {
        self.feedback_u64(std::mem::offset_of!(Feedback, active_in_game_view_id))
            .store(layer_id, Ordering::Relaxed);
    }

    /// Report the host viewport so the producer can pre-scale non-VR content.
    pub fn set_nonvr_pixel_size(&self, size: crate::geometry::Size<u32>) {
        let packed = (size.width as u64) | ((size.height as u64) << 32);
        self.feedback_u64(std::mem::offset_of!(Feedback, nonvr_pixel_size))
            .store(packed, Ordering::Relaxed);
    }

    fn header_u64(&self, offset: usize) -> u64 {
        unsafe { atomic_u64_at(&self.mapping, offset) }.load(Ordering::Acquire)
    }

    /// The producer's current session id, for mid-map staleness checks.
    pub fn current_session_id(&self) -> u64 {
        self.header_u64(std::mem::offset_of!(Header, session_id))
    }

    /// Opaque key that changes iff `maybe_get` would return a new snapshot.
    pub fn render_cache_key(&self) -> u64 {
        cache_key(
            self.header_u64(std::mem::offset_of!(Header, session_id)),
            self.header_u64(std::mem::offset_of!(Header, frame_counter)),
        )
    }

    /// Times `maybe_get` gave up after [`SEQLOCK_RETRY_LIMIT`] attempts.
    pub fn seqlock_retry_exceeded(&self) -> u64 {
        self.seqlock_retry_exceeded
    }

    /// Single non-blocking attempt to fetch the latest committed frame.
    /// Idempotent: polling again returns the same frame until the producer
    /// publishes a new one. Callers that only want to act on changes compare
    /// [`Reader::render_cache_key`] (or the snapshot's `cache_key`)
    /// themselves.
    pub fn maybe_get(&mut self) -> Option<FrameSnapshot> {
        let frame_counter = self.header_u64(std::mem::offset_of!(Header, frame_counter));
        if frame_counter == 0 {
            return None;
        }
        let key = cache_key(
            self.header_u64(std::mem::offset_of!(Header, session_id)),
            frame_counter,
        );

        let slot_index =
            self.header_u64(std::mem::offset_of!(Header, latest_slot)) as usize % MAX_SLOT_COUNT;
        let slot = self.read_slot(slot_index)?;

        self.touch_feedback();
        Some(FrameSnapshot {
            slot,
            frame_counter,
            cache_key: key,
        })
    }

    fn read_slot(&mut self, index: usize) -> Option<Slot> {
        let seq = unsafe { atomic_u64_at(&self.mapping, slot_offset(index)) };
        let body_ptr = unsafe { self.mapping.as_ptr().add(slot_offset(index)).cast::<Slot>() };

        for _ in 0..SEQLOCK_RETRY_LIMIT {
            let s0 = seq.load(Ordering::Acquire);
            if s0 % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let mut slot = unsafe { std::ptr::read_volatile(body_ptr) };
            fence(Ordering::Acquire);
            let s1 = seq.load(Ordering::Relaxed);
            if s0 == s1 {
                slot.sequence = s0;
                return Some(slot);
            }
        }
        self.seqlock_retry_exceeded += 1;
        None
    }
}

/// A reader that attaches when the producer appears. Games usually launch
/// before (or without) the kneeboard app; the overlay pops in once frames
/// start flowing.
pub struct LazyReader {
    kind: ConsumerKind,
    name: String,
    reader: Option<Reader>,
    last_attempt: Option<std::time::Instant>,
}

const ATTACH_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

impl LazyReader {
    pub fn new(kind: ConsumerKind) -> Self {
        Self::with_name(mapping_name(), kind)
    }

    pub fn with_name(name: String, kind: ConsumerKind) -> Self {
        Self {
            kind,
            name,
            reader: None,
            last_attempt: None,
        }
    }

    /// The underlying reader, attaching if the producer has appeared since
    /// the last attempt. Attach attempts are rate-limited.
    pub fn attached(&mut self) -> Option<&mut Reader> {
        if self.reader.is_none() {
            let due = self
                .last_attempt
                .is_none_or(|at| at.elapsed() >= ATTACH_RETRY_INTERVAL);
            if due {
                self.last_attempt = Some(std::time::Instant::now());
                match Reader::open_with_name(&self.name, self.kind) {
                    Ok(reader) => {
                        log::info!("frame ring appeared, attached as {:?}", self.kind);
                        self.reader = Some(reader);
                    }
                    Err(Error::ShmNotAvailable(_)) => {}
                    Err(e) => log::warn!("cannot attach to frame ring: {e}"),
                }
            }
        }
        self.reader.as_mut()
    }

    pub fn maybe_get(&mut self) -> Option<FrameSnapshot> {
        self.attached()?.maybe_get()
    }
}

/// What a mapped frame is cached by: `(session_id, texture_handle,
/// layer_count)`. A change in any of them means the old device resources no
/// longer describe the producer's texture.
pub type MapKey = (u64, u64, u8);

impl FrameSnapshot {
    pub fn map_key(&self) -> MapKey {
        (
            self.session_id(),
            self.texture_handle(),
            self.layers().len() as u8,
        )
    }
}

/// Per-session cache of opened cross-process resources (texture + fence).
/// Handles are closed (dropped) before a new session's are opened.
pub struct SessionCache<R> {
    key: Option<MapKey>,
    resources: Option<R>,
}

impl<R> Default for SessionCache<R> {
    fn default() -> Self {
        Self {
            key: None,
            resources: None,
        }
    }
}

impl<R> SessionCache<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.key.map(|(session_id, _, _)| session_id)
    }

    /// Resources for `key`, opening them if anything changed.
    pub fn get_or_open<E>(
        &mut self,
        key: MapKey,
        open: impl FnOnce() -> Result<R, E>,
    ) -> Result<&mut R, E> {
        if self.key != Some(key) {
            // Drop stale handles before opening the new session's.
            self.resources = None;
            self.key = None;
            self.resources = Some(open()?);
            self.key = Some(key);
        }
        Ok(self.resources.as_mut().expect("resources just set"))
    }

    pub fn clear(&mut self) {
        self.resources = None;
        self.key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Rect, Size};
    use crate::shm::writer::{FrameLayout, LayerConfig, Writer};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn test_ring_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        #[cfg(unix)]
        return format!("/okb-test-{tag}-{}-{n}", std::process::id());
        #[cfg(windows)]
        return format!("Local\\okb-test-{tag}-{}-{n}", std::process::id());
    }

    fn one_layer_frame(fence_value: u64) -> FrameLayout {
        FrameLayout {
            texture_handle: 0xbeef,
            fence_handle: 0xcafe,
            fence_value,
            texture_size: Size::new(1024, 1024),
            global_input_layer_id: 1,
            tint: [1.0; 4],
            layers: vec![LayerConfig {
                layer_id: 1,
                location_on_texture: Rect::new(Point::new(0, 0), Size::new(1024, 1024)),
                vr_enabled: true,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn publish(writer: &mut Writer, layout: &FrameLayout) {
        let mut guard = writer.begin_frame().unwrap();
        guard.set_layers(layout).unwrap();
        guard.commit().unwrap();
    }

    #[test]
    fn empty_ring_has_no_frame() {
        let name = test_ring_name("empty");
        let _writer = Writer::create_with_name(&name, 4).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();
        assert!(reader.maybe_get().is_none());
    }

    #[test]
    fn maybe_get_returns_the_latest_frame_idempotently() {
        let name = test_ring_name("commit");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::OpenXrVulkan).unwrap();

        publish(&mut writer, &one_layer_frame(1));

        let snapshot = reader.maybe_get().expect("committed frame visible");
        assert_eq!(snapshot.layers().len(), 1);
        assert_eq!(snapshot.texture_handle(), 0xbeef);
        assert_eq!(snapshot.fence_value(), 1);
        assert_eq!(snapshot.session_id(), writer.session_id());

        // Polling again keeps handing back the same frame; the cache key is
        // how callers notice nothing changed.
        let again = reader.maybe_get().expect("same frame still visible");
        assert_eq!(again.cache_key(), snapshot.cache_key());
        assert_eq!(again.fence_value(), 1);

        publish(&mut writer, &one_layer_frame(2));
        let next = reader.maybe_get().expect("new frame visible");
        assert_ne!(next.cache_key(), snapshot.cache_key());
        assert_eq!(next.fence_value(), 2);
    }

    #[test]
    fn render_cache_key_tracks_new_frames() {
        let name = test_ring_name("key");
        let mut writer = Writer::create_with_name(&name, 2).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();

        let k0 = reader.render_cache_key();
        publish(&mut writer, &one_layer_frame(1));
        let k1 = reader.render_cache_key();
        assert_ne!(k0, k1);

        let snapshot = reader.maybe_get().unwrap();
        assert_eq!(snapshot.cache_key(), k1);
        assert_eq!(reader.render_cache_key(), k1);
    }

    #[test]
    fn abandoned_frame_stays_invisible() {
        let name = test_ring_name("abandon");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();

        let mut guard = writer.begin_frame().unwrap();
        guard.set_layers(&one_layer_frame(1)).unwrap();
        drop(guard);

        assert!(reader.maybe_get().is_none());

        // The abandoned slot is usable again.
        publish(&mut writer, &one_layer_frame(1));
        assert!(reader.maybe_get().is_some());
    }

    #[test]
    fn fence_values_never_regress() {
        let name = test_ring_name("fence");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        publish(&mut writer, &one_layer_frame(10));

        let mut guard = writer.begin_frame().unwrap();
        let err = guard.set_layers(&one_layer_frame(9)).unwrap_err();
        assert!(matches!(
            err,
            Error::FenceNotReady {
                committed: 10,
                proposed: 9
            }
        ));
    }

    #[test]
    fn layer_rects_must_fit_texture() {
        let name = test_ring_name("bounds");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        let mut layout = one_layer_frame(1);
        layout.layers[0].location_on_texture =
            Rect::new(Point::new(512, 0), Size::new(1024, 1024));
        let mut guard = writer.begin_frame().unwrap();
        assert!(matches!(
            guard.set_layers(&layout),
            Err(Error::InvalidOnWireLayout(_))
        ));
    }

    #[test]
    fn too_many_layers_is_rejected() {
        let name = test_ring_name("cap");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        let mut layout = one_layer_frame(1);
        layout.layers = (0..9)
            .map(|i| LayerConfig {
                layer_id: i,
                location_on_texture: Rect::new(Point::new(0, 0), Size::new(16, 16)),
                ..Default::default()
            })
            .collect();
        let mut guard = writer.begin_frame().unwrap();
        assert!(matches!(
            guard.set_layers(&layout),
            Err(Error::TooManyLayers { count: 9, max: 8 })
        ));
    }

    #[test]
    fn session_restart_invalidates_cache_key() {
        let name = test_ring_name("restart");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::OpenXrD3D11).unwrap();

        publish(&mut writer, &one_layer_frame(1));
        let first = reader.maybe_get().unwrap();
        let session_a = first.session_id();

        drop(writer);
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        publish(&mut writer, &one_layer_frame(1));

        let second = reader.maybe_get().expect("new session frame visible");
        assert_ne!(second.session_id(), session_a);
        assert_ne!(second.cache_key(), first.cache_key());
    }

    #[test]
    fn seqlock_retry_limit_is_enforced() {
        let name = test_ring_name("seqlock");
        let mut writer = Writer::create_with_name(&name, 1).unwrap();
        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();

        publish(&mut writer, &one_layer_frame(1));

        // Half-commit: leave the slot's sequence odd, as a stalled writer
        // would, before the reader has seen the frame.
        let seq = unsafe { atomic_u64_at(writer.mapping(), slot_offset(0)) };
        let committed = seq.load(AtomicOrdering::Relaxed);
        seq.store(committed + 1, AtomicOrdering::Relaxed);

        assert!(reader.maybe_get().is_none());
        assert_eq!(reader.seqlock_retry_exceeded(), 1);

        // Restore consistency; the same frame becomes observable.
        seq.store(committed, AtomicOrdering::Relaxed);
        assert!(reader.maybe_get().is_some());
        assert_eq!(reader.seqlock_retry_exceeded(), 1);
    }

    #[test]
    fn feedback_marks_consumers_active() {
        let name = test_ring_name("feedback");
        let mut writer = Writer::create_with_name(&name, 4).unwrap();
        assert!(writer.active_consumers().is_empty());

        let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();
        assert_eq!(writer.active_consumers(), vec!["Viewer"]);

        publish(&mut writer, &one_layer_frame(1));
        reader.maybe_get().unwrap();
        assert_eq!(writer.active_consumers(), vec!["Viewer"]);

        reader.set_active_in_game_view(42);
        assert_eq!(writer.active_in_game_view(), 42);
    }

    #[test]
    fn session_cache_reopens_on_key_change() {
        struct FakeHandles(u64);
        let mut cache = SessionCache::<FakeHandles>::new();
        let mut opens = 0;

        let r = cache
            .get_or_open((1, 0xbeef, 1), || -> Result<_, ()> {
                opens += 1;
                Ok(FakeHandles(1))
            })
            .unwrap();
        assert_eq!(r.0, 1);

        cache
            .get_or_open((1, 0xbeef, 1), || -> Result<_, ()> {
                opens += 1;
                Ok(FakeHandles(1))
            })
            .unwrap();
        assert_eq!(opens, 1, "same session must reuse the cached handles");
        assert_eq!(cache.session_id(), Some(1));

        // Producer restart: new session id.
        let r = cache
            .get_or_open((2, 0xbeef, 1), || -> Result<_, ()> {
                opens += 1;
                Ok(FakeHandles(2))
            })
            .unwrap();
        assert_eq!(r.0, 2);
        assert_eq!(opens, 2);

        // Same session, new texture handle: also reopened.
        cache
            .get_or_open((2, 0xf00d, 1), || -> Result<_, ()> {
                opens += 1;
                Ok(FakeHandles(3))
            })
            .unwrap();
        assert_eq!(opens, 3);
    }
}
