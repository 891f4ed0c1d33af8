//! Concurrency test for the frame ring: a producer thread races a consumer
//! the way the UI process races an injected game.

use kneeboard::geometry::{Point, Rect, Size};
use kneeboard::shm::writer::{FrameLayout, LayerConfig, Writer};
use kneeboard::shm::{ConsumerKind, Reader};

fn ring_name() -> String {
    #[cfg(unix)]
    return format!("/okb-itest-{}", std::process::id());
    #[cfg(windows)]
    return format!("Local\\okb-itest-{}", std::process::id());
}

#[test]
fn producer_and_consumer_race_cleanly() {
    const FRAMES: u64 = 200;
    let name = ring_name();

    let mut writer = Writer::create_with_name(&name, 4).unwrap();
    let mut reader = Reader::open_with_name(&name, ConsumerKind::Viewer).unwrap();

    let producer = std::thread::spawn(move || {
        for fence_value in 1..=FRAMES {
            // Derive the layer geometry from the fence value so a torn read
            // would be visible as an inconsistent snapshot.
            let side = 16 + (fence_value % 64) as u32;
            let layout = FrameLayout {
                texture_handle: fence_value * 3,
                fence_handle: 0x1234,
                fence_value,
                texture_size: Size::new(side * 2, side * 2),
                global_input_layer_id: fence_value,
                tint: [1.0; 4],
                layers: vec![LayerConfig {
                    layer_id: fence_value,
                    location_on_texture: Rect::new(Point::new(side, side), Size::new(side, side)),
                    vr_enabled: true,
                    ..Default::default()
                }],
                ..Default::default()
            };
            let mut guard = writer.begin_frame().unwrap();
            guard.set_layers(&layout).unwrap();
            guard.commit().unwrap();
            std::thread::yield_now();
        }
        writer
    });

    let mut last_fence = 0;
    let mut last_key = None;
    let mut distinct = 0;
    while last_fence < FRAMES {
        let Some(snapshot) = reader.maybe_get() else {
            std::thread::yield_now();
            continue;
        };
        // maybe_get returns the latest frame on every poll; the cache key
        // tells us whether this one is actually new.
        if last_key == Some(snapshot.cache_key()) {
            std::thread::yield_now();
            continue;
        }
        last_key = Some(snapshot.cache_key());
        distinct += 1;

        // Monotone fence values within the session.
        assert!(snapshot.fence_value() >= last_fence);
        last_fence = snapshot.fence_value();

        // Internal consistency of every observed snapshot.
        let side = 16 + (snapshot.fence_value() % 64) as u32;
        assert_eq!(snapshot.texture_handle(), snapshot.fence_value() * 3);
        assert_eq!(snapshot.global_input_layer_id(), snapshot.fence_value());
        assert_eq!(snapshot.layers().len(), 1);
        let layer = &snapshot.layers()[0];
        assert_eq!(layer.layer_id, snapshot.fence_value());
        assert_eq!(
            layer.location_on_texture,
            Rect::new(Point::new(side, side), Size::new(side, side)),
        );
    }

    let writer = producer.join().unwrap();
    assert!(distinct > 1, "consumer observed {distinct} frames");
    assert_eq!(writer.active_consumers(), vec!["Viewer"]);
}
