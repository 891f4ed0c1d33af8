//! Diagnostic viewer: attaches to the frame ring as its own consumer kind
//! and walks the same snapshot/placement pipeline the in-game compositors
//! use, reporting what they would draw.

use clap::{Parser, ValueEnum};
use kneeboard::compositor::placement;
use kneeboard::geometry::Size;
use kneeboard::shm::{ConsumerKind, FrameSnapshot, LazyReader};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum GraphicsApi {
    #[value(name = "D3D11")]
    D3D11,
    #[value(name = "D3D12")]
    D3D12,
    #[value(name = "Vulkan")]
    Vulkan,
}

#[derive(Parser)]
#[command(name = "openkneeboard-viewer", about = "Inspect the kneeboard frame ring")]
struct Args {
    /// Renderer backend to impersonate.
    #[arg(short = 'G', long = "graphics-api", default_value = "Vulkan")]
    graphics_api: GraphicsApi,

    /// Stop after this many seconds instead of running until interrupted.
    #[arg(long)]
    seconds: Option<u64>,

    /// Host viewport reported to the producer for non-VR placement.
    #[arg(long, default_value_t = 1920)]
    viewport_width: u32,
    #[arg(long, default_value_t = 1080)]
    viewport_height: u32,
}

fn describe(snapshot: &FrameSnapshot, viewport: Size<u32>) {
    println!(
        "frame {} session {:#018x}: {} layer(s), texture {}x{}, fence {}",
        snapshot.frame_counter(),
        snapshot.session_id(),
        snapshot.layers().len(),
        snapshot.texture_size().width,
        snapshot.texture_size().height,
        snapshot.fence_value(),
    );

    let (quads, atlas) = placement::build_vr_layers(snapshot, None, false);
    println!("  vr atlas {}x{}", atlas.width, atlas.height);
    for quad in &quads {
        println!(
            "    layer {:#x}: src {:?} -> dest {:?} @ {:.2}x{:.2}m opacity {:.2}",
            quad.layer_id,
            quad.sprite.source_rect,
            quad.sprite.dest_rect,
            quad.size_metres[0],
            quad.size_metres[1],
            quad.sprite.opacity,
        );
    }

    for layer in placement::build_nonvr_layers(snapshot, viewport) {
        println!(
            "    non-vr layer {:#x}: dest {:?} opacity {:.2}",
            layer.layer_id, layer.sprite.dest_rect, layer.sprite.opacity,
        );
    }
}

fn main() {
    kneeboard::init_logging();
    let args = Args::parse();
    log::info!("impersonating the {:?} composition pipeline", args.graphics_api);

    let viewport = Size::new(args.viewport_width, args.viewport_height);
    let mut reader = LazyReader::new(ConsumerKind::Viewer);
    let started = std::time::Instant::now();
    let mut last_session = None;
    let mut printed_cache_key = None;

    loop {
        if let Some(limit) = args.seconds {
            if started.elapsed().as_secs() >= limit {
                break;
            }
        }

        // maybe_get hands back the latest frame on every poll; the cache key
        // is the dirty check that keeps the output to one report per frame.
        if let Some(snapshot) = reader.maybe_get() {
            if last_session != Some(snapshot.session_id()) {
                if last_session.is_some() {
                    println!("producer restarted; dropping cached handles");
                }
                last_session = Some(snapshot.session_id());
            }
            if printed_cache_key != Some(snapshot.cache_key()) {
                describe(&snapshot, viewport);
                printed_cache_key = Some(snapshot.cache_key());
            }
        }
        if let Some(attached) = reader.attached() {
            attached.set_nonvr_pixel_size(viewport);
        }

        std::thread::sleep(std::time::Duration::from_millis(16));
    }
}
