//! D3D11 consumer. Shares the host application's immediate context, so every
//! render is wrapped in a device-context state switch to leave the host's
//! pipeline state untouched.

use super::LayerSprite;
use crate::error::CompositorError;
use crate::geometry::{Color, Size};
use crate::shm::{ConsumerKind, FrameSnapshot, LazyReader, SessionCache};
use crate::sprite::d3d11::SpriteBatch;
use windows::core::Interface;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_1;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
};

fn win_err(context: &str, e: windows::core::Error) -> CompositorError {
    CompositorError::BackendCommandFailed(format!("{context}: {e}"))
}

/// Swap to our own context state for the scope, restoring the host's on
/// drop.
struct ScopedContextState<'a> {
    context: &'a ID3D11DeviceContext1,
    previous: Option<ID3DDeviceContextState>,
}

impl<'a> ScopedContextState<'a> {
    fn enter(context: &'a ID3D11DeviceContext1, state: &ID3DDeviceContextState) -> Self {
        let mut previous = None;
        unsafe { context.SwapDeviceContextState(state, Some(&mut previous)) };
        Self { context, previous }
    }
}

impl Drop for ScopedContextState<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            unsafe { self.context.SwapDeviceContextState(&previous, None) };
        }
    }
}

struct SharedFrame {
    srv: ID3D11ShaderResourceView,
    fence: ID3D11Fence,
    size: Size<u32>,
}

struct SwapchainResources {
    rtvs: Vec<ID3D11RenderTargetView>,
    size: Size<u32>,
}

pub struct Compositor {
    device: ID3D11Device1,
    context: ID3D11DeviceContext1,
    context4: ID3D11DeviceContext4,
    context_state: ID3DDeviceContextState,
    batch: SpriteBatch,
    swapchain: Option<SwapchainResources>,
    reader: LazyReader,
    cache: SessionCache<SharedFrame>,
}

impl Compositor {
    /// `(texture_format, render_target_view_format)` pairs, most preferred
    /// first.
    pub fn swapchain_format_preference() -> [(DXGI_FORMAT, DXGI_FORMAT); 4] {
        [
            (DXGI_FORMAT_B8G8R8A8_UNORM_SRGB, DXGI_FORMAT_B8G8R8A8_UNORM),
            (DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM),
            (DXGI_FORMAT_R8G8B8A8_UNORM_SRGB, DXGI_FORMAT_R8G8B8A8_UNORM),
            (DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM),
        ]
    }

    pub fn new(device: &ID3D11Device1) -> Result<Self, CompositorError> {
        let context = {
            let mut raw = None;
            unsafe { device.GetImmediateContext1(Some(&mut raw)) };
            raw.expect("device has an immediate context")
        };
        let context4 = context
            .cast::<ID3D11DeviceContext4>()
            .map_err(|e| win_err("ID3D11DeviceContext4 cast", e))?;

        let feature_levels = [D3D_FEATURE_LEVEL_11_1];
        let mut context_state = None;
        unsafe {
            device.CreateDeviceContextState(
                0,
                &feature_levels,
                D3D11_SDK_VERSION,
                &ID3D11Device1::IID,
                None,
                Some(&mut context_state),
            )
        }
        .map_err(|e| win_err("CreateDeviceContextState", e))?;
        let context_state = context_state.expect("context state created");

        let batch = SpriteBatch::new(device)?;
        let reader = LazyReader::new(ConsumerKind::OpenXrD3D11);

        Ok(Self {
            device: device.clone(),
            context,
            context4,
            context_state,
            batch,
            swapchain: None,
            reader,
            cache: SessionCache::new(),
        })
    }

    pub fn reader(&mut self) -> &mut LazyReader {
        &mut self.reader
    }

    /// Adopt a freshly-created swapchain's images as render targets.
    pub fn store_swapchain_images(
        &mut self,
        textures: &[ID3D11Texture2D],
        rtv_format: DXGI_FORMAT,
        size: Size<u32>,
    ) -> Result<(), CompositorError> {
        let rtvs = textures
            .iter()
            .map(|texture| {
                let desc = D3D11_RENDER_TARGET_VIEW_DESC {
                    Format: rtv_format,
                    ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2D,
                    ..Default::default()
                };
                let mut rtv = None;
                unsafe {
                    self.device
                        .CreateRenderTargetView(texture, Some(&desc), Some(&mut rtv))
                }
                .map_err(|e| win_err("CreateRenderTargetView", e))?;
                Ok(rtv.expect("rtv created"))
            })
            .collect::<Result<Vec<_>, CompositorError>>()?;
        self.swapchain = Some(SwapchainResources { rtvs, size });
        Ok(())
    }

    pub fn release_swapchain(&mut self) {
        self.swapchain = None;
    }

    fn map_frame(
        &mut self,
        snapshot: &FrameSnapshot,
    ) -> Result<(ID3D11ShaderResourceView, ID3D11Fence, Size<u32>), CompositorError> {
        let device = self.device.clone();
        let mapped = {
            let frame = self.cache.get_or_open(snapshot.map_key(), || {
                open_shared_frame(&device, snapshot)
            })?;
            (frame.srv.clone(), frame.fence.clone(), frame.size)
        };
        let current = self.reader.attached().map(|r| r.current_session_id());
        if current != Some(snapshot.session_id()) {
            self.cache.clear();
            return Err(CompositorError::StaleSession);
        }
        Ok(mapped)
    }

    pub fn render(
        &mut self,
        image_index: usize,
        snapshot: &FrameSnapshot,
        sprites: &[LayerSprite],
    ) -> Result<(), CompositorError> {
        let (srv, fence, frame_size) = self.map_frame(snapshot)?;
        if let Some(reader) = self.reader.attached() {
            reader.touch_feedback();
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| CompositorError::BackendCommandFailed("no swapchain stored".into()))?;
        let rtv = swapchain
            .rtvs
            .get(image_index)
            .ok_or_else(|| {
                CompositorError::BackendCommandFailed(format!("bad image index {image_index}"))
            })?
            .clone();
        let dest_size = swapchain.size;

        let _state = ScopedContextState::enter(&self.context, &self.context_state);

        // Queue-side wait: the GPU stalls until the producer's timeline
        // reaches this frame's value, the render thread does not.
        unsafe { self.context4.Wait(&fence, snapshot.fence_value()) }
            .map_err(|e| win_err("ID3D11DeviceContext4::Wait", e))?;

        self.batch.begin(&self.context, &rtv, dest_size)?;
        self.batch.clear(Color::TRANSPARENT)?;
        let tint = snapshot.tint();
        for sprite in sprites {
            let tinted = Color::new(
                tint[0] * sprite.opacity,
                tint[1] * sprite.opacity,
                tint[2] * sprite.opacity,
                tint[3] * sprite.opacity,
            );
            self.batch
                .draw(&srv, frame_size, sprite.source_rect, sprite.dest_rect, tinted)?;
        }
        self.batch.end()?;
        Ok(())
    }
}

fn open_shared_frame(
    device: &ID3D11Device1,
    snapshot: &FrameSnapshot,
) -> Result<SharedFrame, CompositorError> {
    let texture: ID3D11Texture2D = unsafe {
        device.OpenSharedResource1(HANDLE(snapshot.texture_handle() as _))
    }
    .map_err(|e| win_err("OpenSharedResource1", e))?;

    let srv_desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        ViewDimension: windows::Win32::Graphics::Direct3D::D3D_SRV_DIMENSION_TEXTURE2D,
        Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
            Texture2D: D3D11_TEX2D_SRV {
                MostDetailedMip: 0,
                MipLevels: 1,
            },
        },
    };
    let mut srv = None;
    unsafe { device.CreateShaderResourceView(&texture, Some(&srv_desc), Some(&mut srv)) }
        .map_err(|e| win_err("CreateShaderResourceView(shared)", e))?;

    let device5 = device
        .cast::<ID3D11Device5>()
        .map_err(|e| win_err("ID3D11Device5 cast", e))?;
    let fence: ID3D11Fence =
        unsafe { device5.OpenSharedFence(HANDLE(snapshot.fence_handle() as _)) }
            .map_err(|e| win_err("OpenSharedFence", e))?;

    log::debug!(
        "mapped shared frame for session {:#018x}",
        snapshot.session_id()
    );
    Ok(SharedFrame {
        srv: srv.expect("srv created"),
        fence,
        size: snapshot.texture_size(),
    })
}
