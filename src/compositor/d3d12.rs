//! D3D12 consumer. Submits its own command lists on the host's direct
//! queue, which keeps fence interop with the host trivial; the shared-frame
//! wait is a queue-side `ID3D12CommandQueue::Wait`.

use super::LayerSprite;
use crate::error::CompositorError;
use crate::geometry::{Color, Size};
use crate::shm::{ConsumerKind, FrameSnapshot, LazyReader, SessionCache};
use crate::sprite::d3d12::SpriteBatch;
use crate::sprite::MAX_INFLIGHT_FRAMES;
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

fn win_err(context: &str, e: windows::core::Error) -> CompositorError {
    CompositorError::BackendCommandFailed(format!("{context}: {e}"))
}

struct SharedFrame {
    resource: ID3D12Resource,
    fence: ID3D12Fence,
    size: Size<u32>,
}

struct SwapchainResources {
    images: Vec<ID3D12Resource>,
    rtv_heap: ID3D12DescriptorHeap,
    rtv_size: u32,
    size: Size<u32>,
}

struct FrameCommands {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

pub struct Compositor {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    batch: Option<SpriteBatch>,
    commands: Vec<FrameCommands>,
    command_index: usize,
    swapchain: Option<SwapchainResources>,
    completion_fence: ID3D12Fence,
    completion_value: u64,
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

    pub fn new(device: &ID3D12Device, queue: &ID3D12CommandQueue) -> Result<Self, CompositorError> {
        let commands = (0..MAX_INFLIGHT_FRAMES)
            .map(|_| {
                let allocator: ID3D12CommandAllocator = unsafe {
                    device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                }
                .map_err(|e| win_err("CreateCommandAllocator", e))?;
                let list: ID3D12GraphicsCommandList = unsafe {
                    device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
                }
                .map_err(|e| win_err("CreateCommandList", e))?;
                unsafe { list.Close() }.map_err(|e| win_err("Close", e))?;
                Ok(FrameCommands { allocator, list })
            })
            .collect::<Result<Vec<_>, CompositorError>>()?;

        let completion_fence: ID3D12Fence =
            unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
                .map_err(|e| win_err("CreateFence", e))?;

        let reader = LazyReader::new(ConsumerKind::OpenXrD3D12);

        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            batch: None,
            commands,
            command_index: 0,
            swapchain: None,
            completion_fence,
            completion_value: 0,
            reader,
            cache: SessionCache::new(),
        })
    }

    pub fn reader(&mut self) -> &mut LazyReader {
        &mut self.reader
    }

    pub fn store_swapchain_images(
        &mut self,
        images: Vec<ID3D12Resource>,
        texture_format: DXGI_FORMAT,
        rtv_format: DXGI_FORMAT,
        size: Size<u32>,
    ) -> Result<(), CompositorError> {
        self.release_swapchain();

        if self.batch.is_none() {
            self.batch = Some(SpriteBatch::new(&self.device, texture_format)?);
        }

        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            NumDescriptors: images.len() as u32,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
            NodeMask: 0,
        };
        let rtv_heap: ID3D12DescriptorHeap = unsafe { self.device.CreateDescriptorHeap(&heap_desc) }
            .map_err(|e| win_err("CreateDescriptorHeap(rtv)", e))?;
        let rtv_size = unsafe {
            self.device
                .GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV)
        };

        let rtv_desc = D3D12_RENDER_TARGET_VIEW_DESC {
            Format: rtv_format,
            ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
            ..Default::default()
        };
        let heap_start = unsafe { rtv_heap.GetCPUDescriptorHandleForHeapStart() };
        for (index, image) in images.iter().enumerate() {
            let handle = D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: heap_start.ptr + index * rtv_size as usize,
            };
            unsafe {
                self.device
                    .CreateRenderTargetView(image, Some(&rtv_desc), handle)
            };
        }

        self.swapchain = Some(SwapchainResources {
            images,
            rtv_heap,
            rtv_size,
            size,
        });
        Ok(())
    }

    pub fn release_swapchain(&mut self) {
        self.drain_gpu();
        self.swapchain = None;
    }

    fn map_frame(
        &mut self,
        snapshot: &FrameSnapshot,
    ) -> Result<(ID3D12Resource, ID3D12Fence, Size<u32>), CompositorError> {
        let device = self.device.clone();
        let mapped = {
            let frame = self.cache.get_or_open(snapshot.map_key(), || {
                open_shared_frame(&device, snapshot)
            })?;
            (frame.resource.clone(), frame.fence.clone(), frame.size)
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
        let (resource, fence, frame_size) = self.map_frame(snapshot)?;
        if let Some(reader) = self.reader.attached() {
            reader.touch_feedback();
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| CompositorError::BackendCommandFailed("no swapchain stored".into()))?;
        if image_index >= swapchain.images.len() {
            return Err(CompositorError::BackendCommandFailed(format!(
                "bad image index {image_index}"
            )));
        }
        let heap_start = unsafe { swapchain.rtv_heap.GetCPUDescriptorHandleForHeapStart() };
        let rtv = D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: heap_start.ptr + image_index * swapchain.rtv_size as usize,
        };
        let dest_size = swapchain.size;

        let commands = &self.commands[self.command_index];
        self.command_index = (self.command_index + 1) % self.commands.len();
        unsafe {
            commands
                .allocator
                .Reset()
                .map_err(|e| win_err("allocator Reset", e))?;
            commands
                .list
                .Reset(&commands.allocator, None)
                .map_err(|e| win_err("list Reset", e))?;
        }

        let batch = self.batch.as_mut().expect("batch exists with swapchain");
        batch.begin(&commands.list, rtv, dest_size)?;
        batch.clear(Color::TRANSPARENT)?;
        let tint = snapshot.tint();
        for sprite in sprites {
            let tinted = Color::new(
                tint[0] * sprite.opacity,
                tint[1] * sprite.opacity,
                tint[2] * sprite.opacity,
                tint[3] * sprite.opacity,
            );
            batch.draw(
                &resource,
                frame_size,
                sprite.source_rect,
                sprite.dest_rect,
                tinted,
            )?;
        }
        batch.end()?;
        unsafe { commands.list.Close() }.map_err(|e| win_err("list Close", e))?;

        // Order on the host's direct queue: wait for the producer's fence,
        // run our composition, then bump our own timeline.
        unsafe {
            self.queue
                .Wait(&fence, snapshot.fence_value())
                .map_err(|e| win_err("queue Wait", e))?;
            let list: ID3D12CommandList = commands
                .list
                .cast()
                .map_err(|e| win_err("command list cast", e))?;
            self.queue.ExecuteCommandLists(&[Some(list)]);
            self.completion_value += 1;
            self.queue
                .Signal(&self.completion_fence, self.completion_value)
                .map_err(|e| win_err("queue Signal", e))?;
        }
        Ok(())
    }

    /// One CPU fence wait to drain in-flight composition before resources go
    /// away.
    fn drain_gpu(&self) {
        if self.completion_value == 0 {
            return;
        }
        unsafe {
            if self.completion_fence.GetCompletedValue() >= self.completion_value {
                return;
            }
            let Ok(event) = CreateEventW(None, false, false, None) else {
                return;
            };
            if self
                .completion_fence
                .SetEventOnCompletion(self.completion_value, event)
                .is_ok()
            {
                WaitForSingleObject(event, INFINITE);
            }
            let _ = CloseHandle(event);
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.drain_gpu();
    }
}

fn open_shared_frame(
    device: &ID3D12Device,
    snapshot: &FrameSnapshot,
) -> Result<SharedFrame, CompositorError> {
    let resource: ID3D12Resource =
        unsafe { device.OpenSharedHandle(HANDLE(snapshot.texture_handle() as _)) }
            .map_err(|e| win_err("OpenSharedHandle(texture)", e))?;
    let fence: ID3D12Fence =
        unsafe { device.OpenSharedHandle(HANDLE(snapshot.fence_handle() as _)) }
            .map_err(|e| win_err("OpenSharedHandle(fence)", e))?;

    log::debug!(
        "mapped shared frame for session {:#018x}",
        snapshot.session_id()
    );
    Ok(SharedFrame {
        resource,
        fence,
        size: snapshot.texture_size(),
    })
}
