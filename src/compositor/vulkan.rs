//! Vulkan consumer: imports the producer's shared texture and timeline
//! semaphore into the application's device, waits queue-side, and sprites
//! the layers into the swapchain atlas.

use super::LayerSprite;
use crate::error::CompositorError;
use crate::geometry::{Color, Size};
use crate::shm::{ConsumerKind, FrameSnapshot, LazyReader, SessionCache};
use crate::sprite::vulkan::SpriteBatch;
use ash::vk::{self, Handle};

fn vk_err(context: &str, code: vk::Result) -> CompositorError {
    if code == vk::Result::ERROR_DEVICE_LOST {
        return CompositorError::DeviceLost(context.to_string());
    }
    CompositorError::BackendCommandFailed(format!("{context}: {code:?}"))
}

/// The producer's frame mapped into this device; dropped whole on session
/// change.
struct SharedFrame {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    ready_semaphore: vk::Semaphore,
    size: Size<u32>,
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
            self.device.destroy_semaphore(self.ready_semaphore, None);
        }
    }
}

struct SwapchainResources {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    size: Size<u32>,
}

pub struct Compositor {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    batch: Option<SpriteBatch>,
    swapchain: Option<SwapchainResources>,
    completion_semaphore: vk::Semaphore,
    completion_value: u64,
    reader: LazyReader,
    cache: SessionCache<SharedFrame>,
}

// Raw Vulkan handles move with the session between threads.
unsafe impl Send for Compositor {}

impl Compositor {
    /// Swapchain format preference as raw `VkFormat` values, most preferred
    /// first.
    pub fn swapchain_format_preference() -> [i64; 4] {
        [
            vk::Format::B8G8R8A8_SRGB.as_raw() as i64,
            vk::Format::B8G8R8A8_UNORM.as_raw() as i64,
            vk::Format::R8G8B8A8_SRGB.as_raw() as i64,
            vk::Format::R8G8B8A8_UNORM.as_raw() as i64,
        ]
    }

    /// Build from the raw handles in `XrGraphicsBindingVulkan2KHR`.
    ///
    /// # Safety
    /// The handles must be the live instance/device the application gave the
    /// runtime, created through the `XR_KHR_vulkan_enable2` hooks.
    pub unsafe fn new(
        vk_instance: u64,
        vk_physical_device: u64,
        vk_device: u64,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Result<Self, CompositorError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| CompositorError::BackendCommandFailed(format!("load libvulkan: {e}")))?;
        let instance = unsafe {
            ash::Instance::load(entry.static_fn(), vk::Instance::from_raw(vk_instance))
        };
        let device =
            unsafe { ash::Device::load(instance.fp_v1_0(), vk::Device::from_raw(vk_device)) };
        let physical_device = vk::PhysicalDevice::from_raw(vk_physical_device);
        let queue = unsafe { device.get_device_queue(queue_family_index, queue_index) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .map_err(|e| vk_err("create_command_pool", e))?;

        let mut type_info =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE);
        let completion_semaphore = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut type_info),
                None,
            )
        }
        .map_err(|e| vk_err("create_semaphore", e))?;

        let reader = LazyReader::new(ConsumerKind::OpenXrVulkan);

        Ok(Self {
            instance,
            physical_device,
            device,
            queue,
            command_pool,
            command_buffers: Vec::new(),
            batch: None,
            swapchain: None,
            completion_semaphore,
            completion_value: 0,
            reader,
            cache: SessionCache::new(),
        })
    }

    pub fn reader(&mut self) -> &mut LazyReader {
        &mut self.reader
    }

    /// Adopt a freshly-created swapchain's images.
    pub fn store_swapchain_images(
        &mut self,
        raw_images: &[u64],
        format: i64,
        size: Size<u32>,
    ) -> Result<(), CompositorError> {
        self.release_swapchain();
        let format = vk::Format::from_raw(format as i32);

        if self.batch.is_none() {
            self.batch = Some(
                SpriteBatch::new(&self.instance, self.physical_device, &self.device, format)
                    .map_err(CompositorError::from)?,
            );
        }

        let images: Vec<vk::Image> = raw_images.iter().map(|&i| vk::Image::from_raw(i)).collect();
        let views = images
            .iter()
            .map(|&image| unsafe {
                self.device
                    .create_image_view(
                        &vk::ImageViewCreateInfo::default()
                            .image(image)
                            .view_type(vk::ImageViewType::TYPE_2D)
                            .format(format)
                            .subresource_range(vk::ImageSubresourceRange {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                base_mip_level: 0,
                                level_count: 1,
                                base_array_layer: 0,
                                layer_count: 1,
                            }),
                        None,
                    )
                    .map_err(|e| vk_err("create_image_view", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.command_buffers = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(images.len() as u32),
            )
        }
        .map_err(|e| vk_err("allocate_command_buffers", e))?;

        self.swapchain = Some(SwapchainResources {
            images,
            views,
            size,
        });
        Ok(())
    }

    pub fn release_swapchain(&mut self) {
        self.drain_gpu();
        if let Some(batch) = &mut self.batch {
            batch.forget_targets();
        }
        if let Some(swapchain) = self.swapchain.take() {
            for view in swapchain.views {
                unsafe { self.device.destroy_image_view(view, None) };
            }
        }
        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &self.command_buffers)
            };
            self.command_buffers.clear();
        }
    }

    fn map_frame(
        &mut self,
        snapshot: &FrameSnapshot,
    ) -> Result<(vk::ImageView, Size<u32>, vk::Semaphore), CompositorError> {
        let device = self.device.clone();
        let instance = self.instance.clone();
        let physical_device = self.physical_device;
        let mapped = {
            let frame = self.cache.get_or_open(snapshot.map_key(), || {
                open_shared_frame(&instance, physical_device, &device, snapshot)
            })?;
            (frame.view, frame.size, frame.ready_semaphore)
        };
        // Mid-map restart: the handles just opened belong to a dead session.
        let current = self.reader.attached().map(|r| r.current_session_id());
        if current != Some(snapshot.session_id()) {
            self.cache.clear();
            return Err(CompositorError::StaleSession);
        }
        Ok(mapped)
    }

    /// Composite `sprites` into swapchain image `image_index`. The GPU waits
    /// on the producer's timeline at `snapshot.fence_value()`; the CPU never
    /// blocks here.
    pub fn render(
        &mut self,
        image_index: usize,
        snapshot: &FrameSnapshot,
        sprites: &[LayerSprite],
    ) -> Result<(), CompositorError> {
        let (frame_view, frame_size, ready_semaphore) = self.map_frame(snapshot)?;
        if let Some(reader) = self.reader.attached() {
            reader.touch_feedback();
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| CompositorError::BackendCommandFailed("no swapchain stored".into()))?;
        let dest_view = *swapchain.views.get(image_index).ok_or_else(|| {
            CompositorError::BackendCommandFailed(format!("bad image index {image_index}"))
        })?;
        let dest_image = swapchain.images[image_index];
        let dest_size = swapchain.size;
        let buf = self.command_buffers[image_index];
        let batch = self.batch.as_mut().expect("batch exists with swapchain");

        unsafe {
            self.device
                .begin_command_buffer(
                    buf,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(|e| vk_err("begin_command_buffer", e))?;

            // Swapchain image: whatever the runtime left it in -> colour
            // attachment.
            self.device.cmd_pipeline_barrier(
                buf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk::ImageMemoryBarrier {
                    src_access_mask: vk::AccessFlags::empty(),
                    dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    image: dest_image,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                }],
            );
        }

        batch.begin(buf, dest_view, dest_size)?;
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
                frame_view,
                frame_size,
                sprite.source_rect,
                sprite.dest_rect,
                tinted,
            )?;
        }
        batch.end()?;

        unsafe {
            self.device
                .end_command_buffer(buf)
                .map_err(|e| vk_err("end_command_buffer", e))?;
        }

        self.completion_value += 1;
        let wait_values = [snapshot.fence_value()];
        let signal_values = [self.completion_value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let wait_semaphores = [ready_semaphore];
        let wait_stages = [vk::PipelineStageFlags::FRAGMENT_SHADER];
        let signal_semaphores = [self.completion_semaphore];
        let command_buffers = [buf];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
                .map_err(|e| vk_err("queue_submit", e))?;
        }
        Ok(())
    }

    /// CPU-wait until our own timeline catches up; used before releasing
    /// resources the GPU may still read.
    fn drain_gpu(&self) {
        if self.completion_value == 0 {
            return;
        }
        let semaphores = [self.completion_semaphore];
        let values = [self.completion_value];
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            let _ = self.device.wait_semaphores(&wait, u64::MAX);
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.drain_gpu();
        self.cache.clear();
        self.batch = None;
        if let Some(swapchain) = self.swapchain.take() {
            for view in swapchain.views {
                unsafe { self.device.destroy_image_view(view, None) };
            }
        }
        unsafe {
            self.device
                .destroy_semaphore(self.completion_semaphore, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Import the producer's texture and timeline fence. On Windows the handles
/// are NT handles (D3D11 texture / D3D12 fence interop); elsewhere they are
/// opaque fds.
fn open_shared_frame(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
    snapshot: &FrameSnapshot,
) -> Result<SharedFrame, CompositorError> {
    let size = snapshot.texture_size();

    #[cfg(windows)]
    let (memory_handle_type, semaphore_handle_type) = (
        vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32,
        vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE,
    );
    #[cfg(unix)]
    let (memory_handle_type, semaphore_handle_type) = (
        vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
        vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
    );

    let mut external_info =
        vk::ExternalMemoryImageCreateInfo::default().handle_types(memory_handle_type);
    let image = unsafe {
        device.create_image(
            &vk::ImageCreateInfo::default()
                .push_next(&mut external_info)
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk::Format::B8G8R8A8_UNORM)
                .extent(vk::Extent3D {
                    width: size.width,
                    height: size.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::SAMPLED)
                .sharing_mode(vk::SharingMode::EXCLUSIVE),
            None,
        )
    }
    .map_err(|e| vk_err("create_image(shared)", e))?;

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let memory_type = (0..memory_props.memory_type_count)
        .find(|&i| requirements.memory_type_bits & (1 << i) != 0)
        .ok_or_else(|| {
            CompositorError::BackendCommandFailed("no memory type for shared image".into())
        })?;

    let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);

    #[cfg(windows)]
    let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
        .handle_type(memory_handle_type)
        .handle(snapshot.texture_handle() as *mut std::ffi::c_void);
    #[cfg(unix)]
    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(memory_handle_type)
        .fd(snapshot.texture_handle() as i32);

    let memory = unsafe {
        device.allocate_memory(
            &vk::MemoryAllocateInfo::default()
                .push_next(&mut dedicated)
                .push_next(&mut import_info)
                .allocation_size(requirements.size)
                .memory_type_index(memory_type),
            None,
        )
    }
    .map_err(|e| vk_err("allocate_memory(import)", e))?;

    unsafe { device.bind_image_memory(image, memory, 0) }
        .map_err(|e| vk_err("bind_image_memory", e))?;

    let view = unsafe {
        device.create_image_view(
            &vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(vk::Format::B8G8R8A8_UNORM)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                }),
            None,
        )
    }
    .map_err(|e| vk_err("create_image_view(shared)", e))?;

    let mut type_info =
        vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE);
    let ready_semaphore = unsafe {
        device.create_semaphore(
            &vk::SemaphoreCreateInfo::default().push_next(&mut type_info),
            None,
        )
    }
    .map_err(|e| vk_err("create_semaphore(import)", e))?;

    #[cfg(windows)]
    {
        let import = vk::ImportSemaphoreWin32HandleInfoKHR::default()
            .semaphore(ready_semaphore)
            .handle_type(semaphore_handle_type)
            .handle(snapshot.fence_handle() as *mut std::ffi::c_void);
        let ext = ash::khr::external_semaphore_win32::Device::new(instance, device);
        unsafe { ext.import_semaphore_win32_handle(&import) }
            .map_err(|e| vk_err("import_semaphore_win32_handle", e))?;
    }
    #[cfg(unix)]
    {
        let import = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(ready_semaphore)
            .handle_type(semaphore_handle_type)
            .fd(snapshot.fence_handle() as i32);
        let ext = ash::khr::external_semaphore_fd::Device::new(instance, device);
        unsafe { ext.import_semaphore_fd(&import) }
            .map_err(|e| vk_err("import_semaphore_fd", e))?;
    }

    log::debug!(
        "mapped shared frame for session {:#018x} ({}x{})",
        snapshot.session_id(),
        size.width,
        size.height,
    );
    Ok(SharedFrame {
        device: device.clone(),
        image,
        memory,
        view,
        ready_semaphore,
        size,
    })
}
