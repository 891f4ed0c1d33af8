//! Vulkan sprite batch. Records into a command buffer the caller has already
//! begun; the caller owns queue submission and timeline-semaphore signalling.

use super::geometry::{build_draw_data, SpriteConstants, Vertex};
use super::{BatchRecorder, Error, SpriteInfo, MAX_INFLIGHT_FRAMES, MAX_SPRITES_PER_BATCH};
use crate::geometry::{Color, Rect, Size};
use ash::vk;
use std::collections::HashMap;

const VERTEX_BUFFER_LEN: usize =
    MAX_SPRITES_PER_BATCH * super::VERTICES_PER_SPRITE * std::mem::size_of::<Vertex>();
const CONSTANTS_LEN: usize = std::mem::size_of::<SpriteConstants>();

fn vk_err(context: &str, code: vk::Result) -> Error {
    Error::Backend(format!("{context}: {code:?}"))
}

struct FrameBuffers {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
}

struct ActiveTarget {
    command_buffer: vk::CommandBuffer,
    dest_view: vk::ImageView,
}

pub struct SpriteBatch {
    device: ash::Device,
    render_pass_load: vk::RenderPass,
    render_pass_clear: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    sampler: vk::Sampler,
    frames: Vec<FrameBuffers>,
    frame_index: usize,
    framebuffers: HashMap<(vk::ImageView, Size<u32>), vk::Framebuffer>,
    recorder: BatchRecorder,
    source_views: Vec<vk::ImageView>,
    target: Option<ActiveTarget>,
}

// The persistently-mapped pointer is only written between begin()/end() on
// the render thread; the type moves between threads with its session.
unsafe impl Send for SpriteBatch {}

impl SpriteBatch {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        format: vk::Format,
    ) -> Result<Self, Error> {
        let device = device.clone();
        let render_pass_load = create_render_pass(&device, format, vk::AttachmentLoadOp::LOAD)?;
        let render_pass_clear = create_render_pass(&device, format, vk::AttachmentLoadOp::CLEAR)?;

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(MAX_SPRITES_PER_BATCH as u32)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                    None,
                )
                .map_err(|e| vk_err("create_descriptor_set_layout", e))?
        };

        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(std::slice::from_ref(&set_layout)),
                    None,
                )
                .map_err(|e| vk_err("create_pipeline_layout", e))?
        };

        let pipeline = create_pipeline(&device, render_pass_load, pipeline_layout)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_INFLIGHT_FRAMES as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: (MAX_SPRITES_PER_BATCH * MAX_INFLIGHT_FRAMES) as u32,
            },
        ];
        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .max_sets(MAX_INFLIGHT_FRAMES as u32)
                        .pool_sizes(&pool_sizes),
                    None,
                )
                .map_err(|e| vk_err("create_descriptor_pool", e))?
        };
        let set_layouts = [set_layout; MAX_INFLIGHT_FRAMES];
        let sets = unsafe {
            device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(descriptor_pool)
                        .set_layouts(&set_layouts),
                )
                .map_err(|e| vk_err("allocate_descriptor_sets", e))?
        };

        // min/mag linear, mip point, clamp on all axes
        let sampler = unsafe {
            device
                .create_sampler(
                    &vk::SamplerCreateInfo::default()
                        .min_filter(vk::Filter::LINEAR)
                        .mag_filter(vk::Filter::LINEAR)
                        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
                    None,
                )
                .map_err(|e| vk_err("create_sampler", e))?
        };

        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let frames = (0..MAX_INFLIGHT_FRAMES)
            .map(|_| FrameBuffers::new(&device, &memory_props))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device,
            render_pass_load,
            render_pass_clear,
            set_layout,
            pipeline_layout,
            pipeline,
            descriptor_pool,
            sets,
            sampler,
            frames,
            frame_index: 0,
            framebuffers: HashMap::new(),
            recorder: BatchRecorder::default(),
            source_views: Vec::with_capacity(MAX_SPRITES_PER_BATCH),
            target: None,
        })
    }

    /// Start a batch targeting `dest_view` of `dest_size` pixels, recording
    /// into `command_buffer` (already in the recording state).
    pub fn begin(
        &mut self,
        command_buffer: vk::CommandBuffer,
        dest_view: vk::ImageView,
        dest_size: Size<u32>,
    ) -> Result<(), Error> {
        self.recorder.begin(dest_size)?;
        self.source_views.clear();
        self.target = Some(ActiveTarget {
            command_buffer,
            dest_view,
        });
        Ok(())
    }

    pub fn clear(&mut self, color: Color) -> Result<(), Error> {
        self.recorder.clear(color)
    }

    pub fn draw(
        &mut self,
        source_view: vk::ImageView,
        source_size: Size<u32>,
        source_rect: Rect<u32>,
        dest_rect: Rect<u32>,
        tint: Color,
    ) -> Result<(), Error> {
        self.recorder.draw(SpriteInfo {
            source_size,
            source_rect,
            dest_rect,
            tint,
        })?;
        self.source_views.push(source_view);
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), Error> {
        let batch = self.recorder.end()?;
        let target = self.target.take().expect("recorder open implies target");
        let data = build_draw_data(&batch);

        let (upload_buffer, mapped) = {
            let frame = &self.frames[self.frame_index];
            (frame.buffer, frame.mapped)
        };
        let set = self.sets[self.frame_index];
        self.frame_index = (self.frame_index + 1) % MAX_INFLIGHT_FRAMES;

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&data.constants).as_ptr(),
                mapped,
                CONSTANTS_LEN,
            );
            let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
            std::ptr::copy_nonoverlapping(
                vertex_bytes.as_ptr(),
                mapped.add(CONSTANTS_LEN),
                vertex_bytes.len(),
            );
        }

        // Unused table slots alias the first view so every descriptor the
        // shader could index is valid.
        let first = self.source_views[0];
        let image_info: Vec<vk::DescriptorImageInfo> = (0..MAX_SPRITES_PER_BATCH)
            .map(|i| vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: self.source_views.get(i).copied().unwrap_or(first),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: upload_buffer,
            offset: 0,
            range: CONSTANTS_LEN as u64,
        }];
        unsafe {
            self.device.update_descriptor_sets(
                &[
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buffer_info),
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(1)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&image_info),
                ],
                &[],
            );
        }

        let extent = vk::Extent2D {
            width: batch.dest_size.width,
            height: batch.dest_size.height,
        };
        let framebuffer = self.framebuffer_for(target.dest_view, batch.dest_size)?;
        let render_pass = if batch.clear_color.is_some() {
            self.render_pass_clear
        } else {
            self.render_pass_load
        };
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: batch.clear_color.unwrap_or(Color::TRANSPARENT).to_array(),
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        let buf = target.command_buffer;
        unsafe {
            self.device.cmd_begin_render_pass(
                buf,
                &vk::RenderPassBeginInfo::default()
                    .render_pass(render_pass)
                    .framebuffer(framebuffer)
                    .render_area(render_area)
                    .clear_values(&clear_values),
                vk::SubpassContents::INLINE,
            );
            self.device
                .cmd_bind_pipeline(buf, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            self.device.cmd_set_viewport(
                buf,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.device.cmd_set_scissor(buf, 0, &[render_area]);
            self.device.cmd_bind_descriptor_sets(
                buf,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );
            self.device
                .cmd_bind_vertex_buffers(buf, 0, &[upload_buffer], &[CONSTANTS_LEN as u64]);
            self.device.cmd_draw(buf, data.vertices.len() as u32, 1, 0, 0);
            self.device.cmd_end_render_pass(buf);
        }
        Ok(())
    }

    fn framebuffer_for(
        &mut self,
        view: vk::ImageView,
        size: Size<u32>,
    ) -> Result<vk::Framebuffer, Error> {
        if let Some(fb) = self.framebuffers.get(&(view, size)) {
            return Ok(*fb);
        }
        let fb = unsafe {
            self.device
                .create_framebuffer(
                    &vk::FramebufferCreateInfo::default()
                        .render_pass(self.render_pass_load)
                        .attachments(std::slice::from_ref(&view))
                        .width(size.width)
                        .height(size.height)
                        .layers(1),
                    None,
                )
                .map_err(|e| vk_err("create_framebuffer", e))?
        };
        self.framebuffers.insert((view, size), fb);
        Ok(fb)
    }

    /// Drop cached framebuffers for views that no longer exist (swapchain
    /// recreation).
    pub fn forget_targets(&mut self) {
        for (_, fb) in self.framebuffers.drain() {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
    }
}

impl Drop for SpriteBatch {
    fn drop(&mut self) {
        unsafe {
            for (_, fb) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(fb, None);
            }
            for frame in &self.frames {
                self.device.destroy_buffer(frame.buffer, None);
                self.device.free_memory(frame.memory, None);
            }
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
            self.device.destroy_render_pass(self.render_pass_load, None);
            self.device.destroy_render_pass(self.render_pass_clear, None);
        }
    }
}

impl FrameBuffers {
    fn new(
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
    ) -> Result<Self, Error> {
        let len = (CONSTANTS_LEN + VERTEX_BUFFER_LEN) as u64;
        let buffer = unsafe {
            device
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(len)
                        .usage(
                            vk::BufferUsageFlags::UNIFORM_BUFFER
                                | vk::BufferUsageFlags::VERTEX_BUFFER,
                        )
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    None,
                )
                .map_err(|e| vk_err("create_buffer", e))?
        };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory_type = (0..memory_props.memory_type_count)
            .find(|&i| {
                requirements.memory_type_bits & (1 << i) != 0
                    && memory_props.memory_types[i as usize]
                        .property_flags
                        .contains(wanted)
            })
            .ok_or_else(|| Error::Backend("no host-visible memory type".into()))?;
        let memory = unsafe {
            device
                .allocate_memory(
                    &vk::MemoryAllocateInfo::default()
                        .allocation_size(requirements.size)
                        .memory_type_index(memory_type),
                    None,
                )
                .map_err(|e| vk_err("allocate_memory", e))?
        };
        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(|e| vk_err("bind_buffer_memory", e))?;
        }
        let mapped = unsafe {
            device
                .map_memory(memory, 0, len, vk::MemoryMapFlags::empty())
                .map_err(|e| vk_err("map_memory", e))?
        }
        .cast::<u8>();
        Ok(Self {
            buffer,
            memory,
            mapped,
        })
    }
}

fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
) -> Result<vk::RenderPass, Error> {
    let initial_layout = if load_op == vk::AttachmentLoadOp::CLEAR {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    };
    let attachment = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout,
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref));
    unsafe {
        device
            .create_render_pass(
                &vk::RenderPassCreateInfo::default()
                    .attachments(std::slice::from_ref(&attachment))
                    .subpasses(std::slice::from_ref(&subpass)),
                None,
            )
            .map_err(|e| vk_err("create_render_pass", e))
    }
}

fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, Error> {
    let load_module = |bytes: &[u8]| -> Result<vk::ShaderModule, Error> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| Error::Backend(format!("bad SPIR-V: {e}")))?;
        unsafe {
            device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&code), None)
                .map_err(|e| vk_err("create_shader_module", e))
        }
    };
    let vert = load_module(&include_bytes!(concat!(env!("OUT_DIR"), "/sprite_vert.spv"))[..])?;
    let frag = match load_module(&include_bytes!(concat!(env!("OUT_DIR"), "/sprite_frag.spv"))[..])
    {
        Ok(frag) => frag,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(c"main"),
    ];

    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, tex_coord) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 3,
            binding: 0,
            format: vk::Format::R32_UINT,
            offset: std::mem::offset_of!(Vertex, texture_index) as u32,
        },
    ];
    let input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(std::slice::from_ref(&binding))
        .vertex_attribute_descriptions(&attributes);

    let assembly_state = vk::PipelineInputAssemblyStateCreateInfo {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rast_state = vk::PipelineRasterizationStateCreateInfo::default()
        .cull_mode(vk::CullModeFlags::NONE)
        .line_width(1.0);
    let multi_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_state = vk::PipelineDepthStencilStateCreateInfo::default();
    // Premultiplied alpha: ONE / INV_SRC_ALPHA for both colour and alpha.
    let blend = vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::ONE,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    };
    let blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(std::slice::from_ref(&blend));
    let d_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&d_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&input_state)
        .input_assembly_state(&assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rast_state)
        .multisample_state(&multi_state)
        .depth_stencil_state(&depth_state)
        .color_blend_state(&blend_state)
        .dynamic_state(&dynamic)
        .render_pass(render_pass)
        .subpass(0)
        .layout(layout);

    let pipeline = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    }
    .map_err(|(_, e)| vk_err("create_graphics_pipelines", e))?[0];

    unsafe {
        device.destroy_shader_module(vert, None);
        device.destroy_shader_module(frag, None);
    }
    Ok(pipeline)
}
