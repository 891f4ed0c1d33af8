//! The per-session kneeboard: one concrete compositor picked at session
//! creation, one swapchain sized for the sprite atlas, and the
//! `xrEndFrame` interception that appends quad layers to the app's frame.

use super::next::NextTable;
use crate::compositor::{placement, LayerSprite, Pose, VrQuadLayer};
use crate::error::{fatal, CompositorError, Severity};
use crate::geometry::Size;
use crate::shm::{FrameSnapshot, LazyReader};
use crate::spriting::MAX_VIEW_COUNT;
use openxr_sys as xr;

pub enum Backend {
    #[cfg(windows)]
    D3D11(crate::compositor::d3d11::Compositor),
    #[cfg(windows)]
    D3D12(crate::compositor::d3d12::Compositor),
    Vulkan(crate::compositor::vulkan::Compositor),
    #[cfg(test)]
    Fake(FakeCompositor),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(windows)]
            Self::D3D11(_) => "D3D11",
            #[cfg(windows)]
            Self::D3D12(_) => "D3D12",
            Self::Vulkan(_) => "Vulkan",
            #[cfg(test)]
            Self::Fake(_) => "Fake",
        }
    }

    fn reader(&mut self) -> &mut LazyReader {
        match self {
            #[cfg(windows)]
            Self::D3D11(c) => c.reader(),
            #[cfg(windows)]
            Self::D3D12(c) => c.reader(),
            Self::Vulkan(c) => c.reader(),
            #[cfg(test)]
            Self::Fake(c) => &mut c.reader,
        }
    }

    fn render(
        &mut self,
        image_index: usize,
        snapshot: &FrameSnapshot,
        sprites: &[LayerSprite],
    ) -> Result<(), CompositorError> {
        match self {
            #[cfg(windows)]
            Self::D3D11(c) => c.render(image_index, snapshot, sprites),
            #[cfg(windows)]
            Self::D3D12(c) => c.render(image_index, snapshot, sprites),
            Self::Vulkan(c) => c.render(image_index, snapshot, sprites),
            #[cfg(test)]
            Self::Fake(c) => {
                c.rendered.push((image_index, sprites.to_vec()));
                Ok(())
            }
        }
    }

    fn release_swapchain(&mut self) {
        match self {
            #[cfg(windows)]
            Self::D3D11(c) => c.release_swapchain(),
            #[cfg(windows)]
            Self::D3D12(c) => c.release_swapchain(),
            Self::Vulkan(c) => c.release_swapchain(),
            #[cfg(test)]
            Self::Fake(c) => c.released_swapchains += 1,
        }
    }
}

/// Records what a real backend would have drawn; used by the layer's unit
/// tests, which run without a GPU.
#[cfg(test)]
pub struct FakeCompositor {
    pub reader: LazyReader,
    pub rendered: Vec<(usize, Vec<LayerSprite>)>,
    pub released_swapchains: usize,
}

#[cfg(test)]
impl FakeCompositor {
    pub fn new(ring_name: String) -> Self {
        Self {
            reader: LazyReader::with_name(ring_name, crate::shm::ConsumerKind::OpenXrVulkan),
            rendered: Vec::new(),
            released_swapchains: 0,
        }
    }
}

struct SwapchainState {
    handle: xr::Swapchain,
    size: Size<u32>,
}

pub struct Kneeboard {
    session: xr::Session,
    pub(crate) backend: Backend,
    local_space: xr::Space,
    view_space: xr::Space,
    swapchain: Option<SwapchainState>,
    max_layer_count: u32,
    is_varjo: bool,
    /// Locally-configured quirk bits, OR-ed with the frame's.
    settings_quirks: u64,
    /// Dirty check against the snapshot's cache key: `maybe_get` hands back
    /// the same frame every poll, and static content only needs to be
    /// sprited into the swapchain once.
    rendered_cache_key: Option<u64>,
    /// Set on a session-fatal render error; the hook tears us down and goes
    /// pass-through until the next session.
    pub session_lost: bool,
}

// Session-affine; only ever driven from the app's render thread, but stored
// inside the instance map.
unsafe impl Send for Kneeboard {}

impl Kneeboard {
    pub fn new(
        next: &NextTable,
        instance: xr::Instance,
        system_id: xr::SystemId,
        session: xr::Session,
        runtime_is_varjo: bool,
        settings_quirks: u64,
        backend: Backend,
    ) -> Result<Self, xr::Result> {
        let mut system_properties = unsafe { std::mem::zeroed::<xr::SystemProperties>() };
        system_properties.ty = xr::SystemProperties::TYPE;
        check(unsafe {
            (next.get_system_properties)(instance, system_id, &mut system_properties)
        })?;
        let max_layer_count = system_properties.graphics_properties.max_layer_count;
        log::info!(
            "system supports up to {max_layer_count} composition layers, \
             suggested swapchain {}x{}",
            system_properties.graphics_properties.max_swapchain_image_width,
            system_properties.graphics_properties.max_swapchain_image_height,
        );

        let identity = xr::Posef {
            orientation: xr::Quaternionf {
                x: 0.0,
                y: 0.0,
                z: 0.0,
                w: 1.0,
            },
            position: xr::Vector3f::default(),
        };
        let mut space_info = xr::ReferenceSpaceCreateInfo {
            ty: xr::ReferenceSpaceCreateInfo::TYPE,
            next: std::ptr::null(),
            reference_space_type: xr::ReferenceSpaceType::LOCAL,
            pose_in_reference_space: identity,
        };
        let mut local_space = xr::Space::NULL;
        check(unsafe { (next.create_reference_space)(session, &space_info, &mut local_space) })?;
        space_info.reference_space_type = xr::ReferenceSpaceType::VIEW;
        let mut view_space = xr::Space::NULL;
        check(unsafe { (next.create_reference_space)(session, &space_info, &mut view_space) })?;

        if runtime_is_varjo {
            log::info!("Varjo runtime detected");
        }

        Ok(Self {
            session,
            backend,
            local_space,
            view_space,
            swapchain: None,
            max_layer_count,
            is_varjo: runtime_is_varjo,
            settings_quirks,
            rendered_cache_key: None,
            session_lost: false,
        })
    }

    pub fn session(&self) -> xr::Session {
        self.session
    }

    /// Tear down all XR-owned resources; the next chain must still be alive.
    pub fn destroy(&mut self, next: &NextTable) {
        self.backend.release_swapchain();
        if let Some(swapchain) = self.swapchain.take() {
            unsafe { (next.destroy_swapchain)(swapchain.handle) };
        }
        unsafe {
            if self.local_space != xr::Space::NULL {
                (next.destroy_space)(self.local_space);
            }
            if self.view_space != xr::Space::NULL {
                (next.destroy_space)(self.view_space);
            }
        }
    }

    fn hmd_pose(&self, next: &NextTable, display_time: xr::Time) -> Option<Pose> {
        let mut location = xr::SpaceLocation {
            ty: xr::SpaceLocation::TYPE,
            next: std::ptr::null_mut(),
            location_flags: xr::SpaceLocationFlags::EMPTY,
            pose: xr::Posef::IDENTITY,
        };
        let result = unsafe {
            (next.locate_space)(self.view_space, self.local_space, display_time, &mut location)
        };
        if result != xr::Result::SUCCESS {
            return None;
        }
        let wanted =
            xr::SpaceLocationFlags::ORIENTATION_VALID | xr::SpaceLocationFlags::POSITION_VALID;
        if !location.location_flags.contains(wanted) {
            return None;
        }
        Some(Pose::from_xr(location.pose))
    }

    fn ensure_swapchain(
        &mut self,
        next: &NextTable,
        atlas_size: Size<u32>,
    ) -> Result<xr::Swapchain, CompositorError> {
        if let Some(state) = &self.swapchain {
            if state.size == atlas_size {
                return Ok(state.handle);
            }
            log::debug!(
                "atlas changed {}x{} -> {}x{}, recreating swapchain",
                state.size.width,
                state.size.height,
                atlas_size.width,
                atlas_size.height,
            );
            self.backend.release_swapchain();
            let state = self.swapchain.take().expect("just checked");
            unsafe { (next.destroy_swapchain)(state.handle) };
            self.rendered_cache_key = None;
        }

        let handle = self.create_swapchain(next, atlas_size)?;
        self.swapchain = Some(SwapchainState {
            handle,
            size: atlas_size,
        });
        log::info!(
            "created {}x{} swapchain",
            atlas_size.width,
            atlas_size.height
        );
        Ok(handle)
    }

    fn supported_formats(&self, next: &NextTable) -> Result<Vec<i64>, CompositorError> {
        let mut count = 0;
        check(unsafe {
            (next.enumerate_swapchain_formats)(self.session, 0, &mut count, std::ptr::null_mut())
        })
        .map_err(CompositorError::SwapchainCreateFailed)?;
        let mut formats = vec![0i64; count as usize];
        check(unsafe {
            (next.enumerate_swapchain_formats)(
                self.session,
                count,
                &mut count,
                formats.as_mut_ptr(),
            )
        })
        .map_err(CompositorError::SwapchainCreateFailed)?;
        formats.truncate(count as usize);
        Ok(formats)
    }

    fn create_swapchain(
        &mut self,
        next: &NextTable,
        size: Size<u32>,
    ) -> Result<xr::Swapchain, CompositorError> {
        let supported = self.supported_formats(next)?;
        if supported.is_empty() {
            return Err(CompositorError::SwapchainCreateFailed(
                xr::Result::ERROR_RUNTIME_FAILURE,
            ));
        }

        let mut info = xr::SwapchainCreateInfo {
            ty: xr::SwapchainCreateInfo::TYPE,
            next: std::ptr::null(),
            create_flags: xr::SwapchainCreateFlags::EMPTY,
            usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
            format: 0,
            sample_count: 1,
            width: size.width,
            height: size.height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        };

        match &mut self.backend {
            #[cfg(windows)]
            Backend::D3D11(compositor) => {
                let preference = crate::compositor::d3d11::Compositor::swapchain_format_preference();
                let (texture_format, rtv_format) = preference
                    .iter()
                    .find(|(tex, _)| supported.contains(&(tex.0 as i64)))
                    .copied()
                    .unwrap_or_else(|| {
                        let format =
                            windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT(supported[0] as i32);
                        (format, format)
                    });
                info.format = texture_format.0 as i64;

                let mut handle = xr::Swapchain::NULL;
                check(unsafe { (next.create_swapchain)(self.session, &info, &mut handle) })
                    .map_err(CompositorError::SwapchainCreateFailed)?;

                let images = enumerate_images::<xr::SwapchainImageD3D11KHR>(
                    next,
                    handle,
                    xr::SwapchainImageD3D11KHR {
                        ty: xr::SwapchainImageD3D11KHR::TYPE,
                        next: std::ptr::null_mut(),
                        texture: std::ptr::null_mut(),
                    },
                )?;
                let textures = images
                    .iter()
                    .map(|image| unsafe {
                        use windows::core::Interface;
                        windows::Win32::Graphics::Direct3D11::ID3D11Texture2D::from_raw_borrowed(
                            &image.texture.cast(),
                        )
                        .expect("runtime returned a null swapchain texture")
                        .clone()
                    })
                    .collect::<Vec<_>>();
                compositor.store_swapchain_images(&textures, rtv_format, size)?;
                Ok(handle)
            }
            #[cfg(windows)]
            Backend::D3D12(compositor) => {
                let preference = crate::compositor::d3d12::Compositor::swapchain_format_preference();
                let (texture_format, rtv_format) = preference
                    .iter()
                    .find(|(tex, _)| supported.contains(&(tex.0 as i64)))
                    .copied()
                    .unwrap_or_else(|| {
                        let format =
                            windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT(supported[0] as i32);
                        (format, format)
                    });
                info.format = texture_format.0 as i64;

                let mut handle = xr::Swapchain::NULL;
                check(unsafe { (next.create_swapchain)(self.session, &info, &mut handle) })
                    .map_err(CompositorError::SwapchainCreateFailed)?;

                let images = enumerate_images::<xr::SwapchainImageD3D12KHR>(
                    next,
                    handle,
                    xr::SwapchainImageD3D12KHR {
                        ty: xr::SwapchainImageD3D12KHR::TYPE,
                        next: std::ptr::null_mut(),
                        texture: std::ptr::null_mut(),
                    },
                )?;
                let resources = images
                    .iter()
                    .map(|image| unsafe {
                        use windows::core::Interface;
                        windows::Win32::Graphics::Direct3D12::ID3D12Resource::from_raw_borrowed(
                            &image.texture.cast(),
                        )
                        .expect("runtime returned a null swapchain texture")
                        .clone()
                    })
                    .collect::<Vec<_>>();
                compositor.store_swapchain_images(resources, texture_format, rtv_format, size)?;
                Ok(handle)
            }
            #[cfg(test)]
            Backend::Fake(_) => {
                info.format = supported[0];
                let mut handle = xr::Swapchain::NULL;
                check(unsafe { (next.create_swapchain)(self.session, &info, &mut handle) })
                    .map_err(CompositorError::SwapchainCreateFailed)?;
                Ok(handle)
            }
            Backend::Vulkan(compositor) => {
                let preference =
                    crate::compositor::vulkan::Compositor::swapchain_format_preference();
                info.format = preference
                    .iter()
                    .find(|format| supported.contains(format))
                    .copied()
                    .unwrap_or_else(|| supported[0]);
                info.usage_flags |=
                    xr::SwapchainUsageFlags::TRANSFER_DST | xr::SwapchainUsageFlags::MUTABLE_FORMAT;

                let mut handle = xr::Swapchain::NULL;
                check(unsafe { (next.create_swapchain)(self.session, &info, &mut handle) })
                    .map_err(CompositorError::SwapchainCreateFailed)?;

                let images = enumerate_images::<xr::SwapchainImageVulkanKHR>(
                    next,
                    handle,
                    xr::SwapchainImageVulkanKHR {
                        ty: xr::SwapchainImageVulkanKHR::TYPE,
                        next: std::ptr::null_mut(),
                        image: 0,
                    },
                )?;
                let raw: Vec<u64> = images.iter().map(|image| image.image).collect();
                compositor.store_swapchain_images(&raw, info.format, size)?;
                Ok(handle)
            }
        }
    }

    /// The hook body. Delegates the app's call unchanged on any transient
    /// problem; only a new-swapchain failure is fatal, because at that point
    /// nothing can bring the overlay back.
    pub fn end_frame(
        &mut self,
        next: &NextTable,
        session: xr::Session,
        frame_end_info: *const xr::FrameEndInfo,
    ) -> xr::Result {
        let passthrough = |info: *const xr::FrameEndInfo| unsafe { (next.end_frame)(session, info) };

        let info = unsafe { &*frame_end_info };
        if info.layer_count == 0 {
            return passthrough(frame_end_info);
        }

        let Some(snapshot) = self.backend.reader().maybe_get() else {
            return passthrough(frame_end_info);
        };
        if snapshot.layers().is_empty() {
            return passthrough(frame_end_info);
        }

        let upscale =
            placement::should_upscale(snapshot.quirks() | self.settings_quirks, self.is_varjo);
        let hmd_pose = self.hmd_pose(next, info.display_time);
        let (mut quads, atlas_size) = placement::build_vr_layers(&snapshot, hmd_pose, upscale);
        if quads.is_empty() || atlas_size.is_empty() {
            return passthrough(frame_end_info);
        }

        // Never exceed the runtime's composition layer budget; the app's own
        // layers take priority.
        let room = self
            .max_layer_count
            .saturating_sub(info.layer_count)
            .min(MAX_VIEW_COUNT as u32) as usize;
        if room == 0 {
            return passthrough(frame_end_info);
        }
        quads.truncate(room);

        let swapchain = match self.ensure_swapchain(next, atlas_size) {
            Ok(swapchain) => swapchain,
            // No safe fallback once the hook is installed: abort with the
            // diagnostic rather than limp along with no way to ever recover.
            Err(e) => fatal(&format!("swapchain creation failed: {e}")),
        };

        if self.rendered_cache_key != Some(snapshot.cache_key()) {
            match self.render_into_swapchain(next, swapchain, &snapshot, &quads) {
                Ok(()) => self.rendered_cache_key = Some(snapshot.cache_key()),
                Err(e) => match e.severity() {
                    Severity::Transient => {
                        log::debug!("dropping overlay for one frame: {e}");
                        return passthrough(frame_end_info);
                    }
                    Severity::SessionFatal => {
                        log::error!("compositor session lost: {e}");
                        self.session_lost = true;
                        return passthrough(frame_end_info);
                    }
                    Severity::ProcessFatal => fatal(&e.to_string()),
                },
            }
        }

        // The layer carrying the global input focus goes last so the runtime
        // draws it on top; first match wins when ids collide.
        let mut top_most = quads.len() - 1;
        for (index, quad) in quads.iter().enumerate() {
            if quad.layer_id == snapshot.global_input_layer_id() {
                top_most = index;
                break;
            }
        }

        let mut quad_layers: Vec<xr::CompositionLayerQuad> = quads
            .iter()
            .map(|quad| self.quad_layer(swapchain, quad))
            .collect();
        if top_most != quad_layers.len() - 1 {
            let last = quad_layers.len() - 1;
            quad_layers.swap(top_most, last);
        }

        let mut layers: Vec<*const xr::CompositionLayerBaseHeader> = Vec::new();
        let app_layers =
            unsafe { std::slice::from_raw_parts(info.layers, info.layer_count as usize) };
        layers.extend_from_slice(app_layers);
        layers.extend(
            quad_layers
                .iter()
                .map(|quad| quad as *const _ as *const xr::CompositionLayerBaseHeader),
        );

        let next_info = xr::FrameEndInfo {
            ty: xr::FrameEndInfo::TYPE,
            next: info.next,
            display_time: info.display_time,
            environment_blend_mode: info.environment_blend_mode,
            layer_count: layers.len() as u32,
            layers: layers.as_ptr(),
        };
        let result = unsafe { (next.end_frame)(session, &next_info) };
        if result.into_raw() < 0 {
            log::debug!("next xrEndFrame failed: {result:?}");
        }
        result
    }

    fn render_into_swapchain(
        &mut self,
        next: &NextTable,
        swapchain: xr::Swapchain,
        snapshot: &FrameSnapshot,
        quads: &[VrQuadLayer],
    ) -> Result<(), CompositorError> {
        let mut image_index = 0;
        let acquire_info = xr::SwapchainImageAcquireInfo {
            ty: xr::SwapchainImageAcquireInfo::TYPE,
            next: std::ptr::null(),
        };
        check(unsafe { (next.acquire_swapchain_image)(swapchain, &acquire_info, &mut image_index) })
            .map_err(CompositorError::SwapchainImageUnavailable)?;

        let wait_info = xr::SwapchainImageWaitInfo {
            ty: xr::SwapchainImageWaitInfo::TYPE,
            next: std::ptr::null(),
            timeout: xr::Duration::from_nanos(i64::MAX),
        };
        check(unsafe { (next.wait_swapchain_image)(swapchain, &wait_info) })
            .map_err(CompositorError::SwapchainImageUnavailable)?;

        let sprites: Vec<LayerSprite> = quads.iter().map(|quad| quad.sprite).collect();
        let render_result = self.backend.render(image_index as usize, snapshot, &sprites);

        let release_info = xr::SwapchainImageReleaseInfo {
            ty: xr::SwapchainImageReleaseInfo::TYPE,
            next: std::ptr::null(),
        };
        let release_result = check(unsafe {
            (next.release_swapchain_image)(swapchain, &release_info)
        })
        .map_err(CompositorError::SwapchainImageUnavailable);

        render_result.and(release_result)
    }

    fn quad_layer(&self, swapchain: xr::Swapchain, quad: &VrQuadLayer) -> xr::CompositionLayerQuad {
        // The shared texture is premultiplied, which is exactly what
        // BLEND_TEXTURE_SOURCE_ALPHA expects of the composited output.
        xr::CompositionLayerQuad {
            ty: xr::CompositionLayerQuad::TYPE,
            next: std::ptr::null(),
            layer_flags: xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
            space: self.local_space,
            eye_visibility: xr::EyeVisibility::BOTH,
            sub_image: xr::SwapchainSubImage {
                swapchain,
                image_rect: xr::Rect2Di {
                    offset: xr::Offset2Di {
                        x: quad.sprite.dest_rect.left() as i32,
                        y: quad.sprite.dest_rect.top() as i32,
                    },
                    extent: xr::Extent2Di {
                        width: quad.sprite.dest_rect.size.width as i32,
                        height: quad.sprite.dest_rect.size.height as i32,
                    },
                },
                image_array_index: 0,
            },
            pose: quad.pose.to_xr(),
            size: xr::Extent2Df {
                width: quad.size_metres[0],
                height: quad.size_metres[1],
            },
        }
    }
}

fn check(result: xr::Result) -> Result<(), xr::Result> {
    if result.into_raw() < 0 {
        return Err(result);
    }
    Ok(())
}

fn enumerate_images<T: Copy>(
    next: &NextTable,
    swapchain: xr::Swapchain,
    template: T,
) -> Result<Vec<T>, CompositorError> {
    let mut count = 0;
    check(unsafe {
        (next.enumerate_swapchain_images)(swapchain, 0, &mut count, std::ptr::null_mut())
    })
    .map_err(CompositorError::SwapchainCreateFailed)?;
    let mut images = vec![template; count as usize];
    check(unsafe {
        (next.enumerate_swapchain_images)(
            swapchain,
            count,
            &mut count,
            images.as_mut_ptr().cast::<xr::SwapchainImageBaseHeader>(),
        )
    })
    .map_err(CompositorError::SwapchainCreateFailed)?;
    images.truncate(count as usize);
    Ok(images)
}
