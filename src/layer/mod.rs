//! The OpenXR API layer: loader negotiation, per-instance dispatch, and the
//! hooked entry points. Installed as an implicit layer named
//! `XR_APILAYER_FREDEMMOTT_OpenKneeboard`.

pub mod end_frame;
pub mod instance;
pub mod loader;
pub mod next;
pub mod vulkan_hooks;

use end_frame::{Backend, Kneeboard};
use instance::{InstanceState, VulkanXrState};
use next::NextTable;
use openxr_sys as xr;
use std::ffi::{c_char, CStr};
use std::sync::{Arc, Mutex};

pub const API_LAYER_NAME: &CStr = c"XR_APILAYER_FREDEMMOTT_OpenKneeboard";
pub const API_LAYER_DESCRIPTION: &CStr = c"In-game kneeboard overlay";
pub const API_LAYER_IMPLEMENTATION_VERSION: u32 = 1;

const _: () = {
    assert!(API_LAYER_NAME.count_bytes() < xr::MAX_API_LAYER_NAME_SIZE);
    assert!(API_LAYER_DESCRIPTION.count_bytes() < xr::MAX_API_LAYER_DESCRIPTION_SIZE);
};

/// The loader's entry point into this layer.
///
/// # Safety
/// Called by the OpenXR loader with valid negotiation structs.
#[no_mangle]
pub unsafe extern "system" fn OpenKneeboard_xrNegotiateLoaderApiLayerInterface(
    loader_info: *const loader::NegotiateLoaderInfo,
    layer_name: *const c_char,
    api_layer_request: *mut loader::NegotiateApiLayerRequest,
) -> xr::Result {
    crate::init_logging();

    if !layer_name.is_null() {
        let name = unsafe { CStr::from_ptr(layer_name) };
        if name != API_LAYER_NAME {
            log::warn!("layer name mismatch: {name:?}");
            return xr::Result::ERROR_INITIALIZATION_FAILED;
        }
    }
    if loader_info.is_null() || api_layer_request.is_null() {
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    }
    let info = unsafe { &*loader_info };
    if info.struct_type != loader::LoaderInterfaceStructType::LOADER_INFO
        || info.min_interface_version > loader::CURRENT_LOADER_API_LAYER_VERSION
        || info.max_interface_version < loader::CURRENT_LOADER_API_LAYER_VERSION
    {
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    }

    let request = unsafe { &mut *api_layer_request };
    request.layer_interface_version = loader::CURRENT_LOADER_API_LAYER_VERSION;
    request.layer_api_version = xr::CURRENT_API_VERSION;
    request.get_instance_proc_addr = Some(xr_get_instance_proc_addr);
    request.create_api_layer_instance = Some(xr_create_api_layer_instance);
    log::info!("negotiated loader interface");
    xr::Result::SUCCESS
}

/// # Safety
/// Loader-invoked with valid create infos.
pub unsafe extern "system" fn xr_create_api_layer_instance(
    create_info: *const xr::InstanceCreateInfo,
    layer_info: *const loader::ApiLayerCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result {
    crate::init_logging();
    let Some(layer_info) = (unsafe { layer_info.as_ref() }) else {
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(next_info) = (unsafe { layer_info.next_info.as_ref() }) else {
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    };
    let info = unsafe { &*create_info };

    // Pop ourselves off the chain before forwarding.
    let mut next_layer_info = loader::ApiLayerCreateInfo {
        struct_type: layer_info.struct_type,
        struct_version: layer_info.struct_version,
        struct_size: layer_info.struct_size,
        loader_instance: layer_info.loader_instance,
        settings_file_location: layer_info.settings_file_location,
        next_info: next_info.next,
    };
    let result = unsafe {
        (next_info.next_create_api_layer_instance)(create_info, &mut next_layer_info, instance)
    };
    if result.into_raw() < 0 {
        log::warn!("next xrCreateApiLayerInstance failed: {result:?}");
        return result;
    }
    let handle = unsafe { *instance };

    let mut have_vulkan_enable2 = false;
    let extensions: &[*const c_char] = if info.enabled_extension_count == 0 {
        &[]
    } else {
        unsafe {
            std::slice::from_raw_parts(
                info.enabled_extension_names,
                info.enabled_extension_count as usize,
            )
        }
    };
    for &extension in extensions {
        let name = unsafe { CStr::from_ptr(extension) };
        log::debug!("application enabled extension: {name:?}");
        if name.to_bytes() == xr::KHR_VULKAN_ENABLE2_EXTENSION_NAME {
            have_vulkan_enable2 = true;
        }
    }

    let next = match NextTable::load(handle, next_info.next_get_instance_proc_addr) {
        Ok(next) => next,
        Err(e) => {
            log::error!("failed to load next dispatch table: {e:?}");
            return e;
        }
    };

    instance::register_instance(Arc::new(InstanceState {
        handle,
        next,
        have_vulkan_enable2,
        vulkan_state: Mutex::new(VulkanXrState::default()),
        settings: crate::settings::Settings::load(),
        kneeboard: Mutex::new(None),
    }));

    log::info!("created API layer instance");
    xr::Result::SUCCESS
}

/// # Safety
/// `name` must be a valid C string; standard OpenXR contract.
pub unsafe extern "system" fn xr_get_instance_proc_addr(
    instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<xr::pfn::VoidFunction>,
) -> xr::Result {
    let name = unsafe { CStr::from_ptr(name) };

    macro_rules! hook {
        ($func:expr, $pfn:ident) => {{
            unsafe {
                *function = Some(std::mem::transmute($func as xr::pfn::$pfn));
            }
            return xr::Result::SUCCESS;
        }};
    }

    match name.to_bytes() {
        b"xrCreateSession" => hook!(xr_create_session, CreateSession),
        b"xrDestroySession" => hook!(xr_destroy_session, DestroySession),
        b"xrDestroyInstance" => hook!(xr_destroy_instance, DestroyInstance),
        b"xrEndFrame" => hook!(xr_end_frame, EndFrame),
        b"xrEnumerateApiLayerProperties" => {
            hook!(xr_enumerate_api_layer_properties, EnumerateApiLayerProperties)
        }
        b"xrEnumerateInstanceExtensionProperties" => {
            hook!(
                xr_enumerate_instance_extension_properties,
                EnumerateInstanceExtensionProperties
            )
        }
        b"xrCreateVulkanInstanceKHR" | b"xrCreateVulkanDeviceKHR" => {
            let enabled = instance::for_instance(instance)
                .map(|state| state.have_vulkan_enable2)
                .unwrap_or(false);
            if !enabled {
                return xr::Result::ERROR_FUNCTION_UNSUPPORTED;
            }
            if name.to_bytes() == b"xrCreateVulkanInstanceKHR" {
                hook!(
                    vulkan_hooks::xr_create_vulkan_instance,
                    CreateVulkanInstanceKHR
                )
            } else {
                hook!(
                    vulkan_hooks::xr_create_vulkan_device,
                    CreateVulkanDeviceKHR
                )
            }
        }
        _ => {}
    }

    if let Some(state) = instance::for_instance(instance) {
        return unsafe { (state.next.get_instance_proc_addr)(instance, name.as_ptr(), function) };
    }
    if let Some(state) = instance::any_instance() {
        return unsafe { (state.next.get_instance_proc_addr)(instance, name.as_ptr(), function) };
    }

    log::debug!("unsupported call {name:?} with no next in chain");
    xr::Result::ERROR_FUNCTION_UNSUPPORTED
}

extern "system" fn xr_enumerate_api_layer_properties(
    property_capacity_input: u32,
    property_count_output: *mut u32,
    properties: *mut xr::ApiLayerProperties,
) -> xr::Result {
    // Per the loader spec we only report ourselves.
    unsafe { *property_count_output = 1 };
    if property_capacity_input == 0 {
        return xr::Result::SUCCESS;
    }

    let out = unsafe { &mut *properties };
    if out.ty != xr::ApiLayerProperties::TYPE {
        return xr::Result::ERROR_VALIDATION_FAILURE;
    }
    write_c_string(&mut out.layer_name, API_LAYER_NAME);
    out.spec_version = xr::CURRENT_API_VERSION;
    out.layer_version = API_LAYER_IMPLEMENTATION_VERSION;
    write_c_string(&mut out.description, API_LAYER_DESCRIPTION);
    xr::Result::SUCCESS
}

extern "system" fn xr_enumerate_instance_extension_properties(
    layer_name: *const c_char,
    property_capacity_input: u32,
    property_count_output: *mut u32,
    properties: *mut xr::ExtensionProperties,
) -> xr::Result {
    if !layer_name.is_null() && unsafe { CStr::from_ptr(layer_name) } == API_LAYER_NAME {
        // We implement no instance extensions of our own.
        unsafe { *property_count_output = 0 };
        return xr::Result::SUCCESS;
    }

    if let Some(state) = instance::any_instance() {
        return unsafe {
            let mut function = None;
            let result = (state.next.get_instance_proc_addr)(
                state.handle,
                c"xrEnumerateInstanceExtensionProperties".as_ptr(),
                &mut function,
            );
            if result.into_raw() < 0 {
                return result;
            }
            match function {
                Some(f) => {
                    let f = std::mem::transmute::<
                        xr::pfn::VoidFunction,
                        xr::pfn::EnumerateInstanceExtensionProperties,
                    >(f);
                    f(
                        layer_name,
                        property_capacity_input,
                        property_count_output,
                        properties,
                    )
                }
                None => xr::Result::ERROR_FUNCTION_UNSUPPORTED,
            }
        };
    }

    if !layer_name.is_null() {
        // Not us, and nothing below us to answer for it.
        return xr::Result::ERROR_API_LAYER_NOT_PRESENT;
    }
    unsafe { *property_count_output = 0 };
    xr::Result::SUCCESS
}

extern "system" fn xr_create_session(
    instance: xr::Instance,
    create_info: *const xr::SessionCreateInfo,
    session: *mut xr::Session,
) -> xr::Result {
    let Some(state) = instance::for_instance(instance) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    let info = unsafe { &*create_info };

    let mut instance_properties = xr::InstanceProperties {
        ty: xr::InstanceProperties::TYPE,
        next: std::ptr::null_mut(),
        runtime_version: xr::Version::from_raw(0),
        runtime_name: [0; xr::MAX_RUNTIME_NAME_SIZE],
    };
    unsafe { (state.next.get_instance_properties)(instance, &mut instance_properties) };
    let runtime = instance::RuntimeId {
        version: instance_properties.runtime_version,
        name: instance_properties.runtime_name.map(|c| c as u8),
    };
    log::info!(
        "OpenXR runtime: '{}' v{:#x}",
        runtime.name_str(),
        runtime.version.into_raw()
    );

    let result = unsafe { (state.next.create_session)(instance, create_info, session) };
    if result.into_raw() < 0 {
        log::warn!("next xrCreateSession failed: {result:?}");
        return result;
    }
    let session_handle = unsafe { *session };
    instance::register_session(session_handle, instance);

    let mut kneeboard_slot = state.kneeboard.lock().unwrap();
    if kneeboard_slot.is_some() {
        log::warn!("already have a kneeboard, refusing to initialize twice");
        return xr::Result::ERROR_LIMIT_REACHED;
    }

    let Some(backend) = sniff_graphics_binding(&state, info.next.cast()) else {
        log::info!("unsupported or missing graphics binding; passing through");
        return result;
    };
    log::info!("session uses the {} backend", backend.name());

    match Kneeboard::new(
        &state.next,
        instance,
        info.system_id,
        session_handle,
        runtime.is_varjo(),
        state.settings.quirks.to_wire(),
        backend,
    ) {
        Ok(kneeboard) => *kneeboard_slot = Some(kneeboard),
        Err(e) => log::error!("kneeboard initialisation failed: {e:?}"),
    }
    result
}

/// Identify the session's graphics API from its `next` chain and stand up
/// the matching compositor. Returns `None` to pass the session through
/// untouched.
fn sniff_graphics_binding(
    state: &InstanceState,
    mut chain: *const xr::BaseInStructure,
) -> Option<Backend> {
    while !chain.is_null() {
        let base = unsafe { &*chain };
        match base.ty {
            #[cfg(windows)]
            xr::StructureType::GRAPHICS_BINDING_D3D11_KHR => {
                let binding = unsafe { &*chain.cast::<xr::GraphicsBindingD3D11KHR>() };
                if binding.device.is_null() {
                    return None;
                }
                return build_d3d11(binding);
            }
            #[cfg(windows)]
            xr::StructureType::GRAPHICS_BINDING_D3D12_KHR => {
                let binding = unsafe { &*chain.cast::<xr::GraphicsBindingD3D12KHR>() };
                if binding.device.is_null() || binding.queue.is_null() {
                    return None;
                }
                return build_d3d12(binding);
            }
            xr::StructureType::GRAPHICS_BINDING_VULKAN_KHR => {
                let binding = unsafe { &*chain.cast::<xr::GraphicsBindingVulkanKHR>() };
                return build_vulkan(state, binding);
            }
            _ => {}
        }
        chain = base.next;
    }
    log::info!("no graphics binding in session create chain");
    None
}

#[cfg(windows)]
fn build_d3d11(binding: &xr::GraphicsBindingD3D11KHR) -> Option<Backend> {
    use windows::core::Interface;
    use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Device1};

    let device = unsafe { ID3D11Device::from_raw_borrowed(&binding.device.cast()) }?;
    let device1 = device.cast::<ID3D11Device1>().ok()?;
    match crate::compositor::d3d11::Compositor::new(&device1) {
        Ok(compositor) => Some(Backend::D3D11(compositor)),
        Err(e) => {
            log::error!("D3D11 compositor init failed: {e}");
            None
        }
    }
}

#[cfg(windows)]
fn build_d3d12(binding: &xr::GraphicsBindingD3D12KHR) -> Option<Backend> {
    use windows::Win32::Graphics::Direct3D12::{ID3D12CommandQueue, ID3D12Device};

    let device = unsafe { ID3D12Device::from_raw_borrowed(&binding.device.cast()) }?;
    let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&binding.queue.cast()) }?;
    match crate::compositor::d3d12::Compositor::new(device, queue) {
        Ok(compositor) => Some(Backend::D3D12(compositor)),
        Err(e) => {
            log::error!("D3D12 compositor init failed: {e}");
            None
        }
    }
}

fn build_vulkan(state: &InstanceState, binding: &xr::GraphicsBindingVulkanKHR) -> Option<Backend> {
    match *state.vulkan_state.lock().unwrap() {
        VulkanXrState::NoVkEnable2 => {
            log::warn!(
                "got a Vulkan graphics binding, but the XR_KHR_vulkan_enable2 \
                 creation functions were not used; unsupported"
            );
            return None;
        }
        VulkanXrState::VkEnable2Instance => {
            log::warn!(
                "XR_KHR_vulkan_enable2 was used for instance creation but not \
                 device creation; unsupported"
            );
            return None;
        }
        VulkanXrState::VkEnable2InstanceAndDevice => {}
    }
    if (binding.device as u64) == 0 {
        log::info!("found Vulkan, but no device");
        return None;
    }
    match unsafe {
        crate::compositor::vulkan::Compositor::new(
            binding.instance as u64,
            binding.physical_device as u64,
            binding.device as u64,
            binding.queue_family_index,
            binding.queue_index,
        )
    } {
        Ok(compositor) => Some(Backend::Vulkan(compositor)),
        Err(e) => {
            log::error!("Vulkan compositor init failed: {e}");
            None
        }
    }
}

extern "system" fn xr_destroy_session(session: xr::Session) -> xr::Result {
    if let Some(state) = instance::for_session(session) {
        let mut slot = state.kneeboard.lock().unwrap();
        if let Some(kneeboard) = slot.as_mut() {
            if kneeboard.session() == session {
                kneeboard.destroy(&state.next);
                *slot = None;
            }
        }
        instance::unregister_session(session);
        return unsafe { (state.next.destroy_session)(session) };
    }
    xr::Result::ERROR_HANDLE_INVALID
}

extern "system" fn xr_destroy_instance(instance: xr::Instance) -> xr::Result {
    if let Some(state) = instance::unregister_instance(instance) {
        let mut slot = state.kneeboard.lock().unwrap();
        if let Some(kneeboard) = slot.as_mut() {
            kneeboard.destroy(&state.next);
        }
        *slot = None;
        drop(slot);
        return unsafe { (state.next.destroy_instance)(instance) };
    }
    xr::Result::ERROR_HANDLE_INVALID
}

extern "system" fn xr_end_frame(
    session: xr::Session,
    frame_end_info: *const xr::FrameEndInfo,
) -> xr::Result {
    let Some(state) = instance::for_session(session) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    let mut slot = state.kneeboard.lock().unwrap();
    match slot.as_mut() {
        Some(kneeboard) if kneeboard.session() == session => {
            let result = kneeboard.end_frame(&state.next, session, frame_end_info);
            if kneeboard.session_lost {
                kneeboard.destroy(&state.next);
                *slot = None;
            }
            result
        }
        _ => unsafe { (state.next.end_frame)(session, frame_end_info) },
    }
}

fn write_c_string<const N: usize>(dest: &mut [c_char; N], value: &CStr) {
    let bytes = value.to_bytes_with_nul();
    dest.fill(0);
    for (d, s) in dest.iter_mut().zip(bytes) {
        *d = *s as c_char;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Rect, Size};
    use crate::shm::writer::{FrameLayout, LayerConfig, Writer};
    use crate::shm::VrLayout;
    use end_frame::FakeCompositor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_ring_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        #[cfg(unix)]
        return format!("/okb-layer-{tag}-{}-{n}", std::process::id());
        #[cfg(windows)]
        return format!("Local\\okb-layer-{tag}-{}-{n}", std::process::id());
    }

    fn fake_runtime_instance() -> xr::Instance {
        unsafe {
            let mut function = None;
            fakexr::get_instance_proc_addr(
                xr::Instance::NULL,
                c"xrCreateInstance".as_ptr(),
                &mut function,
            );
            let create: xr::pfn::CreateInstance = std::mem::transmute(function.unwrap());
            let info = std::mem::zeroed::<xr::InstanceCreateInfo>();
            let mut instance = xr::Instance::NULL;
            assert_eq!(create(&info, &mut instance), xr::Result::SUCCESS);
            instance
        }
    }

    fn fake_runtime_session(instance: xr::Instance) -> xr::Session {
        unsafe {
            let mut function = None;
            fakexr::get_instance_proc_addr(
                instance,
                c"xrCreateSession".as_ptr(),
                &mut function,
            );
            let create: xr::pfn::CreateSession = std::mem::transmute(function.unwrap());
            let info = std::mem::zeroed::<xr::SessionCreateInfo>();
            let mut session = xr::Session::NULL;
            assert_eq!(create(instance, &info, &mut session), xr::Result::SUCCESS);
            session
        }
    }

    struct Fixture {
        session: xr::Session,
        next: NextTable,
        kneeboard: Kneeboard,
        writer: Option<Writer>,
    }

    impl Fixture {
        fn new(tag: &str, max_layers: u32, varjo: bool, with_producer: bool) -> Self {
            let instance = fake_runtime_instance();
            fakexr::set_max_layer_count(instance, max_layers);
            let next = NextTable::load(
                instance,
                fakexr::get_instance_proc_addr as xr::pfn::GetInstanceProcAddr,
            )
            .unwrap();
            let session = fake_runtime_session(instance);

            let ring = unique_ring_name(tag);
            let writer = with_producer.then(|| Writer::create_with_name(&ring, 4).unwrap());
            let backend = Backend::Fake(FakeCompositor::new(ring));
            let kneeboard = Kneeboard::new(
                &next,
                instance,
                xr::SystemId::from_raw(1),
                session,
                varjo,
                0,
                backend,
            )
            .unwrap();

            Self {
                session,
                next,
                kneeboard,
                writer,
            }
        }

        fn publish(&mut self, layer_rects: &[Rect<u32>], global_input_layer_id: u64) {
            let texture_width: u32 = layer_rects.iter().map(|r| r.right()).max().unwrap();
            let texture_height: u32 = layer_rects.iter().map(|r| r.bottom()).max().unwrap();
            let layers = layer_rects
                .iter()
                .enumerate()
                .map(|(index, rect)| LayerConfig {
                    layer_id: index as u64 + 1,
                    location_on_texture: *rect,
                    vr: VrLayout {
                        size_metres: [0.25, 0.25],
                        opacity: 1.0,
                        position: [0.0, 0.0, -1.0],
                        ..Default::default()
                    },
                    vr_enabled: true,
                    ..Default::default()
                })
                .collect();
            let writer = self.writer.as_mut().expect("fixture has a producer");
            let mut guard = writer.begin_frame().unwrap();
            guard
                .set_layers(&FrameLayout {
                    texture_handle: 0xbeef,
                    fence_handle: 0xcafe,
                    fence_value: 1,
                    texture_size: Size::new(texture_width, texture_height),
                    global_input_layer_id,
                    tint: [1.0; 4],
                    layers,
                    ..Default::default()
                })
                .unwrap();
            guard.commit().unwrap();
        }

        fn end_frame(&mut self, app_layer_count: usize) -> xr::Result {
            let app_layers: Vec<xr::CompositionLayerBaseHeader> = (0..app_layer_count)
                .map(|_| xr::CompositionLayerBaseHeader {
                    ty: xr::StructureType::COMPOSITION_LAYER_PROJECTION,
                    next: std::ptr::null(),
                    layer_flags: xr::CompositionLayerFlags::EMPTY,
                    space: xr::Space::NULL,
                })
                .collect();
            let pointers: Vec<*const xr::CompositionLayerBaseHeader> =
                app_layers.iter().map(|layer| layer as *const _).collect();
            let info = xr::FrameEndInfo {
                ty: xr::FrameEndInfo::TYPE,
                next: std::ptr::null(),
                display_time: xr::Time::from_nanos(1),
                environment_blend_mode: xr::EnvironmentBlendMode::OPAQUE,
                layer_count: pointers.len() as u32,
                layers: pointers.as_ptr(),
            };
            self.kneeboard.end_frame(&self.next, self.session, &info)
        }

        fn fake(&mut self) -> &mut FakeCompositor {
            match &mut self.kneeboard.backend {
                Backend::Fake(fake) => fake,
                _ => unreachable!(),
            }
        }
    }

    fn quad_layers(recorded: &[fakexr::RecordedLayer]) -> Vec<fakexr::RecordedQuad> {
        recorded.iter().filter_map(|layer| layer.quad).collect()
    }

    #[test]
    fn passthrough_without_producer() {
        let mut f = Fixture::new("noprod", 16, false, false);
        assert_eq!(f.end_frame(2), xr::Result::SUCCESS);

        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(quad_layers(&recorded).is_empty());
        assert!(f.fake().rendered.is_empty());
    }

    #[test]
    fn overlay_layers_appended_with_topmost_last() {
        let mut f = Fixture::new("append", 16, false, true);
        let rects: Vec<Rect<u32>> = (0..4)
            .map(|i| Rect::new(Point::new(i * 256, 0), Size::new(256, 256)))
            .collect();
        // Global input focus on layer id 2 (index 1).
        f.publish(&rects, 2);

        assert_eq!(f.end_frame(2), xr::Result::SUCCESS);
        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        assert_eq!(recorded.len(), 6);
        assert!(recorded[..2]
            .iter()
            .all(|layer| layer.ty == xr::StructureType::COMPOSITION_LAYER_PROJECTION));

        let quads = quad_layers(&recorded);
        assert_eq!(quads.len(), 4);
        // Atlas cells are 256 wide; the focused layer (cell 1) got swapped to
        // the end of the list so the runtime renders it on top.
        assert_eq!(quads.last().unwrap().image_rect.offset.x, 256);

        let rendered = &f.fake().rendered;
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].1.len(), 4);
    }

    #[test]
    fn runtime_layer_cap_is_respected() {
        // Runtime allows 3 layers total; the app already submits 2.
        let mut f = Fixture::new("cap", 3, false, true);
        let rects: Vec<Rect<u32>> = (0..4)
            .map(|i| Rect::new(Point::new(i * 128, 0), Size::new(128, 128)))
            .collect();
        f.publish(&rects, 1);

        assert_eq!(f.end_frame(2), xr::Result::SUCCESS);
        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        assert_eq!(recorded.len(), 3);

        let quads = quad_layers(&recorded);
        assert_eq!(quads.len(), 1);
        // The surviving overlay layer is the focused one, still last.
        assert_eq!(quads[0].image_rect.offset.x, 0);
        assert!(recorded.last().unwrap().quad.is_some());
    }

    #[test]
    fn app_at_layer_limit_passes_through() {
        let mut f = Fixture::new("full", 2, false, true);
        f.publish(&[Rect::new(Point::new(0, 0), Size::new(64, 64))], 1);

        assert_eq!(f.end_frame(2), xr::Result::SUCCESS);
        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(quad_layers(&recorded).is_empty());
    }

    #[test]
    fn varjo_upscales_dest_rect_only() {
        let mut f = Fixture::new("varjo", 16, true, true);
        let source = Rect::new(Point::new(0, 0), Size::new(512, 512));
        f.publish(&[source], 1);

        assert_eq!(f.end_frame(1), xr::Result::SUCCESS);
        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        let quads = quad_layers(&recorded);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].image_rect.extent.width, 2048);
        assert_eq!(quads[0].image_rect.extent.height, 2048);

        let rendered = f.fake().rendered.clone();
        assert_eq!(rendered[0].1[0].source_rect, source);
        assert_eq!(rendered[0].1[0].dest_rect.size, Size::new(2048, 2048));
    }

    #[test]
    fn swapchain_recreated_when_atlas_grows() {
        let mut f = Fixture::new("atlas", 16, false, true);
        let cell = Size::new(333, 333);
        f.publish(&[Rect::new(Point::new(0, 0), cell)], 1);
        assert_eq!(f.end_frame(1), xr::Result::SUCCESS);

        f.publish(
            &[
                Rect::new(Point::new(0, 0), cell),
                Rect::new(Point::new(333, 0), cell),
            ],
            1,
        );
        assert_eq!(f.end_frame(1), xr::Result::SUCCESS);

        assert_eq!(f.fake().released_swapchains, 1);
        let log = fakexr::swapchain_log();
        let small = log.iter().find(|desc| desc.width == 333).unwrap();
        let grown = log.iter().find(|desc| desc.width == 666).unwrap();
        assert!(!small.alive);
        assert!(grown.alive);
    }

    #[test]
    fn overlay_persists_without_new_producer_frames() {
        let mut f = Fixture::new("persist", 16, false, true);
        f.publish(&[Rect::new(Point::new(0, 0), Size::new(64, 64))], 1);

        assert_eq!(f.end_frame(1), xr::Result::SUCCESS);
        assert_eq!(f.end_frame(1), xr::Result::SUCCESS);
        assert_eq!(fakexr::frame_count(f.session), 2);

        let recorded = fakexr::last_frame_layers(f.session).unwrap();
        assert_eq!(quad_layers(&recorded).len(), 1);
        // Static content renders into the swapchain exactly once.
        assert_eq!(f.fake().rendered.len(), 1);
    }

    unsafe extern "system" fn forward_create_instance(
        create_info: *const xr::InstanceCreateInfo,
        _layer_info: *const loader::ApiLayerCreateInfo,
        instance: *mut xr::Instance,
    ) -> xr::Result {
        let mut function = None;
        fakexr::get_instance_proc_addr(
            xr::Instance::NULL,
            c"xrCreateInstance".as_ptr(),
            &mut function,
        );
        let create: xr::pfn::CreateInstance =
            unsafe { std::mem::transmute(function.unwrap()) };
        unsafe { create(create_info, instance) }
    }

    #[test]
    fn loader_chain_creates_and_dispatches() {
        let mut next_info = loader::ApiLayerNextInfo {
            struct_type: loader::LoaderInterfaceStructType::API_LAYER_NEXT_INFO,
            struct_version: 1,
            struct_size: std::mem::size_of::<loader::ApiLayerNextInfo>(),
            layer_name: [0; xr::MAX_API_LAYER_NAME_SIZE],
            next_get_instance_proc_addr: fakexr::get_instance_proc_addr
                as xr::pfn::GetInstanceProcAddr,
            next_create_api_layer_instance: forward_create_instance,
            next: std::ptr::null_mut(),
        };
        let layer_info = loader::ApiLayerCreateInfo {
            struct_type: loader::LoaderInterfaceStructType::API_LAYER_CREATE_INFO,
            struct_version: 1,
            struct_size: std::mem::size_of::<loader::ApiLayerCreateInfo>(),
            loader_instance: std::ptr::null_mut(),
            settings_file_location: [0; loader::API_LAYER_MAX_SETTINGS_PATH_SIZE],
            next_info: &mut next_info,
        };
        let create_info = unsafe { std::mem::zeroed::<xr::InstanceCreateInfo>() };
        let mut handle = xr::Instance::NULL;
        let result = unsafe {
            xr_create_api_layer_instance(&create_info, &layer_info, &mut handle)
        };
        assert_eq!(result, xr::Result::SUCCESS);

        let state = instance::for_instance(handle).expect("instance registered");
        assert!(!state.have_vulkan_enable2);

        // Hooked functions resolve to us; enable2 hooks stay hidden.
        let mut function = None;
        let result =
            unsafe { xr_get_instance_proc_addr(handle, c"xrEndFrame".as_ptr(), &mut function) };
        assert_eq!(result, xr::Result::SUCCESS);
        assert!(function.is_some());

        let mut function = None;
        let result = unsafe {
            xr_get_instance_proc_addr(handle, c"xrCreateVulkanInstanceKHR".as_ptr(), &mut function)
        };
        assert_eq!(result, xr::Result::ERROR_FUNCTION_UNSUPPORTED);

        assert_eq!(xr_destroy_instance(handle), xr::Result::SUCCESS);
        assert!(instance::for_instance(handle).is_none());
    }

    #[test]
    fn negotiation_fills_the_request() {
        let loader_info = loader::NegotiateLoaderInfo {
            struct_type: loader::LoaderInterfaceStructType::LOADER_INFO,
            struct_version: 1,
            struct_size: std::mem::size_of::<loader::NegotiateLoaderInfo>(),
            min_interface_version: 1,
            max_interface_version: 1,
            min_api_version: xr::Version::new(1, 0, 0),
            max_api_version: xr::CURRENT_API_VERSION,
        };
        let mut request = loader::NegotiateApiLayerRequest {
            struct_type: loader::LoaderInterfaceStructType::API_LAYER_REQUEST,
            struct_version: 1,
            struct_size: std::mem::size_of::<loader::NegotiateApiLayerRequest>(),
            layer_interface_version: 0,
            layer_api_version: xr::Version::new(0, 0, 0),
            get_instance_proc_addr: None,
            create_api_layer_instance: None,
        };
        let result = unsafe {
            OpenKneeboard_xrNegotiateLoaderApiLayerInterface(
                &loader_info,
                API_LAYER_NAME.as_ptr(),
                &mut request,
            )
        };
        assert_eq!(result, xr::Result::SUCCESS);
        assert!(request.get_instance_proc_addr.is_some());
        assert!(request.create_api_layer_instance.is_some());
        assert_eq!(
            request.layer_interface_version,
            loader::CURRENT_LOADER_API_LAYER_VERSION
        );

        // Wrong name is refused.
        let result = unsafe {
            OpenKneeboard_xrNegotiateLoaderApiLayerInterface(
                &loader_info,
                c"XR_APILAYER_SOMEONE_else".as_ptr(),
                &mut request,
            )
        };
        assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
    }
}
