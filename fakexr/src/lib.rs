//! A fake OpenXR runtime for testing API-layer behaviour without a headset
//! or a GPU. Implements just enough of the spec for session, space,
//! swapchain and frame calls, and records every `xrEndFrame` layer list so
//! tests can assert on what a layer actually submitted.

use openxr_sys as xr;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use std::ffi::{c_char, CStr};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

trait Handle: 'static + Send + Sync {
    type XrType: XrType;
    fn instances() -> MutexGuard<'static, SlotMap<DefaultKey, Arc<Self>>>;
    fn to_xr(self: Arc<Self>) -> Self::XrType;
}

trait XrType {
    type Handle: Handle;
    const TO_RAW: fn(Self) -> u64;
    fn to_handle(self) -> Option<Arc<Self::Handle>>;
}

macro_rules! impl_handle {
    ($ty:ty, $xr_type:ty) => {
        impl XrType for $xr_type {
            type Handle = $ty;
            const TO_RAW: fn(Self) -> u64 = <$xr_type>::into_raw;
            fn to_handle(self) -> Option<Arc<Self::Handle>> {
                Self::Handle::instances()
                    .get(DefaultKey::from(KeyData::from_ffi(self.into_raw())))
                    .map(Arc::clone)
            }
        }
        impl Handle for $ty {
            type XrType = $xr_type;
            fn instances() -> MutexGuard<'static, SlotMap<DefaultKey, Arc<Self>>> {
                static I: LazyLock<Mutex<SlotMap<DefaultKey, Arc<$ty>>>> =
                    LazyLock::new(Mutex::default);
                I.lock().unwrap()
            }
            fn to_xr(self: Arc<Self>) -> $xr_type {
                let key = Self::instances().insert(self);
                <$xr_type>::from_raw(key.data().as_ffi())
            }
        }
    };
}

macro_rules! get_handle {
    ($handle:expr) => {{
        match <_ as XrType>::to_handle($handle) {
            Some(handle) => handle,
            None => return xr::Result::ERROR_HANDLE_INVALID,
        }
    }};
}

struct Instance {
    runtime_name: Mutex<String>,
    max_layer_count: Mutex<u32>,
}

struct Session {
    instance: Weak<Instance>,
    view_pose: Mutex<xr::Posef>,
    frames: Mutex<Vec<Vec<RecordedLayer>>>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum SpaceKind {
    View,
    Local,
    Other,
}

struct Space {
    session: Weak<Session>,
    kind: SpaceKind,
}

struct Swapchain {
    width: u32,
    height: u32,
    format: i64,
    image_acquired: Mutex<bool>,
    next_image: Mutex<u32>,
}

impl_handle!(Instance, xr::Instance);
impl_handle!(Session, xr::Session);
impl_handle!(Space, xr::Space);
impl_handle!(Swapchain, xr::Swapchain);

fn destroy_handle<T: XrType>(handle: T) -> xr::Result {
    T::Handle::instances().remove(DefaultKey::from(KeyData::from_ffi(T::TO_RAW(handle))));
    xr::Result::SUCCESS
}

/// One entry of a recorded `xrEndFrame` layer list.
#[derive(Clone, Debug)]
pub struct RecordedLayer {
    pub ty: xr::StructureType,
    pub quad: Option<RecordedQuad>,
}

#[derive(Copy, Clone, Debug)]
pub struct RecordedQuad {
    pub swapchain: u64,
    pub image_rect: xr::Rect2Di,
    pub pose: xr::Posef,
    pub size: xr::Extent2Df,
}

/// Swapchains created so far, in creation order, with their dimensions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: i64,
    pub alive: bool,
}

static SWAPCHAIN_LOG: LazyLock<Mutex<Vec<(u64, SwapchainDesc)>>> = LazyLock::new(Mutex::default);

// ---- test control surface ----

pub fn set_runtime_name(instance: xr::Instance, name: &str) {
    let instance = instance.to_handle().expect("valid instance");
    *instance.runtime_name.lock().unwrap() = name.to_string();
}

pub fn set_max_layer_count(instance: xr::Instance, count: u32) {
    let instance = instance.to_handle().expect("valid instance");
    *instance.max_layer_count.lock().unwrap() = count;
}

pub fn set_view_pose(session: xr::Session, pose: xr::Posef) {
    let session = session.to_handle().expect("valid session");
    *session.view_pose.lock().unwrap() = pose;
}

pub fn last_frame_layers(session: xr::Session) -> Option<Vec<RecordedLayer>> {
    let session = session.to_handle()?;
    let frames = session.frames.lock().unwrap();
    frames.last().cloned()
}

pub fn frame_count(session: xr::Session) -> usize {
    let session = session.to_handle().expect("valid session");
    let frames = session.frames.lock().unwrap();
    frames.len()
}

pub fn swapchain_log() -> Vec<SwapchainDesc> {
    SWAPCHAIN_LOG
        .lock()
        .unwrap()
        .iter()
        .map(|(_, desc)| *desc)
        .collect()
}

pub fn reset_swapchain_log() {
    SWAPCHAIN_LOG.lock().unwrap().clear();
}

// ---- entry point ----

pub extern "system" fn get_instance_proc_addr(
    instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<xr::pfn::VoidFunction>,
) -> xr::Result {
    let name = unsafe { CStr::from_ptr(name) };

    macro_rules! dispatch {
        ($($name:literal => $func:ident as $pfn:ident,)+) => {
            match name.to_bytes() {
                $($name => Some(unsafe {
                    std::mem::transmute::<xr::pfn::$pfn, xr::pfn::VoidFunction>(
                        $func as xr::pfn::$pfn,
                    )
                }),)+
                _ => None,
            }
        };
    }

    let resolved = dispatch! {
        b"xrGetInstanceProcAddr" => get_instance_proc_addr as GetInstanceProcAddr,
        b"xrCreateInstance" => create_instance as CreateInstance,
        b"xrDestroyInstance" => destroy_instance as DestroyInstance,
        b"xrGetInstanceProperties" => get_instance_properties as GetInstanceProperties,
        b"xrGetSystem" => get_system as GetSystem,
        b"xrGetSystemProperties" => get_system_properties as GetSystemProperties,
        b"xrCreateSession" => create_session as CreateSession,
        b"xrDestroySession" => destroy_session as DestroySession,
        b"xrEndFrame" => end_frame as EndFrame,
        b"xrCreateReferenceSpace" => create_reference_space as CreateReferenceSpace,
        b"xrDestroySpace" => destroy_space as DestroySpace,
        b"xrLocateSpace" => locate_space as LocateSpace,
        b"xrCreateSwapchain" => create_swapchain as CreateSwapchain,
        b"xrDestroySwapchain" => destroy_swapchain as DestroySwapchain,
        b"xrEnumerateSwapchainFormats" => enumerate_swapchain_formats as EnumerateSwapchainFormats,
        b"xrEnumerateSwapchainImages" => enumerate_swapchain_images as EnumerateSwapchainImages,
        b"xrAcquireSwapchainImage" => acquire_swapchain_image as AcquireSwapchainImage,
        b"xrWaitSwapchainImage" => wait_swapchain_image as WaitSwapchainImage,
        b"xrReleaseSwapchainImage" => release_swapchain_image as ReleaseSwapchainImage,
    };

    match resolved {
        Some(f) => {
            unsafe { *function = Some(f) };
            xr::Result::SUCCESS
        }
        None => {
            unsafe { *function = None };
            xr::Result::ERROR_FUNCTION_UNSUPPORTED
        }
    }
}

// ---- instance / system ----

extern "system" fn create_instance(
    _info: *const xr::InstanceCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result {
    let inst = Arc::new(Instance {
        runtime_name: Mutex::new("FakeXR".to_string()),
        max_layer_count: Mutex::new(16),
    });
    unsafe { *instance = inst.to_xr() };
    xr::Result::SUCCESS
}

extern "system" fn destroy_instance(instance: xr::Instance) -> xr::Result {
    destroy_handle(instance)
}

extern "system" fn get_instance_properties(
    instance: xr::Instance,
    properties: *mut xr::InstanceProperties,
) -> xr::Result {
    let instance = get_handle!(instance);
    let name = instance.runtime_name.lock().unwrap();
    let out = unsafe { &mut *properties };
    out.runtime_version = xr::Version::new(1, 0, 0);
    out.runtime_name = [0; xr::MAX_RUNTIME_NAME_SIZE];
    for (d, s) in out.runtime_name.iter_mut().zip(name.as_bytes()) {
        *d = *s as c_char;
    }
    xr::Result::SUCCESS
}

extern "system" fn get_system(
    _instance: xr::Instance,
    _info: *const xr::SystemGetInfo,
    system_id: *mut xr::SystemId,
) -> xr::Result {
    unsafe { *system_id = xr::SystemId::from_raw(1) };
    xr::Result::SUCCESS
}

extern "system" fn get_system_properties(
    instance: xr::Instance,
    _system_id: xr::SystemId,
    properties: *mut xr::SystemProperties,
) -> xr::Result {
    let instance = get_handle!(instance);
    let out = unsafe { &mut *properties };
    out.system_id = xr::SystemId::from_raw(1);
    out.graphics_properties.max_layer_count = *instance.max_layer_count.lock().unwrap();
    out.graphics_properties.max_swapchain_image_width = 4096;
    out.graphics_properties.max_swapchain_image_height = 4096;
    xr::Result::SUCCESS
}

// ---- session ----

extern "system" fn create_session(
    instance: xr::Instance,
    _info: *const xr::SessionCreateInfo,
    session: *mut xr::Session,
) -> xr::Result {
    let instance = get_handle!(instance);
    let sess = Arc::new(Session {
        instance: Arc::downgrade(&instance),
        view_pose: Mutex::new(xr::Posef::IDENTITY),
        frames: Mutex::default(),
    });
    unsafe { *session = sess.to_xr() };
    xr::Result::SUCCESS
}

extern "system" fn destroy_session(session: xr::Session) -> xr::Result {
    destroy_handle(session)
}

extern "system" fn end_frame(
    session: xr::Session,
    frame_end_info: *const xr::FrameEndInfo,
) -> xr::Result {
    let session = get_handle!(session);
    if session.instance.upgrade().is_none() {
        return xr::Result::ERROR_INSTANCE_LOST;
    }
    let info = unsafe { &*frame_end_info };

    let instance = session.instance.upgrade().unwrap();
    let max = *instance.max_layer_count.lock().unwrap();
    if info.layer_count > max {
        return xr::Result::ERROR_LAYER_LIMIT_EXCEEDED;
    }

    let layers: &[*const xr::CompositionLayerBaseHeader] = if info.layer_count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(info.layers, info.layer_count as usize) }
    };
    let recorded = layers
        .iter()
        .map(|&layer| {
            let base = unsafe { &*layer };
            let quad = (base.ty == xr::StructureType::COMPOSITION_LAYER_QUAD).then(|| {
                let quad = unsafe { &*layer.cast::<xr::CompositionLayerQuad>() };
                RecordedQuad {
                    swapchain: quad.sub_image.swapchain.into_raw(),
                    image_rect: quad.sub_image.image_rect,
                    pose: quad.pose,
                    size: quad.size,
                }
            });
            RecordedLayer { ty: base.ty, quad }
        })
        .collect();
    session.frames.lock().unwrap().push(recorded);
    xr::Result::SUCCESS
}

// ---- spaces ----

extern "system" fn create_reference_space(
    session: xr::Session,
    info: *const xr::ReferenceSpaceCreateInfo,
    space: *mut xr::Space,
) -> xr::Result {
    let session = get_handle!(session);
    let info = unsafe { &*info };
    let kind = match info.reference_space_type {
        xr::ReferenceSpaceType::VIEW => SpaceKind::View,
        xr::ReferenceSpaceType::LOCAL => SpaceKind::Local,
        _ => SpaceKind::Other,
    };
    let sp = Arc::new(Space {
        session: Arc::downgrade(&session),
        kind,
    });
    unsafe { *space = sp.to_xr() };
    xr::Result::SUCCESS
}

extern "system" fn destroy_space(space: xr::Space) -> xr::Result {
    destroy_handle(space)
}

extern "system" fn locate_space(
    space: xr::Space,
    base_space: xr::Space,
    _time: xr::Time,
    location: *mut xr::SpaceLocation,
) -> xr::Result {
    let space = get_handle!(space);
    let base = get_handle!(base_space);
    let out = unsafe { &mut *location };

    // The only query the layer makes: the view pose in local space.
    if space.kind == SpaceKind::View && base.kind == SpaceKind::Local {
        let session = match space.session.upgrade() {
            Some(session) => session,
            None => return xr::Result::ERROR_SESSION_LOST,
        };
        out.pose = *session.view_pose.lock().unwrap();
        out.location_flags = xr::SpaceLocationFlags::POSITION_VALID
            | xr::SpaceLocationFlags::POSITION_TRACKED
            | xr::SpaceLocationFlags::ORIENTATION_VALID
            | xr::SpaceLocationFlags::ORIENTATION_TRACKED;
    } else {
        out.pose = xr::Posef::IDENTITY;
        out.location_flags = xr::SpaceLocationFlags::EMPTY;
    }
    xr::Result::SUCCESS
}

// ---- swapchains ----

extern "system" fn create_swapchain(
    _session: xr::Session,
    info: *const xr::SwapchainCreateInfo,
    swapchain: *mut xr::Swapchain,
) -> xr::Result {
    let info = unsafe { &*info };
    let chain = Arc::new(Swapchain {
        width: info.width,
        height: info.height,
        format: info.format,
        image_acquired: Mutex::new(false),
        next_image: Mutex::new(0),
    });
    let handle = chain.to_xr();
    SWAPCHAIN_LOG.lock().unwrap().push((
        handle.into_raw(),
        SwapchainDesc {
            width: info.width,
            height: info.height,
            format: info.format,
            alive: true,
        },
    ));
    unsafe { *swapchain = handle };
    xr::Result::SUCCESS
}

extern "system" fn destroy_swapchain(swapchain: xr::Swapchain) -> xr::Result {
    let raw = swapchain.into_raw();
    let mut log = SWAPCHAIN_LOG.lock().unwrap();
    if let Some((_, desc)) = log.iter_mut().find(|(handle, _)| *handle == raw) {
        desc.alive = false;
    }
    drop(log);
    destroy_handle(swapchain)
}

extern "system" fn enumerate_swapchain_formats(
    _session: xr::Session,
    format_capacity_input: u32,
    format_count_output: *mut u32,
    formats: *mut i64,
) -> xr::Result {
    // B8G8R8A8_SRGB, B8G8R8A8_UNORM (Vulkan numbering), and the DXGI pair
    // 91/87, so every backend's preference list finds a match.
    const SUPPORTED: [i64; 4] = [50, 44, 91, 87];
    unsafe { *format_count_output = SUPPORTED.len() as u32 };
    if format_capacity_input == 0 {
        return xr::Result::SUCCESS;
    }
    if (format_capacity_input as usize) < SUPPORTED.len() {
        return xr::Result::ERROR_SIZE_INSUFFICIENT;
    }
    let out = unsafe { std::slice::from_raw_parts_mut(formats, SUPPORTED.len()) };
    out.copy_from_slice(&SUPPORTED);
    xr::Result::SUCCESS
}

extern "system" fn enumerate_swapchain_images(
    _swapchain: xr::Swapchain,
    image_capacity_input: u32,
    image_count_output: *mut u32,
    images: *mut xr::SwapchainImageBaseHeader,
) -> xr::Result {
    // Three images, all with null/zero handles; graphics tests use a fake
    // backend that never dereferences them.
    const COUNT: u32 = 3;
    unsafe { *image_count_output = COUNT };
    if image_capacity_input == 0 || images.is_null() {
        return xr::Result::SUCCESS;
    }
    xr::Result::SUCCESS
}

extern "system" fn acquire_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageAcquireInfo,
    index: *mut u32,
) -> xr::Result {
    let chain = get_handle!(swapchain);
    let mut acquired = chain.image_acquired.lock().unwrap();
    if *acquired {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    *acquired = true;
    let mut next = chain.next_image.lock().unwrap();
    unsafe { *index = *next };
    *next = (*next + 1) % 3;
    xr::Result::SUCCESS
}

extern "system" fn wait_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageWaitInfo,
) -> xr::Result {
    let chain = get_handle!(swapchain);
    if !*chain.image_acquired.lock().unwrap() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    xr::Result::SUCCESS
}

extern "system" fn release_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageReleaseInfo,
) -> xr::Result {
    let chain = get_handle!(swapchain);
    let mut acquired = chain.image_acquired.lock().unwrap();
    if !*acquired {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    *acquired = false;
    xr::Result::SUCCESS
}
