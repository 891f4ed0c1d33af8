//! OpenXR loader negotiation interface. `openxr-sys` does not ship the
//! loader-side structs, so they are declared here to match
//! `loader_interfaces.h` exactly; they are ABI, not API.

use openxr_sys as xr;
use std::ffi::{c_char, c_void};

pub const CURRENT_LOADER_API_LAYER_VERSION: u32 = 1;
pub const API_LAYER_MAX_SETTINGS_PATH_SIZE: usize = 512;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoaderInterfaceStructType(pub u32);

impl LoaderInterfaceStructType {
    pub const UNINITIALIZED: Self = Self(0);
    pub const LOADER_INFO: Self = Self(1);
    pub const API_LAYER_REQUEST: Self = Self(2);
    pub const RUNTIME_REQUEST: Self = Self(3);
    pub const API_LAYER_CREATE_INFO: Self = Self(4);
    pub const API_LAYER_NEXT_INFO: Self = Self(5);
}

pub type CreateApiLayerInstanceFn = unsafe extern "system" fn(
    create_info: *const xr::InstanceCreateInfo,
    layer_info: *const ApiLayerCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result;

#[repr(C)]
pub struct NegotiateLoaderInfo {
    pub struct_type: LoaderInterfaceStructType,
    pub struct_version: u32,
    pub struct_size: usize,
    pub min_interface_version: u32,
    pub max_interface_version: u32,
    pub min_api_version: xr::Version,
    pub max_api_version: xr::Version,
}

#[repr(C)]
pub struct NegotiateApiLayerRequest {
    pub struct_type: LoaderInterfaceStructType,
    pub struct_version: u32,
    pub struct_size: usize,
    pub layer_interface_version: u32,
    pub layer_api_version: xr::Version,
    pub get_instance_proc_addr: Option<xr::pfn::GetInstanceProcAddr>,
    pub create_api_layer_instance: Option<CreateApiLayerInstanceFn>,
}

#[repr(C)]
pub struct ApiLayerNextInfo {
    pub struct_type: LoaderInterfaceStructType,
    pub struct_version: u32,
    pub struct_size: usize,
    pub layer_name: [c_char; xr::MAX_API_LAYER_NAME_SIZE],
    pub next_get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
    pub next_create_api_layer_instance: CreateApiLayerInstanceFn,
    pub next: *mut ApiLayerNextInfo,
}

#[repr(C)]
pub struct ApiLayerCreateInfo {
    pub struct_type: LoaderInterfaceStructType,
    pub struct_version: u32,
    pub struct_size: usize,
    pub loader_instance: *mut c_void,
    pub settings_file_location: [c_char; API_LAYER_MAX_SETTINGS_PATH_SIZE],
    pub next_info: *mut ApiLayerNextInfo,
}
