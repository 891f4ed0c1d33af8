//! `XR_KHR_vulkan_enable2` interception: the application's Vulkan instance
//! and device are created *through* the OpenXR runtime, which is our one
//! chance to append the extensions the compositor needs (timeline
//! semaphores, external memory/semaphore interop).

use super::instance::{self, VulkanXrState};
use ash::vk;
use openxr_sys as xr;
use std::ffi::{c_char, CStr};

fn instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::get_physical_device_properties2::NAME,
        ash::khr::external_memory_capabilities::NAME,
        ash::khr::external_semaphore_capabilities::NAME,
    ]
}

fn device_extensions() -> Vec<&'static CStr> {
    let mut extensions = vec![
        ash::khr::timeline_semaphore::NAME,
        ash::khr::external_memory::NAME,
        ash::khr::external_semaphore::NAME,
    ];
    #[cfg(windows)]
    {
        extensions.push(ash::khr::external_memory_win32::NAME);
        extensions.push(ash::khr::external_semaphore_win32::NAME);
    }
    #[cfg(unix)]
    {
        extensions.push(ash::khr::external_memory_fd::NAME);
        extensions.push(ash::khr::external_semaphore_fd::NAME);
    }
    extensions
}

/// The app's extension list plus ours, deduplicated.
fn merge_extensions(
    existing: *const *const c_char,
    existing_count: u32,
    wanted: Vec<&'static CStr>,
) -> Vec<*const c_char> {
    let existing = if existing.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(existing, existing_count as usize) }
    };
    let mut merged: Vec<*const c_char> = existing.to_vec();
    for extension in wanted {
        let already = existing
            .iter()
            .any(|&e| unsafe { CStr::from_ptr(e) } == extension);
        if !already {
            log::debug!("appending Vulkan extension {extension:?}");
            merged.push(extension.as_ptr());
        }
    }
    merged
}

pub unsafe extern "system" fn xr_create_vulkan_instance(
    xr_instance: xr::Instance,
    create_info: *const xr::VulkanInstanceCreateInfoKHR,
    vulkan_instance: *mut xr::platform::VkInstance,
    vulkan_result: *mut xr::platform::VkResult,
) -> xr::Result {
    let Some(state) = instance::for_instance(xr_instance) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    let Some(next_fn) = (unsafe {
        state
            .next
            .get_extension_fn::<xr::pfn::CreateVulkanInstanceKHR>(
                xr_instance,
                "xrCreateVulkanInstanceKHR",
            )
    }) else {
        return xr::Result::ERROR_FUNCTION_UNSUPPORTED;
    };

    let info = unsafe { &*create_info };
    let vk_info = unsafe { &*info.vulkan_create_info.cast::<vk::InstanceCreateInfo>() };
    let extensions = merge_extensions(
        vk_info.pp_enabled_extension_names,
        vk_info.enabled_extension_count,
        instance_extensions(),
    );
    let mut patched_vk_info = *vk_info;
    patched_vk_info.enabled_extension_count = extensions.len() as u32;
    patched_vk_info.pp_enabled_extension_names = extensions.as_ptr();

    let mut patched_info = unsafe { std::ptr::read(create_info) };
    patched_info.vulkan_create_info = (&patched_vk_info as *const vk::InstanceCreateInfo).cast();

    let result = unsafe { next_fn(xr_instance, &patched_info, vulkan_instance, vulkan_result) };
    if result.into_raw() >= 0 {
        state.advance_vulkan_state(
            VulkanXrState::NoVkEnable2,
            VulkanXrState::VkEnable2Instance,
        );
    }
    result
}

pub unsafe extern "system" fn xr_create_vulkan_device(
    xr_instance: xr::Instance,
    create_info: *const xr::VulkanDeviceCreateInfoKHR,
    vulkan_device: *mut xr::platform::VkDevice,
    vulkan_result: *mut xr::platform::VkResult,
) -> xr::Result {
    let Some(state) = instance::for_instance(xr_instance) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    let Some(next_fn) = (unsafe {
        state
            .next
            .get_extension_fn::<xr::pfn::CreateVulkanDeviceKHR>(
                xr_instance,
                "xrCreateVulkanDeviceKHR",
            )
    }) else {
        return xr::Result::ERROR_FUNCTION_UNSUPPORTED;
    };

    let info = unsafe { &*create_info };
    let vk_info = unsafe { &*info.vulkan_create_info.cast::<vk::DeviceCreateInfo>() };
    let extensions = merge_extensions(
        vk_info.pp_enabled_extension_names,
        vk_info.enabled_extension_count,
        device_extensions(),
    );
    // Timeline semaphores also need the feature bit; chain it in front of
    // whatever the app already asked for.
    let mut timeline_features = vk::PhysicalDeviceTimelineSemaphoreFeatures::default()
        .timeline_semaphore(true);
    timeline_features.p_next = vk_info.p_next.cast_mut();

    let mut patched_vk_info = *vk_info;
    patched_vk_info.enabled_extension_count = extensions.len() as u32;
    patched_vk_info.pp_enabled_extension_names = extensions.as_ptr();
    patched_vk_info.p_next =
        (&timeline_features as *const vk::PhysicalDeviceTimelineSemaphoreFeatures).cast();

    let mut patched_info = unsafe { std::ptr::read(create_info) };
    patched_info.vulkan_create_info = (&patched_vk_info as *const vk::DeviceCreateInfo).cast();

    let result = unsafe { next_fn(xr_instance, &patched_info, vulkan_device, vulkan_result) };
    if result.into_raw() >= 0 {
        state.advance_vulkan_state(
            VulkanXrState::VkEnable2Instance,
            VulkanXrState::VkEnable2InstanceAndDevice,
        );
    }
    result
}
