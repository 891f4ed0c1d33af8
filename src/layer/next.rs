//! Dispatch table for the next layer (or the runtime) in the chain, fetched
//! once per instance through the loader-provided `xrGetInstanceProcAddr`.

use openxr_sys as xr;
use std::ffi::c_char;

macro_rules! next_table {
    ($($name:ident: $pfn:ident),+ $(,)?) => {
        pub struct NextTable {
            pub get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
            $(pub $name: xr::pfn::$pfn,)+
        }

        impl NextTable {
            /// Fetch every entry point we forward to. Missing core functions
            /// mean the chain below us is unusable.
            pub fn load(
                instance: xr::Instance,
                get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
            ) -> Result<Self, xr::Result> {
                unsafe {
                    Ok(Self {
                        get_instance_proc_addr,
                        $($name: {
                            let mut function = None;
                            let name = concat!("xr", stringify!($pfn), "\0");
                            let result = get_instance_proc_addr(
                                instance,
                                name.as_ptr().cast::<c_char>(),
                                &mut function,
                            );
                            if result.into_raw() < 0 {
                                return Err(result);
                            }
                            match function {
                                Some(f) => std::mem::transmute::<xr::pfn::VoidFunction, xr::pfn::$pfn>(f),
                                None => return Err(xr::Result::ERROR_FUNCTION_UNSUPPORTED),
                            }
                        },)+
                    })
                }
            }
        }
    };
}

next_table! {
    get_instance_properties: GetInstanceProperties,
    get_system_properties: GetSystemProperties,
    create_session: CreateSession,
    destroy_session: DestroySession,
    destroy_instance: DestroyInstance,
    end_frame: EndFrame,
    create_reference_space: CreateReferenceSpace,
    destroy_space: DestroySpace,
    locate_space: LocateSpace,
    create_swapchain: CreateSwapchain,
    destroy_swapchain: DestroySwapchain,
    enumerate_swapchain_formats: EnumerateSwapchainFormats,
    enumerate_swapchain_images: EnumerateSwapchainImages,
    acquire_swapchain_image: AcquireSwapchainImage,
    wait_swapchain_image: WaitSwapchainImage,
    release_swapchain_image: ReleaseSwapchainImage,
}

impl NextTable {
    /// Extension functions are fetched lazily; the app may not have enabled
    /// them.
    pub unsafe fn get_extension_fn<T>(&self, instance: xr::Instance, name: &str) -> Option<T> {
        debug_assert!(std::mem::size_of::<T>() == std::mem::size_of::<xr::pfn::VoidFunction>());
        let name = std::ffi::CString::new(name).ok()?;
        let mut function = None;
        let result =
            unsafe { (self.get_instance_proc_addr)(instance, name.as_ptr(), &mut function) };
        if result.into_raw() < 0 {
            return None;
        }
        function.map(|f| unsafe { std::mem::transmute_copy::<xr::pfn::VoidFunction, T>(&f) })
    }
}
