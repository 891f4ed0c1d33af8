//! Per-`XrInstance` layer state. Everything that was process-global in
//! spirit (the active kneeboard, the next-chain dispatch table) lives here,
//! in a map keyed by the raw instance handle, and dies with the instance.

use super::end_frame::Kneeboard;
use super::next::NextTable;
use crate::settings::Settings;
use openxr_sys as xr;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

/// `XR_KHR_vulkan_enable2` usage tracking: both create hooks must have run
/// before a Vulkan session is something we can composite into.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VulkanXrState {
    #[default]
    NoVkEnable2,
    VkEnable2Instance,
    VkEnable2InstanceAndDevice,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeId {
    pub version: xr::Version,
    pub name: [u8; xr::MAX_RUNTIME_NAME_SIZE],
}

impl RuntimeId {
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn is_varjo(&self) -> bool {
        // Exact prefix match; "Varjo Aero" etc.
        self.name_str().starts_with("Varjo")
    }
}

pub struct InstanceState {
    pub handle: xr::Instance,
    pub next: NextTable,
    pub have_vulkan_enable2: bool,
    pub vulkan_state: Mutex<VulkanXrState>,
    pub settings: Settings,
    pub kneeboard: Mutex<Option<Kneeboard>>,
}

impl InstanceState {
    pub fn advance_vulkan_state(&self, from: VulkanXrState, to: VulkanXrState) {
        let mut state = self.vulkan_state.lock().unwrap();
        if *state == from {
            *state = to;
        } else {
            log::warn!("unexpected Vulkan enable2 transition from {:?}", *state);
        }
    }
}

static INSTANCES: LazyLock<Mutex<HashMap<u64, Arc<InstanceState>>>> =
    LazyLock::new(Mutex::default);
/// Session handle -> owning instance handle; hooks after `xrCreateSession`
/// only receive the session.
static SESSIONS: LazyLock<Mutex<HashMap<u64, u64>>> = LazyLock::new(Mutex::default);

pub fn register_instance(state: Arc<InstanceState>) {
    INSTANCES
        .lock()
        .unwrap()
        .insert(state.handle.into_raw(), state);
}

pub fn unregister_instance(instance: xr::Instance) -> Option<Arc<InstanceState>> {
    SESSIONS
        .lock()
        .unwrap()
        .retain(|_, owner| *owner != instance.into_raw());
    INSTANCES.lock().unwrap().remove(&instance.into_raw())
}

pub fn for_instance(instance: xr::Instance) -> Option<Arc<InstanceState>> {
    INSTANCES.lock().unwrap().get(&instance.into_raw()).cloned()
}

/// Any registered instance; used by hooks that take neither an instance nor
/// a session (the enable2 Vulkan hooks arrive with the instance, so this is
/// only a fallback).
pub fn any_instance() -> Option<Arc<InstanceState>> {
    INSTANCES.lock().unwrap().values().next().cloned()
}

pub fn register_session(session: xr::Session, instance: xr::Instance) {
    SESSIONS
        .lock()
        .unwrap()
        .insert(session.into_raw(), instance.into_raw());
}

pub fn unregister_session(session: xr::Session) {
    SESSIONS.lock().unwrap().remove(&session.into_raw());
}

pub fn for_session(session: xr::Session) -> Option<Arc<InstanceState>> {
    // Never hold both map locks at once.
    let instance = *SESSIONS.lock().unwrap().get(&session.into_raw())?;
    INSTANCES.lock().unwrap().get(&instance).cloned()
}
