//! Loader layer-chain structures.
//!
//! The loader passes each layer the next layer's proc-addr functions in a
//! `VkLayer{Instance,Device}CreateInfo` hidden in the create info's pNext
//! chain. `ash` does not model these loader-private types, so they are
//! declared here with the C layout from `vk_layer.h`.

use ash::vk;
use std::ffi::c_void;

use crate::error::{RelayError, Result};

/// `VK_LAYER_LINK_INFO` in `VkLayerFunction`.
pub const LAYER_LINK_INFO: i32 = 0;
/// `VK_LOADER_DATA_CALLBACK` in `VkLayerFunction`.
pub const LOADER_DATA_CALLBACK: i32 = 1;

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const std::ffi::c_char) -> vk::PFN_vkVoidFunction;

/// `PFN_vkSetDeviceLoaderData`: stamps the loader's dispatch pointer into a
/// dispatchable object the layer obtained below the loader.
pub type PfnSetDeviceLoaderData =
    unsafe extern "system" fn(vk::Device, *mut c_void) -> vk::Result;

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerInstanceCreateInfoU {
    pub p_layer_info: *mut LayerInstanceLink,
    /// `pfnSetInstanceLoaderData` and `layerDevice`; never read.
    pub loader_callbacks: [*const c_void; 2],
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerInstanceCreateInfoU,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerDeviceCreateInfoU {
    pub p_layer_info: *mut LayerDeviceLink,
    pub pfn_set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerDeviceCreateInfoU,
}

/// Every Vulkan structure starts with these two members.
#[repr(C)]
struct ChainHeader {
    s_type: vk::StructureType,
    p_next: *const c_void,
}

/// Walk `p_next` until a loader structure of `s_type` carrying `function` shows up.
unsafe fn find_link(
    mut next: *const c_void,
    s_type: vk::StructureType,
    function: i32,
) -> Option<*mut c_void> {
    while !next.is_null() {
        let header = &*(next as *const ChainHeader);
        if header.s_type == s_type {
            // Both loader create infos share the header + function prefix.
            let info = &*(next as *const LayerDeviceCreateInfo);
            if info.function == function {
                return Some(next as *mut c_void);
            }
        }
        next = header.p_next;
    }
    None
}

/// Take this layer's link out of the instance chain and advance it for the next layer.
/// # Safety
/// `create_info` must be the create info the loader passed to `vkCreateInstance`.
pub unsafe fn take_instance_link(
    create_info: *const vk::InstanceCreateInfo<'_>,
) -> Result<vk::PFN_vkGetInstanceProcAddr> {
    let info = find_link((*create_info).p_next, LOADER_INSTANCE_CREATE_INFO, LAYER_LINK_INFO)
        .ok_or(RelayError::MissingLayerLink)? as *mut LayerInstanceCreateInfo;
    let link = (*info).u.p_layer_info;
    if link.is_null() {
        return Err(RelayError::MissingLayerLink);
    }
    (*info).u.p_layer_info = (*link).p_next;
    Ok((*link).pfn_next_get_instance_proc_addr)
}

/// Device-chain counterpart of `take_instance_link`.
/// # Safety
/// `create_info` must be the create info the loader passed to `vkCreateDevice`.
pub unsafe fn take_device_link(
    create_info: *const vk::DeviceCreateInfo<'_>,
) -> Result<(vk::PFN_vkGetInstanceProcAddr, vk::PFN_vkGetDeviceProcAddr)> {
    let info = find_link((*create_info).p_next, LOADER_DEVICE_CREATE_INFO, LAYER_LINK_INFO)
        .ok_or(RelayError::MissingLayerLink)? as *mut LayerDeviceCreateInfo;
    let link = (*info).u.p_layer_info;
    if link.is_null() {
        return Err(RelayError::MissingLayerLink);
    }
    (*info).u.p_layer_info = (*link).p_next;
    Ok((
        (*link).pfn_next_get_instance_proc_addr,
        (*link).pfn_next_get_device_proc_addr,
    ))
}

/// The loader's `pfnSetDeviceLoaderData`, if the device chain carries one.
/// # Safety
/// `create_info` must be the create info the loader passed to `vkCreateDevice`.
pub unsafe fn device_loader_data_callback(
    create_info: *const vk::DeviceCreateInfo<'_>,
) -> Option<PfnSetDeviceLoaderData> {
    let info = find_link(
        (*create_info).p_next,
        LOADER_DEVICE_CREATE_INFO,
        LOADER_DATA_CALLBACK,
    )? as *const LayerDeviceCreateInfo;
    (*info).u.pfn_set_device_loader_data
}
