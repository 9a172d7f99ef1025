//! Vulkan layer entry points
//!
//! The loader finds `vkrelay_GetInstanceProcAddr` / `vkrelay_GetDeviceProcAddr`
//! through the layer manifest. Everything the relay intercepts is resolved
//! here; every other name goes to the next layer in the chain.

use ash::vk::{self, Handle};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::ffi::{c_char, CStr};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::handle::dispatch_key;
use crate::instance::{self, fill_array};
use crate::registry::Registry;
use crate::{device, swapchain};

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry::new(RelayConfig::from_env()));

fn registry() -> &'static Registry {
    &REGISTRY
}

fn report(call: &str, err: RelayError) -> vk::Result {
    match err {
        RelayError::OutOfDate => debug!("{}: swapchain out of date", call),
        ref err => error!("{} failed: {}", call, err),
    }
    err.to_vk_result()
}

// Instance chain

#[no_mangle]
pub unsafe extern "system" fn vkrelay_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }

    let name = CStr::from_ptr(p_name);
    if let Some(function) = intercepted_instance_fn(name) {
        return function;
    }
    if let Some(function) = intercepted_device_fn(name) {
        return function;
    }
    if instance == vk::Instance::null() {
        return None;
    }
    instance::next_proc_addr(registry(), instance, p_name)
}

unsafe fn intercepted_instance_fn(name: &CStr) -> Option<vk::PFN_vkVoidFunction> {
    let function: vk::PFN_vkVoidFunction = match name.to_bytes() {
        b"vkGetInstanceProcAddr" => std::mem::transmute(
            vkrelay_GetInstanceProcAddr as vk::PFN_vkGetInstanceProcAddr,
        ),
        b"vkCreateInstance" => std::mem::transmute(relay_CreateInstance as vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => {
            std::mem::transmute(relay_DestroyInstance as vk::PFN_vkDestroyInstance)
        }
        b"vkEnumeratePhysicalDevices" => std::mem::transmute(
            relay_EnumeratePhysicalDevices as vk::PFN_vkEnumeratePhysicalDevices,
        ),
        b"vkCreateDevice" => std::mem::transmute(relay_CreateDevice as vk::PFN_vkCreateDevice),
        b"vkGetPhysicalDeviceSurfaceFormatsKHR" => std::mem::transmute(
            relay_GetPhysicalDeviceSurfaceFormatsKHR
                as vk::PFN_vkGetPhysicalDeviceSurfaceFormatsKHR,
        ),
        b"vkGetPhysicalDeviceSurfaceCapabilitiesKHR" => std::mem::transmute(
            relay_GetPhysicalDeviceSurfaceCapabilitiesKHR
                as vk::PFN_vkGetPhysicalDeviceSurfaceCapabilitiesKHR,
        ),
        b"vkGetPhysicalDeviceSurfaceSupportKHR" => std::mem::transmute(
            relay_GetPhysicalDeviceSurfaceSupportKHR
                as vk::PFN_vkGetPhysicalDeviceSurfaceSupportKHR,
        ),
        b"vkGetPhysicalDeviceSurfacePresentModesKHR" => std::mem::transmute(
            relay_GetPhysicalDeviceSurfacePresentModesKHR
                as vk::PFN_vkGetPhysicalDeviceSurfacePresentModesKHR,
        ),
        _ => return None,
    };
    Some(function)
}

unsafe extern "system" fn relay_CreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::init();
    info!("vkCreateInstance");

    match instance::create_instance(registry(), p_create_info, p_allocator, p_instance) {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => report("vkCreateInstance", e),
    }
}

unsafe extern "system" fn relay_DestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    info!("vkDestroyInstance");
    instance::destroy_instance(registry(), instance, p_allocator);
}

unsafe extern "system" fn relay_EnumeratePhysicalDevices(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    match instance::enumerate_physical_devices(
        registry(),
        instance,
        p_physical_device_count,
        p_physical_devices,
    ) {
        Ok(result) => result,
        Err(e) => report("vkEnumeratePhysicalDevices", e),
    }
}

unsafe extern "system" fn relay_CreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    match device::create_device(
        registry(),
        physical_device,
        p_create_info,
        p_allocator,
        p_device,
    ) {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => report("vkCreateDevice", e),
    }
}

unsafe extern "system" fn relay_GetPhysicalDeviceSurfaceFormatsKHR(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_surface_format_count: *mut u32,
    p_surface_formats: *mut vk::SurfaceFormatKHR,
) -> vk::Result {
    match instance::get_surface_formats(
        registry(),
        physical_device,
        surface,
        p_surface_format_count,
        p_surface_formats,
    ) {
        Ok(result) => result,
        Err(e) => report("vkGetPhysicalDeviceSurfaceFormatsKHR", e),
    }
}

unsafe extern "system" fn relay_GetPhysicalDeviceSurfaceCapabilitiesKHR(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_surface_capabilities: *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result {
    match instance::get_surface_capabilities(
        registry(),
        physical_device,
        surface,
        p_surface_capabilities,
    ) {
        Ok(result) => result,
        Err(e) => report("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e),
    }
}

unsafe extern "system" fn relay_GetPhysicalDeviceSurfaceSupportKHR(
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    surface: vk::SurfaceKHR,
    p_supported: *mut vk::Bool32,
) -> vk::Result {
    match instance::get_surface_support(
        registry(),
        physical_device,
        queue_family_index,
        surface,
        p_supported,
    ) {
        Ok(result) => result,
        Err(e) => report("vkGetPhysicalDeviceSurfaceSupportKHR", e),
    }
}

unsafe extern "system" fn relay_GetPhysicalDeviceSurfacePresentModesKHR(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_present_mode_count: *mut u32,
    p_present_modes: *mut vk::PresentModeKHR,
) -> vk::Result {
    match instance::get_surface_present_modes(
        registry(),
        physical_device,
        surface,
        p_present_mode_count,
        p_present_modes,
    ) {
        Ok(result) => result,
        Err(e) => report("vkGetPhysicalDeviceSurfacePresentModesKHR", e),
    }
}

// Device chain

#[no_mangle]
pub unsafe extern "system" fn vkrelay_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() || device == vk::Device::null() {
        return None;
    }

    let name = CStr::from_ptr(p_name);
    if let Some(function) = intercepted_device_fn(name) {
        return function;
    }
    match registry().device(dispatch_key(device.as_raw())) {
        Ok(context) => context.next_proc_addr(p_name),
        Err(_) => None,
    }
}

unsafe fn intercepted_device_fn(name: &CStr) -> Option<vk::PFN_vkVoidFunction> {
    let function: vk::PFN_vkVoidFunction = match name.to_bytes() {
        b"vkGetDeviceProcAddr" => {
            std::mem::transmute(vkrelay_GetDeviceProcAddr as vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkDestroyDevice" => std::mem::transmute(relay_DestroyDevice as vk::PFN_vkDestroyDevice),
        b"vkCreateSwapchainKHR" => {
            std::mem::transmute(relay_CreateSwapchainKHR as vk::PFN_vkCreateSwapchainKHR)
        }
        b"vkDestroySwapchainKHR" => {
            std::mem::transmute(relay_DestroySwapchainKHR as vk::PFN_vkDestroySwapchainKHR)
        }
        b"vkGetSwapchainImagesKHR" => {
            std::mem::transmute(relay_GetSwapchainImagesKHR as vk::PFN_vkGetSwapchainImagesKHR)
        }
        b"vkAcquireNextImageKHR" => {
            std::mem::transmute(relay_AcquireNextImageKHR as vk::PFN_vkAcquireNextImageKHR)
        }
        b"vkQueuePresentKHR" => {
            std::mem::transmute(relay_QueuePresentKHR as vk::PFN_vkQueuePresentKHR)
        }
        _ => return None,
    };
    Some(function)
}

unsafe extern "system" fn relay_DestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    info!("vkDestroyDevice");
    device::destroy_device(registry(), device, p_allocator);
}

unsafe extern "system" fn relay_CreateSwapchainKHR(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    if p_create_info.is_null() || p_swapchain.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let registry = registry();
    let created = registry
        .device(dispatch_key(device.as_raw()))
        .and_then(|render| swapchain::create_shadow_swapchain(registry, &render, &*p_create_info));
    match created {
        Ok(handle) => {
            *p_swapchain = handle;
            vk::Result::SUCCESS
        }
        Err(e) => report("vkCreateSwapchainKHR", e),
    }
}

unsafe extern "system" fn relay_DestroySwapchainKHR(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if swapchain == vk::SwapchainKHR::null() {
        return;
    }
    if let Err(e) = swapchain::destroy_shadow_swapchain(registry(), swapchain) {
        report("vkDestroySwapchainKHR", e);
    }
}

unsafe extern "system" fn relay_GetSwapchainImagesKHR(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_swapchain_image_count: *mut u32,
    p_swapchain_images: *mut vk::Image,
) -> vk::Result {
    if p_swapchain_image_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    match swapchain::swapchain_images(registry(), swapchain) {
        Ok(images) => fill_array(&images, p_swapchain_image_count, p_swapchain_images),
        Err(e) => report("vkGetSwapchainImagesKHR", e),
    }
}

unsafe extern "system" fn relay_AcquireNextImageKHR(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    if p_image_index.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    match swapchain::acquire_next(registry(), swapchain, timeout, semaphore, fence) {
        Ok((index, suboptimal)) => {
            *p_image_index = index;
            if suboptimal {
                vk::Result::SUBOPTIMAL_KHR
            } else {
                vk::Result::SUCCESS
            }
        }
        Err(RelayError::Vulkan(result @ (vk::Result::TIMEOUT | vk::Result::NOT_READY))) => result,
        Err(e) => report("vkAcquireNextImageKHR", e),
    }
}

unsafe extern "system" fn relay_QueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    if p_present_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    present_batch(registry(), queue, &*p_present_info)
}

/// Relay the first swapchain of a present batch. Further entries are not
/// presented and report `VK_ERROR_OUT_OF_DATE_KHR` in `pResults`.
unsafe fn present_batch(
    registry: &Registry,
    queue: vk::Queue,
    info: &vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let count = info.swapchain_count as usize;
    if count == 0 {
        return vk::Result::SUCCESS;
    }
    if count > 1 {
        warn!("Present of {} swapchains; only the first is relayed", count);
    }
    let wait_semaphores: &[vk::Semaphore] = if info.wait_semaphore_count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(info.p_wait_semaphores, info.wait_semaphore_count as usize)
    };

    let result = match swapchain::present(
        registry,
        queue,
        *info.p_swapchains,
        *info.p_image_indices,
        wait_semaphores,
    ) {
        Ok(true) => vk::Result::SUBOPTIMAL_KHR,
        Ok(false) => vk::Result::SUCCESS,
        Err(e) => report("vkQueuePresentKHR", e),
    };
    if !info.p_results.is_null() {
        let results = std::slice::from_raw_parts_mut(info.p_results, count);
        results[0] = result;
        results[1..].fill(vk::Result::ERROR_OUT_OF_DATE_KHR);
    }
    result
}
