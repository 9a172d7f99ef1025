//! Logical contexts: the application's render device and the relay's display device

use ash::vk::{self, Handle};
use log::{debug, info, warn};
use std::ffi::{c_char, c_void};
use std::sync::Arc;

use crate::backend::{AshDevice, DeviceBackend, Teardown};
use crate::error::{RelayError, Result};
use crate::handle::{dispatch_key, DispatchKey};
use crate::instance::LoaderInstance;
use crate::link::{self, PfnSetDeviceLoaderData};
use crate::memory::MemoryTypeTable;
use crate::registry::Registry;
use crate::secondary::create_display_context;

/// A logical device the layer has seen created.
pub struct DeviceContext {
    pub backend: Arc<dyn DeviceBackend>,
    pub physical_device: vk::PhysicalDevice,
    /// Dispatch key of the instance the device was created from.
    pub instance: DispatchKey,
    /// Next layer's `vkGetDeviceProcAddr`, for calls the layer does not intercept.
    pub next_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub set_loader_data: Option<PfnSetDeviceLoaderData>,
}

impl DeviceContext {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        physical_device: vk::PhysicalDevice,
        instance: DispatchKey,
    ) -> Self {
        Self {
            backend,
            physical_device,
            instance,
            next_proc_addr: None,
            set_loader_data: None,
        }
    }

    pub fn handle(&self) -> vk::Device {
        self.backend.handle()
    }

    /// Fetch a queue below the loader and give it the loader's dispatch pointer,
    /// so layers underneath can look it up when the relay submits to it.
    pub fn queue(&self, queue_family_index: u32, queue_index: u32) -> Result<vk::Queue> {
        let queue = self.backend.device_queue(queue_family_index, queue_index);
        if let Some(set_loader_data) = self.set_loader_data {
            unsafe { set_loader_data(self.handle(), queue.as_raw() as usize as *mut c_void) }
                .result()?;
        }
        Ok(queue)
    }

    /// # Safety
    /// `p_name` must be a valid NUL-terminated string.
    pub unsafe fn next_proc_addr(&self, p_name: *const c_char) -> vk::PFN_vkVoidFunction {
        self.next_proc_addr
            .and_then(|next| next(self.handle(), p_name))
    }
}

/// The relay-owned context on the display adapter, plus the memory tables
/// of both adapters needed to place staging images.
///
/// The logical device is destroyed when the last holder drops the context.
pub struct DisplayContext {
    pub backend: Arc<dyn DeviceBackend>,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub render_memory: MemoryTypeTable,
    pub display_memory: MemoryTypeTable,
    pub teardown: Option<Teardown>,
}

impl Drop for DisplayContext {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            info!("Destroying display context on {:?}", self.physical_device);
            teardown();
        }
    }
}

pub unsafe fn create_device(
    registry: &'static Registry,
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> Result<()> {
    if p_create_info.is_null() || p_device.is_null() {
        return Err(RelayError::InitializationFailed(
            "null create info or device pointer".to_string(),
        ));
    }
    let (next_instance_proc_addr, next_device_proc_addr) = link::take_device_link(p_create_info)?;
    let set_loader_data = link::device_loader_data_callback(p_create_info);
    let dispatch = registry.instance_for_adapter(physical_device)?;
    let instance_key = dispatch_key(dispatch.handle().as_raw());

    let create: vk::PFN_vkCreateDevice =
        match next_instance_proc_addr(dispatch.handle(), c"vkCreateDevice".as_ptr()) {
            Some(function) => std::mem::transmute(function),
            None => {
                return Err(RelayError::InitializationFailed(
                    "next layer has no vkCreateDevice".to_string(),
                ))
            }
        };
    create(physical_device, p_create_info, p_allocator, p_device).result()?;
    let device = *p_device;

    let backend = AshDevice::from_proc_addr(next_device_proc_addr, device);
    let mut context = DeviceContext::new(Arc::new(backend), physical_device, instance_key);
    context.next_proc_addr = Some(next_device_proc_addr);
    context.set_loader_data = set_loader_data;
    registry.register_device(dispatch_key(device.as_raw()), Arc::new(context));
    debug!("Device {:?} on {:?}", device, physical_device);

    // Only devices on a paired render adapter need a display context.
    if registry.display_for(physical_device).is_some() {
        let instance = dispatch.handle();
        let started = registry.begin_secondary_context(instance_key, move || {
            let loader = LoaderInstance::new(registry, instance)?;
            create_display_context(&loader)
        })?;
        if started.is_some() {
            info!("Render device {:?} created; preparing display context", device);
        }
    }
    Ok(())
}

pub unsafe fn destroy_device(
    registry: &Registry,
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    let Some(context) = registry.remove_device(dispatch_key(device.as_raw())) else {
        warn!("vkDestroyDevice on untracked device {:?}", device);
        return;
    };
    match context.next_proc_addr(c"vkDestroyDevice".as_ptr()) {
        Some(function) => {
            let destroy: vk::PFN_vkDestroyDevice = std::mem::transmute(function);
            destroy(device, p_allocator);
        }
        None => warn!("Next layer has no vkDestroyDevice; leaking {:?}", device),
    }
}
