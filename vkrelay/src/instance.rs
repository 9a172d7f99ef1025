//! Instance-level interception
//!
//! Creating an instance resolves the adapter pairing once. From then on the
//! application only ever sees the render adapter, and surface queries made
//! against it are answered by the display adapter that will actually present.

use ash::vk::{self, Handle};
use log::{debug, info, warn};
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use crate::backend::{void_fn_ptr, InstanceBackend, OpenedDevice};
use crate::error::{RelayError, Result};
use crate::handle::dispatch_key;
use crate::link;
use crate::memory::MemoryTypeTable;
use crate::registry::Registry;
use crate::secondary::release_display_context;
use crate::topology::{resolve_topology, AdapterInfo, Pairing};

/// The next layer's instance functions plus the pairing resolved at creation.
pub struct InstanceDispatch {
    pub instance: ash::Instance,
    pub next_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub surface_fn: ash::khr::surface::InstanceFn,
    /// Adapters as the next layer enumerates them.
    pub adapters: Vec<vk::PhysicalDevice>,
    pub pairing: Pairing,
}

impl InstanceDispatch {
    /// Load the next layer's functions for `instance` and pair its adapters.
    /// # Safety
    /// `next_proc_addr` must be the next layer's `vkGetInstanceProcAddr` for `instance`.
    pub unsafe fn load(
        next_proc_addr: vk::PFN_vkGetInstanceProcAddr,
        instance: vk::Instance,
        registry: &Registry,
    ) -> Result<Self> {
        let mut load = |name: &CStr| void_fn_ptr(next_proc_addr(instance, name.as_ptr()));
        let ash_instance = ash::Instance::load_with(&mut load, instance);
        let surface_fn = ash::khr::surface::InstanceFn::load(&mut load);

        let adapters = ash_instance.enumerate_physical_devices()?;
        let infos: Vec<AdapterInfo> = adapters
            .iter()
            .map(|&adapter| query_adapter(&ash_instance, adapter))
            .collect();
        let pairing = resolve_topology(&infos, registry.config().pairing)?;

        Ok(Self {
            instance: ash_instance,
            next_proc_addr,
            surface_fn,
            adapters,
            pairing,
        })
    }

    pub fn handle(&self) -> vk::Instance {
        self.instance.handle()
    }

    /// Adapters the application may see: the render adapter, plus the
    /// display adapter while the display context is being created.
    pub fn visible_adapters(&self, reveal_all: bool) -> Vec<vk::PhysicalDevice> {
        if reveal_all {
            vec![self.pairing.render, self.pairing.display]
        } else {
            vec![self.pairing.render]
        }
    }
}

pub fn query_adapter(instance: &ash::Instance, adapter: vk::PhysicalDevice) -> AdapterInfo {
    let (properties, memory, queue_families) = unsafe {
        (
            instance.get_physical_device_properties(adapter),
            instance.get_physical_device_memory_properties(adapter),
            instance.get_physical_device_queue_family_properties(adapter),
        )
    };
    let name = properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| format!("{:?}", adapter));
    AdapterInfo {
        handle: adapter,
        name,
        device_type: properties.device_type,
        memory: MemoryTypeTable::from_properties(&memory),
        queue_families,
    }
}

/// Write `items` into a Vulkan count/array pair, reporting `INCOMPLETE` when the array is short.
/// # Safety
/// `p_count` must be valid; `p_items`, when non-null, must hold `*p_count` elements.
pub unsafe fn fill_array<T: Copy>(items: &[T], p_count: *mut u32, p_items: *mut T) -> vk::Result {
    if p_items.is_null() {
        *p_count = items.len() as u32;
        return vk::Result::SUCCESS;
    }
    let written = (*p_count as usize).min(items.len());
    std::slice::from_raw_parts_mut(p_items, written).copy_from_slice(&items[..written]);
    *p_count = written as u32;
    if written < items.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

pub unsafe fn create_instance(
    registry: &Registry,
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> Result<()> {
    if p_create_info.is_null() || p_instance.is_null() {
        return Err(RelayError::InitializationFailed(
            "null create info or instance pointer".to_string(),
        ));
    }
    let next_proc_addr = link::take_instance_link(p_create_info)?;
    let create: vk::PFN_vkCreateInstance =
        match next_proc_addr(vk::Instance::null(), c"vkCreateInstance".as_ptr()) {
            Some(function) => std::mem::transmute(function),
            None => {
                return Err(RelayError::InitializationFailed(
                    "next layer has no vkCreateInstance".to_string(),
                ))
            }
        };
    create(p_create_info, p_allocator, p_instance).result()?;
    let instance = *p_instance;

    let dispatch = match InstanceDispatch::load(next_proc_addr, instance, registry) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            // The pairing failed; do not leave a half-initialized instance behind.
            let mut load = |name: &CStr| void_fn_ptr(next_proc_addr(instance, name.as_ptr()));
            let ash_instance = ash::Instance::load_with(&mut load, instance);
            (ash_instance.fp_v1_0().destroy_instance)(instance, p_allocator);
            return Err(err);
        }
    };

    info!(
        "Instance {:?}: render {:?}, display {:?}",
        instance, dispatch.pairing.render, dispatch.pairing.display
    );
    registry.register_instance(dispatch_key(instance.as_raw()), Arc::new(dispatch));
    Ok(())
}

pub unsafe fn destroy_instance(
    registry: &Registry,
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let key = dispatch_key(instance.as_raw());
    // The display device is a child of this instance and must go first.
    if let Some(secondary) = registry.take_secondary_context(key) {
        release_display_context(secondary);
    }
    match registry.remove_instance(key) {
        Some(dispatch) => (dispatch.instance.fp_v1_0().destroy_instance)(instance, p_allocator),
        None => warn!("vkDestroyInstance on untracked instance {:?}", instance),
    }
}

pub unsafe fn enumerate_physical_devices(
    registry: &Registry,
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> Result<vk::Result> {
    let dispatch = registry.instance(dispatch_key(instance.as_raw()))?;
    let visible = dispatch.visible_adapters(registry.is_revealing());
    debug!("Exposing adapters {:?}", visible);
    Ok(fill_array(&visible, p_physical_device_count, p_physical_devices))
}

/// The instance dispatch and adapter that answer surface queries for `adapter`.
fn surface_target(
    registry: &Registry,
    adapter: vk::PhysicalDevice,
) -> Result<(Arc<InstanceDispatch>, vk::PhysicalDevice)> {
    let dispatch = registry.instance_for_adapter(adapter)?;
    let target = registry.display_for(adapter).unwrap_or(adapter);
    Ok((dispatch, target))
}

pub unsafe fn get_surface_formats(
    registry: &Registry,
    adapter: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_formats: *mut vk::SurfaceFormatKHR,
) -> Result<vk::Result> {
    let (dispatch, target) = surface_target(registry, adapter)?;
    Ok((dispatch.surface_fn.get_physical_device_surface_formats_khr)(
        target, surface, p_count, p_formats,
    ))
}

pub unsafe fn get_surface_capabilities(
    registry: &Registry,
    adapter: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_capabilities: *mut vk::SurfaceCapabilitiesKHR,
) -> Result<vk::Result> {
    let (dispatch, target) = surface_target(registry, adapter)?;
    Ok((dispatch.surface_fn.get_physical_device_surface_capabilities_khr)(
        target,
        surface,
        p_capabilities,
    ))
}

/// Presentation always happens from queue family 0 of the display adapter,
/// whatever family the application asks about.
pub unsafe fn get_surface_support(
    registry: &Registry,
    adapter: vk::PhysicalDevice,
    queue_family_index: u32,
    surface: vk::SurfaceKHR,
    p_supported: *mut vk::Bool32,
) -> Result<vk::Result> {
    let (dispatch, target) = surface_target(registry, adapter)?;
    if queue_family_index != 0 {
        debug!("Surface support for family {} answered by family 0", queue_family_index);
    }
    Ok((dispatch.surface_fn.get_physical_device_surface_support_khr)(
        target,
        0,
        surface,
        p_supported,
    ))
}

pub unsafe fn get_surface_present_modes(
    registry: &Registry,
    adapter: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_modes: *mut vk::PresentModeKHR,
) -> Result<vk::Result> {
    let (dispatch, target) = surface_target(registry, adapter)?;
    Ok((dispatch.surface_fn.get_physical_device_surface_present_modes_khr)(
        target, surface, p_count, p_modes,
    ))
}

/// Forward an instance-level lookup to the next layer.
pub unsafe fn next_proc_addr(
    registry: &Registry,
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    match registry.instance(dispatch_key(instance.as_raw())) {
        Ok(dispatch) => (dispatch.next_proc_addr)(instance, p_name),
        Err(_) => None,
    }
}

/// `InstanceBackend` that goes through the Vulkan loader from the top, so
/// the display context it creates passes through this layer like any other.
pub struct LoaderInstance {
    registry: &'static Registry,
    instance: ash::Instance,
    entry: ash::Entry,
}

impl LoaderInstance {
    pub fn new(registry: &'static Registry, instance: vk::Instance) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RelayError::SecondaryContextFailed(e.to_string()))?;
        let instance = unsafe { ash::Instance::load(entry.static_fn(), instance) };
        Ok(Self {
            registry,
            instance,
            entry,
        })
    }
}

impl InstanceBackend for LoaderInstance {
    fn enumerate_adapters(&self) -> Result<Vec<vk::PhysicalDevice>> {
        let _reveal = self.registry.reveal_all();
        Ok(unsafe { self.instance.enumerate_physical_devices()? })
    }

    fn adapter_info(&self, adapter: vk::PhysicalDevice) -> Result<AdapterInfo> {
        Ok(query_adapter(&self.instance, adapter))
    }

    fn create_device(
        &self,
        adapter: vk::PhysicalDevice,
        queue_family_index: u32,
        extensions: &[&CStr],
    ) -> Result<OpenedDevice> {
        let priorities = [0.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let extension_names: Vec<*const c_char> =
            extensions.iter().map(|name| name.as_ptr()).collect();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extension_names);

        let device = unsafe { self.instance.create_device(adapter, &create_info, None)? };
        // The loader trampoline stamps its dispatch pointer into the queue.
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        // The layer registered a context for this device on the way down; use
        // its downstream functions rather than the loader's trampolines.
        let key = unsafe { dispatch_key(device.handle().as_raw()) };
        let backend = match self.registry.device(key) {
            Ok(context) => context.backend.clone(),
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        // Destroy through the loader too, so its device bookkeeping goes with it.
        let entry = self.entry.clone();
        let teardown = move || {
            unsafe { device.destroy_device(None) };
            drop(entry);
        };
        Ok(OpenedDevice {
            backend,
            queue,
            teardown: Some(Box::new(teardown)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::DispatchKey;
    use crate::testing::{
        display_context, instance_dispatch, instance_dispatch_with, FakeDispatchable, MockDevice,
    };
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicU64, Ordering};

    const RENDER: u64 = 0x100;
    const DISPLAY: u64 = 0x200;

    fn pairing() -> Pairing {
        Pairing {
            render: vk::PhysicalDevice::from_raw(RENDER),
            display: vk::PhysicalDevice::from_raw(DISPLAY),
        }
    }

    fn adapters() -> Vec<vk::PhysicalDevice> {
        // Display enumerated first, as integrated adapters often are.
        vec![
            vk::PhysicalDevice::from_raw(DISPLAY),
            vk::PhysicalDevice::from_raw(RENDER),
        ]
    }

    #[test]
    fn test_visible_adapters() {
        let dispatch = instance_dispatch(vk::Instance::from_raw(0x10), adapters(), pairing());
        assert_eq!(dispatch.visible_adapters(false), vec![pairing().render]);
        assert_eq!(
            dispatch.visible_adapters(true),
            vec![pairing().render, pairing().display]
        );
    }

    #[test]
    fn test_enumeration_hides_display_adapter_until_revealed() {
        let registry = Registry::default();
        let handle = FakeDispatchable::new(DispatchKey(0xE1));
        let instance = vk::Instance::from_raw(handle.raw());
        registry.register_instance(
            DispatchKey(0xE1),
            instance_dispatch(instance, adapters(), pairing()),
        );

        let mut listed = [vk::PhysicalDevice::null(); 4];
        let mut count = listed.len() as u32;
        let result = unsafe {
            enumerate_physical_devices(&registry, instance, &mut count, listed.as_mut_ptr())
        }
        .unwrap();
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(&listed[..count as usize], &[pairing().render]);

        let _reveal = registry.reveal_all();
        let mut count = listed.len() as u32;
        unsafe { enumerate_physical_devices(&registry, instance, &mut count, listed.as_mut_ptr()) }
            .unwrap();
        assert_eq!(
            &listed[..count as usize],
            &[pairing().render, pairing().display]
        );
    }

    #[test]
    fn test_surface_target_redirects_render_adapter() {
        let registry = Registry::default();
        registry.register_instance(
            DispatchKey(0xE2),
            instance_dispatch(vk::Instance::from_raw(0x10), adapters(), pairing()),
        );

        let (_, target) = surface_target(&registry, pairing().render).unwrap();
        assert_eq!(target, pairing().display);
        // Adapters without a pairing answer for themselves.
        let (_, target) = surface_target(&registry, pairing().display).unwrap();
        assert_eq!(target, pairing().display);
        assert!(surface_target(&registry, vk::PhysicalDevice::from_raw(0x300)).is_err());
    }

    static SUPPORT_ADAPTER: AtomicU64 = AtomicU64::new(0);
    static SUPPORT_FAMILY: AtomicU64 = AtomicU64::new(u64::MAX);

    unsafe extern "system" fn record_surface_support(
        adapter: vk::PhysicalDevice,
        queue_family_index: u32,
        _surface: vk::SurfaceKHR,
        p_supported: *mut vk::Bool32,
    ) -> vk::Result {
        SUPPORT_ADAPTER.store(adapter.as_raw(), Ordering::SeqCst);
        SUPPORT_FAMILY.store(queue_family_index as u64, Ordering::SeqCst);
        *p_supported = vk::TRUE;
        vk::Result::SUCCESS
    }

    #[test]
    fn test_surface_support_asks_display_family_zero() {
        let registry = Registry::default();
        let dispatch = instance_dispatch_with(
            vk::Instance::from_raw(0x10),
            adapters(),
            pairing(),
            |name| match name.to_bytes() {
                b"vkGetPhysicalDeviceSurfaceSupportKHR" => {
                    record_surface_support as usize as *const c_void
                }
                _ => std::ptr::null(),
            },
        );
        registry.register_instance(DispatchKey(0xE3), dispatch);

        let mut supported = vk::FALSE;
        let result = unsafe {
            get_surface_support(
                &registry,
                pairing().render,
                3,
                vk::SurfaceKHR::from_raw(0x5),
                &mut supported,
            )
        }
        .unwrap();
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(supported, vk::TRUE);
        assert_eq!(SUPPORT_ADAPTER.load(Ordering::SeqCst), DISPLAY);
        assert_eq!(SUPPORT_FAMILY.load(Ordering::SeqCst), 0);
    }

    static DESTROYED_INSTANCE: AtomicU64 = AtomicU64::new(0);

    unsafe extern "system" fn record_destroy_instance(
        instance: vk::Instance,
        _p_allocator: *const vk::AllocationCallbacks<'_>,
    ) {
        DESTROYED_INSTANCE.store(instance.as_raw(), Ordering::SeqCst);
    }

    #[test]
    fn test_destroy_instance_releases_display_context() {
        let registry = Registry::default();
        let key = DispatchKey(0xE4);
        let handle = FakeDispatchable::new(key);
        let instance = vk::Instance::from_raw(handle.raw());
        let dispatch = instance_dispatch_with(instance, adapters(), pairing(), |name| {
            match name.to_bytes() {
                b"vkDestroyInstance" => record_destroy_instance as usize as *const c_void,
                _ => std::ptr::null(),
            }
        });
        registry.register_instance(key, dispatch);

        let display_device = MockDevice::new();
        let task_device = display_device.clone();
        registry
            .begin_secondary_context(key, move || Ok(display_context(task_device)))
            .unwrap();

        unsafe { destroy_instance(&registry, instance, std::ptr::null()) };

        assert!(display_device.is_destroyed());
        assert_eq!(DESTROYED_INSTANCE.load(Ordering::SeqCst), instance.as_raw());
        assert!(registry.take_secondary_context(key).is_none());
        assert!(registry.instance(key).is_err());
        assert_eq!(registry.display_for(pairing().render), None);

        // A later instance gets an initializer of its own.
        let next = DispatchKey(0xE5);
        let started = registry
            .begin_secondary_context(next, || Ok(display_context(MockDevice::new())))
            .unwrap();
        assert!(started.is_some());
    }

    #[test]
    fn test_fill_array_counts() {
        let items = [1u64, 2, 3];
        let mut count = 0u32;
        let result = unsafe { fill_array(&items, &mut count, std::ptr::null_mut()) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_fill_array_short_buffer() {
        let items = [1u64, 2, 3];
        let mut out = [0u64; 2];
        let mut count = 2u32;
        let result = unsafe { fill_array(&items, &mut count, out.as_mut_ptr()) };
        assert_eq!(result, vk::Result::INCOMPLETE);
        assert_eq!(count, 2);
        assert_eq!(out, [1, 2]);

        let mut out = [0u64; 4];
        let mut count = 4u32;
        let result = unsafe { fill_array(&items, &mut count, out.as_mut_ptr()) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
        assert_eq!(out, [1, 2, 3, 0]);
    }
}
