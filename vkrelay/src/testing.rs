//! In-memory backends for unit tests.
//!
//! `MockDevice` hands out unique fake handles, backs host allocations with
//! real byte buffers and counts every call the relay makes, so tests can
//! check resource lifetimes and submission patterns without a GPU.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{DeviceBackend, InstanceBackend, OpenedDevice};
use crate::config::RelayConfig;
use crate::device::{DeviceContext, DisplayContext};
use crate::error::{RelayError, Result};
use crate::handle::DispatchKey;
use crate::instance::InstanceDispatch;
use crate::memory::{MemoryTypeTable, HOST_MEMORY, LOCAL_MEMORY};
use crate::registry::Registry;
use crate::topology::{AdapterInfo, Pairing};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x1000);

fn fresh_raw() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// A command captured while recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    Barrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    Copy {
        src: vk::Image,
        dst: vk::Image,
        width: u32,
        height: u32,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub images_created: usize,
    pub live_images: usize,
    pub live_allocations: usize,
    pub mapped: usize,
    pub command_buffers_allocated: usize,
    pub live_command_buffers: usize,
    pub live_command_pools: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub fence_waits: usize,
    pub submits: usize,
    pub swapchains_created: usize,
    pub live_swapchains: usize,
    pub presents: usize,
}

/// Arguments of one `create_swapchain` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub min_image_count: u32,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub old_swapchain: vk::SwapchainKHR,
}

/// Semaphores and command buffers of one submit batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Default)]
struct MockState {
    images: FxHashMap<vk::Image, vk::Extent3D>,
    allocations: FxHashMap<vk::DeviceMemory, Box<[u8]>>,
    mapped: FxHashSet<vk::DeviceMemory>,
    pools: FxHashSet<vk::CommandPool>,
    command_buffers: FxHashSet<vk::CommandBuffer>,
    recordings: FxHashMap<vk::CommandBuffer, Vec<Recorded>>,
    swapchains: FxHashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    swapchain_requests: Vec<SwapchainRequest>,
    submissions: Vec<Submission>,
    next_acquire: u32,
    extra_swapchain_images: u32,
    stalled: bool,
    destroyed: bool,
    stats: MockStats,
}

pub struct MockDevice {
    handle: vk::Device,
    memory_types: MemoryTypeTable,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Self::with_memory_types(vec![LOCAL_MEMORY, HOST_MEMORY])
    }

    pub fn with_memory_types(types: Vec<vk::MemoryPropertyFlags>) -> Arc<Self> {
        Arc::new(Self {
            handle: vk::Device::from_raw(fresh_raw()),
            memory_types: MemoryTypeTable::new(types),
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn memory_types(&self) -> MemoryTypeTable {
        self.memory_types.clone()
    }

    /// Make every fence wait time out.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Report this many more presentable images than requested.
    pub fn set_extra_swapchain_images(&self, extra: u32) {
        self.state.lock().extra_swapchain_images = extra;
    }

    pub fn stats(&self) -> MockStats {
        let state = self.state.lock();
        MockStats {
            live_images: state.images.len(),
            live_allocations: state.allocations.len(),
            mapped: state.mapped.len(),
            live_command_buffers: state.command_buffers.len(),
            live_command_pools: state.pools.len(),
            live_swapchains: state.swapchains.len(),
            ..state.stats
        }
    }

    /// Stands in for `vkDestroyDevice` issued by the owner of the context.
    pub fn mark_destroyed(&self) {
        self.state.lock().destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Commands recorded into `command_buffer`, kept after it is freed.
    pub fn recorded(&self, command_buffer: vk::CommandBuffer) -> Vec<Recorded> {
        self.state
            .lock()
            .recordings
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn swapchain_requests(&self) -> Vec<SwapchainRequest> {
        self.state.lock().swapchain_requests.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Fill a host allocation with `byte`.
    pub fn fill_memory(&self, memory: vk::DeviceMemory, byte: u8) {
        if let Some(data) = self.state.lock().allocations.get_mut(&memory) {
            data.fill(byte);
        }
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state
            .lock()
            .allocations
            .get(&memory)
            .map(|data| data.to_vec())
            .unwrap_or_default()
    }
}

impl DeviceBackend for MockDevice {
    fn handle(&self) -> vk::Device {
        self.handle
    }

    fn device_queue(&self, _queue_family_index: u32, _queue_index: u32) -> vk::Queue {
        vk::Queue::from_raw(self.handle.as_raw() + 0x10_0000)
    }

    fn create_image(&self, create_info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let image = vk::Image::from_raw(fresh_raw());
        let mut state = self.state.lock();
        state.images.insert(image, create_info.extent);
        state.stats.images_created += 1;
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image);
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let extent = self
            .state
            .lock()
            .images
            .get(&image)
            .copied()
            .unwrap_or_default();
        vk::MemoryRequirements {
            size: 4 * u64::from(extent.width) * u64::from(extent.height),
            alignment: 256,
            memory_type_bits: (1u32 << self.memory_types.types.len()) - 1,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        _memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let memory = vk::DeviceMemory::from_raw(fresh_raw());
        self.state
            .lock()
            .allocations
            .insert(memory, vec![0u8; size as usize].into_boxed_slice());
        Ok(memory)
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        let data = state
            .allocations
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?
            .as_mut_ptr();
        state.mapped.insert(memory);
        Ok(data)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().mapped.remove(&memory);
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().allocations.remove(&memory);
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let pool = vk::CommandPool::from_raw(fresh_raw());
        self.state.lock().pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().pools.remove(&pool);
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let cmd = vk::CommandBuffer::from_raw(fresh_raw());
        let mut state = self.state.lock();
        state.command_buffers.insert(cmd);
        state.recordings.insert(cmd, Vec::new());
        state.stats.command_buffers_allocated += 1;
        Ok(cmd)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&command_buffer);
    }

    fn begin_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        if let Some(commands) = self.state.lock().recordings.get_mut(&command_buffer) {
            commands.push(Recorded::Barrier {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            });
        }
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageCopy,
    ) {
        if let Some(commands) = self.state.lock().recordings.get_mut(&command_buffer) {
            commands.push(Recorded::Copy {
                src,
                dst,
                width: region.extent.width,
                height: region.extent.height,
            });
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        self.state.lock().stats.fences_created += 1;
        Ok(vk::Fence::from_raw(fresh_raw()))
    }

    fn destroy_fence(&self, _fence: vk::Fence) {
        self.state.lock().stats.fences_destroyed += 1;
    }

    fn wait_for_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.stats.fence_waits += 1;
        if state.stalled {
            Err(vk::Result::TIMEOUT)
        } else {
            Ok(())
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.stats.submits += 1;
        for submit in submits {
            // SAFETY: the counts and pointers come from slices borrowed by the builder.
            let (command_buffers, waits, signals) = unsafe {
                (
                    raw_slice(submit.p_command_buffers, submit.command_buffer_count),
                    raw_slice(submit.p_wait_semaphores, submit.wait_semaphore_count),
                    raw_slice(submit.p_signal_semaphores, submit.signal_semaphore_count),
                )
            };
            state.submissions.push(Submission {
                queue,
                command_buffers,
                wait_semaphores: waits,
                signal_semaphores: signals,
                fence,
            });
        }
        Ok(())
    }

    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let swapchain = vk::SwapchainKHR::from_raw(fresh_raw());
        let mut state = self.state.lock();
        let count = create_info.min_image_count + state.extra_swapchain_images;
        let images = (0..count).map(|_| vk::Image::from_raw(fresh_raw())).collect();
        state.swapchains.insert(swapchain, images);
        state.swapchain_requests.push(SwapchainRequest {
            min_image_count: create_info.min_image_count,
            extent: create_info.image_extent,
            usage: create_info.image_usage,
            sharing_mode: create_info.image_sharing_mode,
            old_swapchain: create_info.old_swapchain,
        });
        state.stats.swapchains_created += 1;
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        _semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let count = state
            .swapchains
            .get(&swapchain)
            .map(|images| images.len() as u32)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = state.next_acquire % count;
        state.next_acquire += 1;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.stats.presents += 1;
        if present_info.wait_semaphore_count != 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        Ok(false)
    }
}

unsafe fn raw_slice<T: Copy>(data: *const T, count: u32) -> Vec<T> {
    if data.is_null() || count == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(data, count as usize).to_vec()
}

/// A display context over `device`, with the same memory table for both adapters.
pub fn display_context(device: Arc<MockDevice>) -> DisplayContext {
    let memory = device.memory_types();
    let owner = device.clone();
    DisplayContext {
        queue: device.device_queue(0, 0),
        physical_device: vk::PhysicalDevice::from_raw(0x200),
        backend: device,
        render_memory: memory.clone(),
        display_memory: memory,
        teardown: Some(Box::new(move || owner.mark_destroyed())),
    }
}

/// One `create_device` call seen by `MockInstance`.
#[derive(Clone, Debug)]
pub struct CreatedDevice {
    pub adapter: vk::PhysicalDevice,
    pub queue_family_index: u32,
    pub extensions: Vec<String>,
}

pub struct MockInstance {
    adapters: Vec<AdapterInfo>,
    created: Mutex<Vec<CreatedDevice>>,
}

impl MockInstance {
    fn adapter(raw: u64, device_type: vk::PhysicalDeviceType, memory: MemoryTypeTable) -> AdapterInfo {
        AdapterInfo {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("mock gpu {:#x}", raw),
            device_type,
            memory,
            queue_families: vec![vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            }],
        }
    }

    /// Render adapter first, display adapter second, as reveal-all enumeration reports them.
    pub fn dual_gpu() -> Self {
        Self {
            adapters: vec![
                Self::adapter(
                    0x100,
                    vk::PhysicalDeviceType::DISCRETE_GPU,
                    MemoryTypeTable::new(vec![LOCAL_MEMORY, HOST_MEMORY]),
                ),
                Self::adapter(
                    0x200,
                    vk::PhysicalDeviceType::INTEGRATED_GPU,
                    MemoryTypeTable::new(vec![HOST_MEMORY | LOCAL_MEMORY]),
                ),
            ],
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn single_gpu() -> Self {
        let mut instance = Self::dual_gpu();
        instance.adapters.truncate(1);
        instance
    }

    pub fn display_adapter(&self) -> vk::PhysicalDevice {
        self.adapters[1].handle
    }

    pub fn render_memory(&self) -> MemoryTypeTable {
        self.adapters[0].memory.clone()
    }

    pub fn display_memory(&self) -> MemoryTypeTable {
        self.adapters[1].memory.clone()
    }

    pub fn created_devices(&self) -> Vec<CreatedDevice> {
        self.created.lock().clone()
    }
}

impl InstanceBackend for MockInstance {
    fn enumerate_adapters(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(self.adapters.iter().map(|adapter| adapter.handle).collect())
    }

    fn adapter_info(&self, adapter: vk::PhysicalDevice) -> Result<AdapterInfo> {
        self.adapters
            .iter()
            .find(|info| info.handle == adapter)
            .cloned()
            .ok_or(RelayError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))
    }

    fn create_device(
        &self,
        adapter: vk::PhysicalDevice,
        queue_family_index: u32,
        extensions: &[&CStr],
    ) -> Result<OpenedDevice> {
        let info = self.adapter_info(adapter)?;
        self.created.lock().push(CreatedDevice {
            adapter,
            queue_family_index,
            extensions: extensions
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        });
        let device = MockDevice::with_memory_types(info.memory.types);
        let queue = device.device_queue(queue_family_index, 0);
        let owner = device.clone();
        Ok(OpenedDevice {
            backend: device,
            queue,
            teardown: Some(Box::new(move || owner.mark_destroyed())),
        })
    }
}

unsafe extern "system" fn no_proc_addr(
    _instance: vk::Instance,
    _name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    None
}

/// Instance dispatch whose next-layer functions all come from `load`;
/// names it returns null for panic when called.
pub fn instance_dispatch_with(
    instance: vk::Instance,
    adapters: Vec<vk::PhysicalDevice>,
    pairing: Pairing,
    mut load: impl FnMut(&CStr) -> *const c_void,
) -> Arc<InstanceDispatch> {
    let (ash_instance, surface_fn) = unsafe {
        (
            ash::Instance::load_with(&mut load, instance),
            ash::khr::surface::InstanceFn::load(&mut load),
        )
    };
    Arc::new(InstanceDispatch {
        instance: ash_instance,
        next_proc_addr: no_proc_addr,
        surface_fn,
        adapters,
        pairing,
    })
}

pub fn instance_dispatch(
    instance: vk::Instance,
    adapters: Vec<vk::PhysicalDevice>,
    pairing: Pairing,
) -> Arc<InstanceDispatch> {
    instance_dispatch_with(instance, adapters, pairing, |_| ptr::null())
}

/// A stand-in dispatchable handle: a boxed word holding `key`, as the loader lays them out.
pub struct FakeDispatchable {
    word: Box<usize>,
}

impl FakeDispatchable {
    pub fn new(key: DispatchKey) -> Self {
        Self {
            word: Box::new(key.0),
        }
    }

    pub fn raw(&self) -> u64 {
        &*self.word as *const usize as usize as u64
    }
}

/// Instance that owns the harness render device and display initializer.
pub const HARNESS_INSTANCE: DispatchKey = DispatchKey(0x1);

/// A registry with a running display initializer and a render context, both over mocks.
pub struct Harness {
    pub registry: Registry,
    pub render_device: Arc<MockDevice>,
    pub display_device: Arc<MockDevice>,
    pub render: Arc<DeviceContext>,
}

pub fn harness() -> Harness {
    harness_with(RelayConfig::default())
}

pub fn harness_with(config: RelayConfig) -> Harness {
    let registry = Registry::new(config);
    let render_device = MockDevice::new();
    let display_device = MockDevice::new();
    let render = Arc::new(DeviceContext::new(
        render_device.clone(),
        vk::PhysicalDevice::from_raw(0x100),
        HARNESS_INSTANCE,
    ));
    let device = display_device.clone();
    registry
        .begin_secondary_context(HARNESS_INSTANCE, move || Ok(display_context(device)))
        .unwrap();
    Harness {
        registry,
        render_device,
        display_device,
        render,
    }
}

pub fn create_info(width: u32, height: u32, min_image_count: u32) -> vk::SwapchainCreateInfoKHR<'static> {
    vk::SwapchainCreateInfoKHR::default()
        .surface(vk::SurfaceKHR::from_raw(0x5))
        .min_image_count(min_image_count)
        .image_format(vk::Format::B8G8R8A8_UNORM)
        .image_extent(vk::Extent2D { width, height })
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::CONCURRENT)
}
