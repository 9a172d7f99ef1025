//! Device backend abstraction
//!
//! The relay core never calls Vulkan directly. It talks to a `DeviceBackend`
//! per logical context and to an `InstanceBackend` while bringing up the
//! display context. `AshDevice` is the real implementation; the tests drive
//! the same code through an in-memory mock.

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::{c_void, CStr};
use std::ptr;
use std::sync::Arc;

use crate::error::Result;
use crate::topology::AdapterInfo;

/// Operations the relay needs on one logical context.
///
/// Handles passed in must have been created by the same backend.
pub trait DeviceBackend: Send + Sync {
    fn handle(&self) -> vk::Device;

    fn device_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue;

    // Images and memory

    fn create_image(&self, create_info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32)
        -> VkResult<vk::DeviceMemory>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Map the whole allocation for host access.
    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn free_memory(&self, memory: vk::DeviceMemory);

    // Command recording

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    );
    /// Copy between two images in TRANSFER_SRC_OPTIMAL / TRANSFER_DST_OPTIMAL layout.
    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageCopy,
    );

    // Synchronization and submission

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Err(vk::Result::TIMEOUT)` when the fence is still unsignaled after `timeout_ns`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    // VK_KHR_swapchain

    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(&self, queue: vk::Queue, present_info: &vk::PresentInfoKHR<'_>)
        -> VkResult<bool>;
}

/// Callback that destroys a logical context through the path that created it.
pub type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// A logical context opened through an `InstanceBackend`.
pub struct OpenedDevice {
    pub backend: Arc<dyn DeviceBackend>,
    /// Queue 0 of the requested family, usable by every layer below this one.
    pub queue: vk::Queue,
    pub teardown: Option<Teardown>,
}

/// Instance-level operations used while creating the display context.
pub trait InstanceBackend {
    /// Enumerate adapters with the display adapter revealed: render first, display second.
    fn enumerate_adapters(&self) -> Result<Vec<vk::PhysicalDevice>>;

    fn adapter_info(&self, adapter: vk::PhysicalDevice) -> Result<AdapterInfo>;

    /// Create a logical context with a single queue from `queue_family_index`.
    fn create_device(
        &self,
        adapter: vk::PhysicalDevice,
        queue_family_index: u32,
        extensions: &[&CStr],
    ) -> Result<OpenedDevice>;
}

/// Resolve a Vulkan entry point through a `vkGet*ProcAddr`-style function.
pub(crate) fn void_fn_ptr(function: vk::PFN_vkVoidFunction) -> *const c_void {
    function.map_or(ptr::null(), |f| f as *const c_void)
}

/// Real backend over an `ash::Device` and the raw `VK_KHR_swapchain` table.
pub struct AshDevice {
    device: ash::Device,
    swapchain_fn: ash::khr::swapchain::DeviceFn,
}

impl AshDevice {
    /// Load device functions through the next layer's `vkGetDeviceProcAddr`.
    /// # Safety
    /// `gdpa` must be a valid `vkGetDeviceProcAddr` for `device`.
    pub unsafe fn from_proc_addr(gdpa: vk::PFN_vkGetDeviceProcAddr, device: vk::Device) -> Self {
        let mut load = |name: &CStr| void_fn_ptr(gdpa(device, name.as_ptr()));
        Self {
            device: ash::Device::load_with(&mut load, device),
            swapchain_fn: ash::khr::swapchain::DeviceFn::load(&mut load),
        }
    }
}

// SAFETY (all methods below): every handle handed to this backend was
// created from `self.device`, and callers serialize access per queue.
impl DeviceBackend for AshDevice {
    fn handle(&self) -> vk::Device {
        self.device.handle()
    }

    fn device_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(queue_family_index, queue_index) }
    }

    fn create_image(&self, create_info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(create_info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<*mut u8> {
        unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map(|data| data as *mut u8)
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default();
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        }
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageCopy,
    ) {
        unsafe {
            self.device.cmd_copy_image(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(region),
            )
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { self.device.queue_submit(queue, submits, fence) }
    }

    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut swapchain = vk::SwapchainKHR::null();
        unsafe {
            (self.swapchain_fn.create_swapchain_khr)(
                self.device.handle(),
                create_info,
                ptr::null(),
                &mut swapchain,
            )
            .result_with_success(swapchain)
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe {
            (self.swapchain_fn.destroy_swapchain_khr)(self.device.handle(), swapchain, ptr::null())
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let device = self.device.handle();
        let get_images = self.swapchain_fn.get_swapchain_images_khr;
        unsafe {
            let mut count = 0u32;
            get_images(device, swapchain, &mut count, ptr::null_mut()).result()?;
            let mut images = vec![vk::Image::null(); count as usize];
            get_images(device, swapchain, &mut count, images.as_mut_ptr()).result()?;
            images.truncate(count as usize);
            Ok(images)
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut index = 0u32;
        let result = unsafe {
            (self.swapchain_fn.acquire_next_image_khr)(
                self.device.handle(),
                swapchain,
                timeout,
                semaphore,
                fence,
                &mut index,
            )
        };
        match result {
            vk::Result::SUCCESS => Ok((index, false)),
            vk::Result::SUBOPTIMAL_KHR => Ok((index, true)),
            err => Err(err),
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> VkResult<bool> {
        match unsafe { (self.swapchain_fn.queue_present_khr)(queue, present_info) } {
            vk::Result::SUCCESS => Ok(false),
            vk::Result::SUBOPTIMAL_KHR => Ok(true),
            err => Err(err),
        }
    }
}
