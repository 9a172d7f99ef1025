//! Framebuffer images owned by shadow swapchain slots

use ash::vk;
use log::debug;
use std::sync::Arc;

use crate::backend::DeviceBackend;
use crate::error::{RelayError, Result};
use crate::memory::{MappedMemory, MemoryTypeTable};

/// How one of the three per-slot images is laid out.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
}

/// A 2D colour image with its own dedicated allocation.
pub struct FramebufferImage {
    device: Arc<dyn DeviceBackend>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<Arc<MappedMemory>>,
}

impl FramebufferImage {
    pub fn new(
        device: Arc<dyn DeviceBackend>,
        desc: &ImageDesc,
        memory_types: &MemoryTypeTable,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = device.create_image(&create_info)?;

        let requirements = device.image_memory_requirements(image);
        let memory_type =
            match memory_types.find_allowed(desc.memory, requirements.memory_type_bits) {
                Ok(index) => index,
                Err(err) => {
                    device.destroy_image(image);
                    return Err(err);
                }
            };
        let memory = match device.allocate_memory(requirements.size, memory_type) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_image(image);
                return Err(err.into());
            }
        };

        // From here on Drop releases both.
        let framebuffer = Self {
            device,
            image,
            memory,
            size: requirements.size,
            mapped: None,
        };
        framebuffer.device.bind_image_memory(image, memory)?;

        debug!(
            "Created {}x{} {:?} image {:?} ({} bytes, memory type {})",
            desc.extent.width, desc.extent.height, desc.tiling, image, requirements.size, memory_type
        );
        Ok(framebuffer)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Map the whole allocation for host access.
    pub fn map(&mut self) -> Result<Arc<MappedMemory>> {
        if let Some(mapped) = &self.mapped {
            return Ok(mapped.clone());
        }
        let mapped = Arc::new(MappedMemory::new(
            self.device.clone(),
            self.memory,
            self.size,
        )?);
        self.mapped = Some(mapped.clone());
        Ok(mapped)
    }

    pub fn mapped(&self) -> Result<Arc<MappedMemory>> {
        self.mapped
            .clone()
            .ok_or_else(|| RelayError::InvalidHandle(format!("image {:?} is not mapped", self.image)))
    }
}

impl Drop for FramebufferImage {
    fn drop(&mut self) {
        // A live mapping frees the memory after its last unmap.
        match self.mapped.take() {
            Some(mapped) => mapped.adopt_allocation(),
            None => self.device.free_memory(self.memory),
        }
        self.device.destroy_image(self.image);
    }
}
