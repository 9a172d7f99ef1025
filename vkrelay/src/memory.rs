//! Memory type selection and host mappings of staging allocations

use ash::vk;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::DeviceBackend;
use crate::error::{RelayError, Result};

/// Memory-type table of one adapter, in the adapter's index order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryTypeTable {
    pub types: Vec<vk::MemoryPropertyFlags>,
}

impl MemoryTypeTable {
    pub fn new(types: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self { types }
    }

    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
        Self {
            types: properties.memory_types[..count]
                .iter()
                .map(|t| t.property_flags)
                .collect(),
        }
    }

    /// Lowest index whose flags contain `required`.
    pub fn find(&self, required: vk::MemoryPropertyFlags) -> Result<u32> {
        self.find_allowed(required, u32::MAX)
    }

    /// Lowest index whose flags contain `required` and whose bit is set in `type_bits`.
    pub fn find_allowed(&self, required: vk::MemoryPropertyFlags, type_bits: u32) -> Result<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(index, flags)| type_bits & (1 << index) != 0 && flags.contains(required))
            .map(|(index, _)| index as u32)
            .ok_or(RelayError::NoSuitableMemoryType(required))
    }
}

pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

pub const LOCAL_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

/// Host view of a whole allocation. Unmapped when the last holder drops it.
///
/// Once the owner of the allocation hands it over with [`adopt_allocation`],
/// the last holder also frees the memory.
///
/// [`adopt_allocation`]: MappedMemory::adopt_allocation
pub struct MappedMemory {
    device: Arc<dyn DeviceBackend>,
    memory: vk::DeviceMemory,
    data: *mut u8,
    size: u64,
    owns_allocation: AtomicBool,
}

// The mapping is only written by the transfer pipeline, which serializes
// presents per slot.
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    pub fn new(device: Arc<dyn DeviceBackend>, memory: vk::DeviceMemory, size: u64) -> Result<Self> {
        let data = device.map_memory(memory)?;
        debug!("Mapped {} bytes of {:?}", size, memory);
        Ok(Self {
            device,
            memory,
            data,
            size,
            owns_allocation: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Take over freeing the allocation when the last holder drops this mapping.
    pub fn adopt_allocation(&self) {
        self.owns_allocation.store(true, Ordering::Release);
    }

    /// Copy the first `len` bytes of this mapping into `dst`.
    pub fn copy_to(&self, dst: &MappedMemory, len: u64) -> Result<()> {
        let available = self.size.min(dst.size);
        if len > available {
            return Err(RelayError::MappedRangeTooSmall {
                needed: len,
                available,
            });
        }
        // SAFETY: both ranges are inside live mappings of distinct allocations.
        unsafe { std::ptr::copy_nonoverlapping(self.data, dst.data, len as usize) };
        Ok(())
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        self.device.unmap_memory(self.memory);
        debug!("Unmapped {:?}", self.memory);
        if self.owns_allocation.load(Ordering::Acquire) {
            self.device.free_memory(self.memory);
        }
    }
}
