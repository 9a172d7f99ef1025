//! Device topology: which adapter renders and which one drives the display.
//!
//! With the default policy the first integrated adapter becomes the display
//! adapter and the first discrete adapter the render adapter. "First" follows
//! the enumeration order of the driver stack, which is not guaranteed to be
//! stable across driver versions; machines with several adapters of the same
//! type should pin the pair with `PairingPolicy::Indexed`.

use ash::vk;
use log::{debug, info};
use std::fmt;

use crate::error::{RelayError, Result};
use crate::memory::MemoryTypeTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterRole {
    Render,
    Display,
}

impl AdapterRole {
    fn wanted_type(self) -> vk::PhysicalDeviceType {
        match self {
            AdapterRole::Render => vk::PhysicalDeviceType::DISCRETE_GPU,
            AdapterRole::Display => vk::PhysicalDeviceType::INTEGRATED_GPU,
        }
    }
}

impl fmt::Display for AdapterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterRole::Render => f.write_str("render"),
            AdapterRole::Display => f.write_str("display"),
        }
    }
}

/// Snapshot of a physical adapter, immutable after enumeration.
#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub memory: MemoryTypeTable,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingPolicy {
    /// First discrete adapter renders, first integrated adapter displays.
    FirstMatch,
    /// Explicit enumeration indices.
    Indexed { render: usize, display: usize },
}

/// The render/display pair chosen for the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pairing {
    pub render: vk::PhysicalDevice,
    pub display: vk::PhysicalDevice,
}

pub fn resolve_topology(adapters: &[AdapterInfo], policy: PairingPolicy) -> Result<Pairing> {
    for (index, adapter) in adapters.iter().enumerate() {
        debug!(
            "Adapter {}: {} ({:?})",
            index, adapter.name, adapter.device_type
        );
    }

    let (render, display) = match policy {
        PairingPolicy::FirstMatch => (
            first_of(adapters, AdapterRole::Render)?,
            first_of(adapters, AdapterRole::Display)?,
        ),
        PairingPolicy::Indexed { render, display } => (
            indexed(adapters, render, AdapterRole::Render)?,
            indexed(adapters, display, AdapterRole::Display)?,
        ),
    };

    info!("Rendering on {}, presenting through {}", render.name, display.name);

    Ok(Pairing {
        render: render.handle,
        display: display.handle,
    })
}

fn first_of(adapters: &[AdapterInfo], role: AdapterRole) -> Result<&AdapterInfo> {
    adapters
        .iter()
        .find(|adapter| adapter.device_type == role.wanted_type())
        .ok_or(RelayError::AdapterNotFound(role))
}

fn indexed(adapters: &[AdapterInfo], index: usize, role: AdapterRole) -> Result<&AdapterInfo> {
    let adapter = adapters
        .get(index)
        .ok_or(RelayError::AdapterNotFound(role))?;
    if adapter.device_type != role.wanted_type() {
        return Err(RelayError::InitializationFailed(format!(
            "adapter {} ({}) is {:?}, cannot act as {} adapter",
            index, adapter.name, adapter.device_type, role
        )));
    }
    Ok(adapter)
}
