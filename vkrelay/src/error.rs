//! Error types for vkrelay

use ash::vk;
use std::time::Duration;
use thiserror::Error;

use crate::topology::AdapterRole;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Layer initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Loader did not provide a layer link in the create info chain")]
    MissingLayerLink,

    #[error("No {0} adapter found")]
    AdapterNotFound(AdapterRole),

    #[error("Display context initializer was never started")]
    SecondaryContextMissing,

    #[error("Display context creation failed: {0}")]
    SecondaryContextFailed(String),

    #[error("Device lost or hung: fence not signaled within {0:?}")]
    DeviceHung(Duration),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("No memory type with properties {0:?}")]
    NoSuitableMemoryType(vk::MemoryPropertyFlags),

    #[error("Format not supported: {0:?}")]
    FormatNotSupported(vk::Format),

    #[error("Mapped range too small: need {needed} bytes, have {available}")]
    MappedRangeTooSmall { needed: u64, available: u64 },

    #[error("Out of date")]
    OutOfDate,

    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<vk::Result> for RelayError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => RelayError::OutOfDate,
            other => RelayError::Vulkan(other),
        }
    }
}

impl RelayError {
    /// Convert RelayError to the Vulkan result code handed back to the application
    pub fn to_vk_result(&self) -> vk::Result {
        match self {
            RelayError::InitializationFailed(_)
            | RelayError::MissingLayerLink
            | RelayError::AdapterNotFound(_)
            | RelayError::SecondaryContextMissing
            | RelayError::SecondaryContextFailed(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            RelayError::DeviceHung(_) | RelayError::InvalidHandle(_) => {
                vk::Result::ERROR_DEVICE_LOST
            }
            RelayError::NoSuitableMemoryType(_) | RelayError::MappedRangeTooSmall { .. } => {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
            RelayError::FormatNotSupported(_) => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            RelayError::OutOfDate => vk::Result::ERROR_OUT_OF_DATE_KHR,
            RelayError::Vulkan(result) => *result,
        }
    }
}
