//! Colour formats the relay can move between adapters

use ash::vk;

use crate::error::{RelayError, Result};

/// Every relayed texel is 4 bytes; the host hop copies raw texels without conversion.
pub const BYTES_PER_TEXEL: u64 = 4;

/// Accept 8-bit-per-channel BGRA/RGBA swapchain formats, reject the rest.
pub fn relay_format(format: vk::Format) -> Result<vk::Format> {
    match format {
        vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB => Ok(format),
        other => Err(RelayError::FormatNotSupported(other)),
    }
}

/// Bytes moved through host memory for one frame of `extent`.
pub fn frame_bytes(extent: vk::Extent2D) -> u64 {
    BYTES_PER_TEXEL * u64::from(extent.width) * u64::from(extent.height)
}
