//! vkrelay - Vulkan render-offload layer
//!
//! An implicit Vulkan layer for dual-GPU machines where the fast adapter has
//! no display attached. The application renders on the discrete adapter; each
//! presented frame is copied through host-visible memory to the integrated
//! adapter, which owns the real swapchain and scans it out.
//!
//! Architecture:
//! ```text
//! App → vkQueuePresentKHR → render image (discrete)
//!     → linear copy (discrete) → host memcpy → linear image (integrated)
//!     → display swapchain image (integrated) → present
//! ```

pub mod backend;
pub mod error;
pub mod handle;
pub mod config;
pub mod format;
pub mod topology;
pub mod link;
pub mod instance;
pub mod device;
pub mod memory;
pub mod image;
pub mod command_buffer;
pub mod sync;
pub mod secondary;
pub mod registry;
pub mod swapchain;
pub mod transfer;
pub mod layer;

#[cfg(test)]
mod testing;

use env_logger::Env;
use log::info;

/// Initialize logging for the layer. Safe to call more than once.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().filter_or("VKRELAY_LOG", "info"))
        .try_init();

    info!("vkrelay v{} initialized", env!("CARGO_PKG_VERSION"));
}
