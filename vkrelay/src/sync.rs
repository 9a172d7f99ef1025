//! Fences used to make every relay step synchronous

use ash::vk;
use log::error;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::DeviceBackend;
use crate::error::{RelayError, Result};

/// Unsignaled fence, destroyed on drop.
pub struct Fence {
    device: Arc<dyn DeviceBackend>,
    fence: vk::Fence,
}

impl Fence {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Result<Self> {
        let fence = device.create_fence()?;
        Ok(Self { device, fence })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence signals. Running out of `timeout` means the
    /// device is considered hung; the wait is not retried.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match self.device.wait_for_fence(self.fence, timeout_ns) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                error!("Fence {:?} not signaled after {:?}", self.fence, timeout);
                Err(RelayError::DeviceHung(timeout))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}
