//! One-pool, one-buffer command recording contexts

use ash::vk;
use log::debug;
use std::sync::Arc;

use crate::backend::DeviceBackend;
use crate::error::Result;

/// Every relay command buffer is recorded for queue family 0.
pub const QUEUE_FAMILY_INDEX: u32 = 0;

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYER: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// A primary command buffer with its own resettable pool.
///
/// Recording starts on creation; call `end` before submitting.
pub struct CommandBuffer {
    device: Arc<dyn DeviceBackend>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Result<Self> {
        let pool = device.create_command_pool(QUEUE_FAMILY_INDEX)?;
        let cmd = match device.allocate_command_buffer(pool) {
            Ok(cmd) => cmd,
            Err(err) => {
                device.destroy_command_pool(pool);
                return Err(err.into());
            }
        };
        // From here on Drop releases both.
        let buffer = Self { device, pool, cmd };
        buffer.device.begin_command_buffer(cmd)?;
        debug!("Recording command buffer {:?}", cmd);
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Layout transition of the colour subresource of `image`.
    pub fn image_barrier(
        &self,
        image: vk::Image,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE);
        self.device
            .cmd_image_barrier(self.cmd, src_stage, dst_stage, &barrier);
    }

    /// Full-extent colour copy from `src` (TRANSFER_SRC_OPTIMAL) to `dst` (TRANSFER_DST_OPTIMAL).
    pub fn copy_image(&self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let region = vk::ImageCopy {
            src_subresource: COLOR_LAYER,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYER,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        self.device.cmd_copy_image(self.cmd, src, dst, &region);
    }

    pub fn end(&self) -> Result<()> {
        self.device.end_command_buffer(self.cmd)?;
        Ok(())
    }

    pub fn submit(&self, queue: vk::Queue, fence: vk::Fence) -> Result<()> {
        let cmds = [self.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        self.device.queue_submit(queue, &[submit], fence)?;
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.device.free_command_buffer(self.pool, self.cmd);
        self.device.destroy_command_pool(self.pool);
    }
}
