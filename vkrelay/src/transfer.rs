//! Per-present frame transfer from the render adapter to the display adapter.
//!
//! Three hops, each finished before the next starts:
//! 1. render image → render copy, on the render adapter;
//! 2. render copy → display staging source, a plain memcpy between the two
//!    host mappings;
//! 3. display staging source → presentable image, on the display adapter.
//!
//! Hop 2 is the only place pixels cross between adapters and dominates the
//! cost of a present. It copies raw texels, so it is only correct for the
//! 4-byte formats accepted by `format::relay_format`.

use ash::vk;
use log::trace;
use std::time::Instant;

use crate::command_buffer::CommandBuffer;
use crate::error::Result;
use crate::format::frame_bytes;
use crate::swapchain::{ShadowSwapchain, Slot};
use crate::sync::Fence;

/// Run hops 1 to 3 for `slot` and return the number of bytes moved through host memory.
pub fn relay_frame(swapchain: &ShadowSwapchain, slot: &Slot) -> Result<u64> {
    let started = Instant::now();
    copy_render_to_host(swapchain, slot)?;
    let hop1 = started.elapsed();

    let bytes = move_through_host(slot, swapchain.extent)?;
    let hop2 = started.elapsed() - hop1;

    copy_host_to_display(swapchain, slot)?;
    let total = started.elapsed();

    trace!(
        "Relayed {} bytes: render {:?}, host {:?}, display {:?}",
        bytes,
        hop1,
        hop2,
        total - hop1 - hop2
    );
    Ok(bytes)
}

fn copy_render_to_host(swapchain: &ShadowSwapchain, slot: &Slot) -> Result<()> {
    let device = &swapchain.render.backend;
    let cmd = CommandBuffer::new(device.clone())?;
    let render_image = slot.render_image.handle();
    let render_copy = slot.render_copy.handle();

    cmd.image_barrier(
        render_copy,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.image_barrier(
        render_image,
        vk::AccessFlags::MEMORY_READ,
        vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.copy_image(render_image, render_copy, swapchain.extent);
    cmd.image_barrier(
        render_copy,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::GENERAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.image_barrier(
        render_image,
        vk::AccessFlags::TRANSFER_READ,
        vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.end()?;

    let fence = Fence::new(device.clone())?;
    cmd.submit(swapchain.render_queue, fence.handle())?;
    fence.wait(swapchain.fence_timeout)
}

fn move_through_host(slot: &Slot, extent: vk::Extent2D) -> Result<u64> {
    let bytes = frame_bytes(extent);
    let src = slot.render_copy.mapped()?;
    let dst = slot.display_src.mapped()?;
    src.copy_to(&dst, bytes)?;
    Ok(bytes)
}

fn copy_host_to_display(swapchain: &ShadowSwapchain, slot: &Slot) -> Result<()> {
    let display = &swapchain.display;
    let cmd = slot
        .display_commands
        .get_or_try_init(|| record_display_copy(swapchain, slot))?;

    let fence = Fence::new(display.backend.clone())?;
    cmd.submit(display.queue, fence.handle())?;
    fence.wait(swapchain.fence_timeout)
}

/// Commands for hop 3. Both images are fixed for the slot's lifetime, so the
/// buffer is recorded once and resubmitted on every present.
fn record_display_copy(swapchain: &ShadowSwapchain, slot: &Slot) -> Result<CommandBuffer> {
    let cmd = CommandBuffer::new(swapchain.display.backend.clone())?;
    let display_src = slot.display_src.handle();
    let display_image = slot.display_image;

    cmd.image_barrier(
        display_src,
        vk::AccessFlags::MEMORY_WRITE,
        vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.image_barrier(
        display_image,
        vk::AccessFlags::MEMORY_READ,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.copy_image(display_src, display_image, swapchain.extent);
    cmd.image_barrier(
        display_src,
        vk::AccessFlags::TRANSFER_READ,
        vk::AccessFlags::MEMORY_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::GENERAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.image_barrier(
        display_image,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    );
    cmd.end()?;
    Ok(cmd)
}
