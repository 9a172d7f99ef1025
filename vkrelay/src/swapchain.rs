//! Shadow swapchains
//!
//! The application gets a swapchain whose images live on the render adapter.
//! Behind it sits a real swapchain on the display adapter plus, per image
//! slot, the staging images the transfer pipeline copies through:
//!
//! ```text
//! render image ──hop 1──▶ render copy ══hop 2══▶ display src ──hop 3──▶ presentable image
//!  (render, local)        (render, host)          (display, host)       (display swapchain)
//! ```

use ash::vk;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use crate::command_buffer::{CommandBuffer, QUEUE_FAMILY_INDEX};
use crate::config::MIN_SLOT_COUNT;
use crate::device::{DeviceContext, DisplayContext};
use crate::error::{RelayError, Result};
use crate::format::relay_format;
use crate::image::{FramebufferImage, ImageDesc};
use crate::memory::{HOST_MEMORY, LOCAL_MEMORY};
use crate::registry::Registry;
use crate::sync::Fence;
use crate::transfer;

/// Per-image resources of a shadow swapchain.
pub struct Slot {
    /// Hop 3 commands, recorded on the first present of this slot.
    pub display_commands: OnceCell<CommandBuffer>,
    pub render_image: FramebufferImage,
    pub render_copy: FramebufferImage,
    pub display_src: FramebufferImage,
    /// Presentable image of the display swapchain.
    pub display_image: vk::Image,
}

/// Slot resources built before the display swapchain exists.
struct StagedSlot {
    render_image: FramebufferImage,
    render_copy: FramebufferImage,
    display_src: FramebufferImage,
}

struct SlotLayout {
    format: vk::Format,
    extent: vk::Extent2D,
    render_usage: vk::ImageUsageFlags,
    fence_timeout: Duration,
}

impl StagedSlot {
    fn new(render: &DeviceContext, display: &DisplayContext, layout: &SlotLayout) -> Result<Self> {
        let desc = |tiling, usage, memory| ImageDesc {
            format: layout.format,
            extent: layout.extent,
            tiling,
            usage,
            memory,
        };

        let render_image = FramebufferImage::new(
            render.backend.clone(),
            &desc(vk::ImageTiling::OPTIMAL, layout.render_usage, LOCAL_MEMORY),
            &display.render_memory,
        )?;
        let mut render_copy = FramebufferImage::new(
            render.backend.clone(),
            &desc(
                vk::ImageTiling::LINEAR,
                vk::ImageUsageFlags::TRANSFER_DST,
                HOST_MEMORY,
            ),
            &display.render_memory,
        )?;
        let mut display_src = FramebufferImage::new(
            display.backend.clone(),
            &desc(
                vk::ImageTiling::LINEAR,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                HOST_MEMORY,
            ),
            &display.display_memory,
        )?;

        render_copy.map()?;
        display_src.map()?;

        let cmd = CommandBuffer::new(display.backend.clone())?;
        cmd.image_barrier(
            display_src.handle(),
            vk::AccessFlags::empty(),
            vk::AccessFlags::MEMORY_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        );
        cmd.end()?;
        let fence = Fence::new(display.backend.clone())?;
        cmd.submit(display.queue, fence.handle())?;
        fence.wait(layout.fence_timeout)?;

        Ok(Self {
            render_image,
            render_copy,
            display_src,
        })
    }

    fn attach(self, display_image: vk::Image) -> Slot {
        Slot {
            display_commands: OnceCell::new(),
            render_image: self.render_image,
            render_copy: self.render_copy,
            display_src: self.display_src,
            display_image,
        }
    }
}

pub struct ShadowSwapchain {
    pub render: Arc<DeviceContext>,
    pub render_queue: vk::Queue,
    pub display: Arc<DisplayContext>,
    /// The real swapchain on the display adapter.
    pub backend: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub slots: Vec<Slot>,
    pub fence_timeout: Duration,
    keep_backend: bool,
}

impl ShadowSwapchain {
    pub fn image_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: u32) -> Result<&Slot> {
        self.slots.get(index as usize).ok_or_else(|| {
            RelayError::InvalidHandle(format!(
                "image index {} out of range for {} slots",
                index,
                self.slots.len()
            ))
        })
    }

    fn acquire(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool)> {
        let acquired = Fence::new(self.display.backend.clone())?;
        let (index, suboptimal) = self.display.backend.acquire_next_image(
            self.backend,
            timeout,
            vk::Semaphore::null(),
            acquired.handle(),
        )?;
        acquired.wait(self.fence_timeout)?;
        self.slot(index)?;

        // Empty submit on the render side stands in for the signal the
        // display-side acquire never gave.
        let signals = [semaphore];
        let mut submit = vk::SubmitInfo::default();
        if semaphore != vk::Semaphore::null() {
            submit = submit.signal_semaphores(&signals);
        }
        self.render
            .backend
            .queue_submit(self.render_queue, &[submit], fence)?;

        debug!("Acquired image {} of {:?}", index, self.backend);
        Ok((index, suboptimal))
    }

    fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let slot = self.slot(image_index)?;

        if !wait_semaphores.is_empty() {
            let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
            let submit = vk::SubmitInfo::default()
                .wait_semaphores(wait_semaphores)
                .wait_dst_stage_mask(&stages);
            let waited = Fence::new(self.render.backend.clone())?;
            self.render
                .backend
                .queue_submit(queue, &[submit], waited.handle())?;
            waited.wait(self.fence_timeout)?;
        }

        transfer::relay_frame(self, slot)?;

        let swapchains = [self.backend];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&indices);
        Ok(self
            .display
            .backend
            .queue_present(self.display.queue, &present_info)?)
    }
}

impl Drop for ShadowSwapchain {
    fn drop(&mut self) {
        // Slot images and mappings go first; they may reference the presentable images.
        self.slots.clear();
        if self.keep_backend {
            warn!("Leaving display swapchain {:?} alive", self.backend);
        } else {
            self.display.backend.destroy_swapchain(self.backend);
        }
        info!("Destroyed shadow swapchain over {:?}", self.backend);
    }
}

/// Create a shadow swapchain for `render` and return the handle the application sees.
pub fn create_shadow_swapchain(
    registry: &Registry,
    render: &Arc<DeviceContext>,
    create_info: &vk::SwapchainCreateInfoKHR<'_>,
) -> Result<vk::SwapchainKHR> {
    let display = registry.join_secondary_context(render.instance)?;
    let render_queue = render.queue(QUEUE_FAMILY_INDEX, 0)?;

    let previous = if create_info.old_swapchain == vk::SwapchainKHR::null() {
        None
    } else {
        Some(registry.swapchain(create_info.old_swapchain)?)
    };

    let config = registry.config();
    let image_count = create_info
        .min_image_count
        .max(config.min_image_count)
        .max(MIN_SLOT_COUNT);
    let layout = SlotLayout {
        format: relay_format(create_info.image_format)?,
        extent: create_info.image_extent,
        render_usage: create_info.image_usage
            | vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC,
        fence_timeout: config.fence_timeout,
    };

    // Fail before allocating anything if an adapter lacks a memory type.
    display.render_memory.find(LOCAL_MEMORY)?;
    display.render_memory.find(HOST_MEMORY)?;
    display.display_memory.find(HOST_MEMORY)?;

    info!(
        "Creating shadow swapchain: {}x{} {:?}, {} images (requested {})",
        layout.extent.width,
        layout.extent.height,
        layout.format,
        image_count,
        create_info.min_image_count
    );

    let mut staged = Vec::with_capacity(image_count as usize);
    for _ in 0..image_count {
        staged.push(StagedSlot::new(render, &display, &layout)?);
    }

    let mut backend_info = *create_info;
    backend_info.p_next = std::ptr::null();
    backend_info.min_image_count = image_count;
    backend_info.image_usage |= vk::ImageUsageFlags::TRANSFER_DST;
    backend_info.image_sharing_mode = vk::SharingMode::EXCLUSIVE;
    backend_info.queue_family_index_count = 0;
    backend_info.p_queue_family_indices = std::ptr::null();
    backend_info.old_swapchain = previous
        .as_ref()
        .map_or(vk::SwapchainKHR::null(), |previous| previous.backend);
    let backend = display.backend.create_swapchain(&backend_info)?;

    let slots = match attach_presentable_images(render, &display, &layout, backend, staged) {
        Ok(slots) => slots,
        Err(err) => {
            display.backend.destroy_swapchain(backend);
            return Err(err);
        }
    };

    let swapchain = Arc::new(ShadowSwapchain {
        render: render.clone(),
        render_queue,
        display,
        backend,
        extent: layout.extent,
        slots,
        fence_timeout: layout.fence_timeout,
        keep_backend: config.keep_backend_swapchain,
    });
    let handle = registry.insert_swapchain(swapchain);
    debug!("Shadow swapchain {:?} wraps {:?}", handle, backend);
    Ok(handle)
}

fn attach_presentable_images(
    render: &DeviceContext,
    display: &DisplayContext,
    layout: &SlotLayout,
    backend: vk::SwapchainKHR,
    mut staged: Vec<StagedSlot>,
) -> Result<Vec<Slot>> {
    let images = display.backend.swapchain_images(backend)?;
    if images.len() < staged.len() {
        return Err(RelayError::InitializationFailed(format!(
            "display swapchain returned {} images, {} requested",
            images.len(),
            staged.len()
        )));
    }
    while staged.len() < images.len() {
        debug!("Display swapchain has extra image {}", staged.len());
        staged.push(StagedSlot::new(render, display, layout)?);
    }
    Ok(staged
        .into_iter()
        .zip(images)
        .map(|(slot, image)| slot.attach(image))
        .collect())
}

pub fn destroy_shadow_swapchain(registry: &Registry, handle: vk::SwapchainKHR) -> Result<()> {
    let swapchain = registry.remove_swapchain(handle)?;
    if Arc::strong_count(&swapchain) > 1 {
        debug!("Swapchain {:?} still in use; released by its last user", handle);
    }
    drop(swapchain);
    Ok(())
}

/// The render-target images the application draws into, in slot order.
pub fn swapchain_images(registry: &Registry, handle: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
    let swapchain = registry.swapchain(handle)?;
    Ok(swapchain
        .slots
        .iter()
        .map(|slot| slot.render_image.handle())
        .collect())
}

/// Acquire a display image and signal the caller's semaphore and fence on the render side.
pub fn acquire_next(
    registry: &Registry,
    handle: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<(u32, bool)> {
    registry.swapchain(handle)?.acquire(timeout, semaphore, fence)
}

/// Wait for the caller's semaphores, move the frame to the display adapter and present it.
///
/// Returns whether the display swapchain reported itself suboptimal.
pub fn present(
    registry: &Registry,
    queue: vk::Queue,
    handle: vk::SwapchainKHR,
    image_index: u32,
    wait_semaphores: &[vk::Semaphore],
) -> Result<bool> {
    registry
        .swapchain(handle)?
        .present(queue, image_index, wait_semaphores)
}
