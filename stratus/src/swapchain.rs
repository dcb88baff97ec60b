// The presentable image ring
//
// The swapchain owns the surface-format decision, the image ring and
// its views/framebuffers, and one {image-available semaphore,
// render-finished semaphore, in-flight fence} triplet per frame in
// flight. The acquire/present loop and the out-of-date bookkeeping
// live here; recreation destroys only the image-dependent objects and
// reuses the sync triplets.

use ash::extensions::khr;
use ash::vk;

use crate::backend::Backend;
use crate::framebuffer::Framebuffer;
use crate::item_renderer::SyncInfo;
use crate::render_pass::RenderPass;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// What an acquire or present result means for the swapchain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SurfaceState {
    Usable,
    /// Usable this frame but should be recreated soon
    Suboptimal,
    /// Unusable, must be recreated before the next frame
    OutOfDate,
    Failed(vk::Result),
}

pub(crate) fn classify_surface_result<T>(res: std::result::Result<T, vk::Result>, suboptimal: bool) -> SurfaceState {
    match res {
        Ok(_) if suboptimal => SurfaceState::Suboptimal,
        Ok(_) => SurfaceState::Usable,
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => SurfaceState::OutOfDate,
        Err(vk::Result::SUBOPTIMAL_KHR) => SurfaceState::Suboptimal,
        Err(e) => SurfaceState::Failed(e),
    }
}

pub struct Swapchain {
    backend: Arc<Backend>,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,

    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,

    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<Framebuffer>,
    render_pass: Option<Arc<RenderPass>>,

    image_available: [vk::Semaphore; MAX_FRAMES_IN_FLIGHT],
    render_finished: [vk::Semaphore; MAX_FRAMES_IN_FLIGHT],
    in_flight: [vk::Fence; MAX_FRAMES_IN_FLIGHT],

    current_frame: usize,
    current_image_index: u32,
    needs_recreation: bool,
}

impl Swapchain {
    pub fn new(backend: Arc<Backend>, surface: vk::SurfaceKHR, size: (u32, u32)) -> Result<Swapchain> {
        let surface_loader = khr::Surface::new(&backend.loader, &backend.inst);
        let swapchain_loader = khr::Swapchain::new(&backend.inst, &backend.dev);

        let mut ret = Swapchain {
            backend: backend,
            surface: surface,
            surface_loader: surface_loader,
            swapchain_loader: swapchain_loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: None,
            image_available: [vk::Semaphore::null(); MAX_FRAMES_IN_FLIGHT],
            render_finished: [vk::Semaphore::null(); MAX_FRAMES_IN_FLIGHT],
            in_flight: [vk::Fence::null(); MAX_FRAMES_IN_FLIGHT],
            current_frame: 0,
            current_image_index: 0,
            needs_recreation: false,
        };

        ret.create_swapchain(size)?;
        ret.create_image_views()?;
        ret.create_render_pass()?;
        ret.create_framebuffers()?;
        ret.create_sync_objects()?;

        Ok(ret)
    }

    pub fn is_valid(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        self.render_pass.as_ref().unwrap()
    }

    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    ///
    /// Prefer BGRA8 sRGB, fall back to BGRA8 UNORM, then to whatever
    /// the surface offers first.
    fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
        if let Some(fmt) = formats.iter().find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        }) {
            return Ok(*fmt);
        }

        if let Some(fmt) = formats
            .iter()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        {
            return Ok(*fmt);
        }

        formats.first().copied().ok_or(StratusError::INVALID_FORMAT)
    }

    /// Prefer mailbox for low latency; FIFO is always available.
    fn select_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        modes
            .iter()
            .cloned()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }

    fn select_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: (u32, u32)) -> vk::Extent2D {
        if caps.current_extent.width != u32::MAX {
            return caps.current_extent;
        }

        vk::Extent2D {
            width: requested
                .0
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .1
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }

    fn create_swapchain(&mut self, size: (u32, u32)) -> Result<()> {
        let pdev = self.backend.pdev;
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(pdev, self.surface)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(pdev, self.surface)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(pdev, self.surface)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        let surface_format = Self::select_surface_format(&formats)?;
        let present_mode = Self::select_present_mode(&present_modes);
        let extent = Self::select_extent(&caps, size);

        // one more than the minimum gets us triple buffering when the
        // surface allows it
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        self.swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        self.format = surface_format.format;
        self.extent = extent;

        self.images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(self.swapchain)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        log::debug!(
            "Created swapchain with {} images, {}x{}, format {:?}",
            self.images.len(),
            extent.width,
            extent.height,
            self.format
        );
        Ok(())
    }

    fn create_image_views(&mut self) -> Result<()> {
        self.views.clear();
        for image in self.images.iter() {
            let info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe {
                self.backend
                    .dev
                    .create_image_view(&info, None)
                    .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?
            };
            self.views.push(view);
        }
        Ok(())
    }

    fn create_render_pass(&mut self) -> Result<()> {
        self.render_pass = Some(RenderPass::new_for_presentation(
            self.backend.clone(),
            self.format,
        )?);
        Ok(())
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        let pass = self.render_pass.as_ref().unwrap().clone();
        let size = (self.extent.width, self.extent.height);

        self.framebuffers.clear();
        for view in self.views.iter() {
            self.framebuffers.push(Framebuffer::new(
                self.backend.clone(),
                pass.clone(),
                *view,
                None,
                size,
            )?);
        }

        // images and framebuffers always pair up
        assert!(self.framebuffers.len() == self.images.len());
        Ok(())
    }

    fn create_sync_objects(&mut self) -> Result<()> {
        let sema_info = vk::SemaphoreCreateInfo::default();
        // fences start signaled so the first wait_for_fence passes
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        for i in 0..MAX_FRAMES_IN_FLIGHT {
            unsafe {
                self.image_available[i] = self
                    .backend
                    .dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(StratusError::INIT_FAILED))?;
                self.render_finished[i] = self
                    .backend
                    .dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(StratusError::INIT_FAILED))?;
                self.in_flight[i] = self
                    .backend
                    .dev
                    .create_fence(&fence_info, None)
                    .or(Err(StratusError::INIT_FAILED))?;
            }
        }
        Ok(())
    }

    /// Block until the current frame slot's previous submission has
    /// retired.
    pub fn wait_for_fence(&self) {
        unsafe {
            let _ = self.backend.dev.wait_for_fences(
                &[self.in_flight[self.current_frame]],
                true,
                u64::MAX,
            );
        }
    }

    pub fn reset_fence(&self) {
        unsafe {
            let _ = self
                .backend
                .dev
                .reset_fences(&[self.in_flight[self.current_frame]]);
        }
    }

    /// Acquire the next presentable image, signaling this frame's
    /// image-available semaphore.
    ///
    /// The returned index is chosen by the driver and has no relation
    /// to `current_frame`. On out-of-date or suboptimal surfaces the
    /// recreation flag is set; out-of-date additionally fails the
    /// acquire.
    pub fn acquire_next_image(&mut self) -> Result<u32> {
        let res = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available[self.current_frame],
                vk::Fence::null(),
            )
        };

        match res {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal, needs recreation");
                    self.needs_recreation = true;
                }
                self.current_image_index = index;
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                log::debug!("Swapchain out of date, needs recreation");
                self.needs_recreation = true;
                Err(StratusError::OUT_OF_DATE)
            }
            Err(e) => {
                log::error!("Failed to acquire swapchain image: {:?}", e);
                Err(StratusError::COULD_NOT_ACQUIRE_NEXT_IMAGE)
            }
        }
    }

    pub fn current_framebuffer(&self) -> Option<&Framebuffer> {
        self.framebuffers.get(self.current_image_index as usize)
    }

    /// The sync triplet for the current frame slot. The consumer
    /// submits with wait=image_available, signal=render_finished,
    /// fence=in_flight, and present waits on render_finished.
    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo {
            image_available: self.image_available[self.current_frame],
            render_finished: self.render_finished[self.current_frame],
            in_flight: self.in_flight[self.current_frame],
        }
    }

    /// Present the acquired image, waiting on this frame's
    /// render-finished semaphore.
    pub fn present(&mut self) -> Result<()> {
        let wait_semas = [self.render_finished[self.current_frame]];
        let swapchains = [self.swapchain];
        let indices = [self.current_image_index];

        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let res =
            unsafe { self.swapchain_loader.queue_present(self.backend.graphics_queue(), &info) };

        match classify_surface_result(res, res.unwrap_or(false)) {
            SurfaceState::Usable => Ok(()),
            SurfaceState::Suboptimal => {
                self.needs_recreation = true;
                Ok(())
            }
            SurfaceState::OutOfDate => {
                log::debug!("Swapchain out of date after present");
                self.needs_recreation = true;
                Err(StratusError::OUT_OF_DATE)
            }
            SurfaceState::Failed(e) => {
                log::error!("vkQueuePresent failed: {:?}", e);
                Err(StratusError::PRESENT_FAILED)
            }
        }
    }

    /// Step to the next frame slot.
    pub fn advance_frame(&mut self) {
        self.current_frame = next_frame(self.current_frame);
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Tear down the image-dependent objects and rebuild them at the
    /// new size. Sync objects are reused.
    pub fn recreate(&mut self, size: (u32, u32)) -> Result<()> {
        unsafe {
            let _ = self.backend.dev.device_wait_idle();
        }

        self.destroy_image_objects();

        self.create_swapchain(size)?;
        self.create_image_views()?;
        self.create_render_pass()?;
        self.create_framebuffers()?;

        self.needs_recreation = false;
        Ok(())
    }

    fn destroy_image_objects(&mut self) {
        self.framebuffers.clear();
        self.render_pass = None;

        unsafe {
            for view in self.views.drain(..) {
                self.backend.dev.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

/// The frame-slot sequence: 0, 1, 0, 1, ...
pub(crate) fn next_frame(current: usize) -> usize {
    (current + 1) % MAX_FRAMES_IN_FLIGHT
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.backend.dev.device_wait_idle();

            for i in 0..MAX_FRAMES_IN_FLIGHT {
                if self.render_finished[i] != vk::Semaphore::null() {
                    self.backend.dev.destroy_semaphore(self.render_finished[i], None);
                }
                if self.image_available[i] != vk::Semaphore::null() {
                    self.backend.dev.destroy_semaphore(self.image_available[i], None);
                }
                if self.in_flight[i] != vk::Fence::null() {
                    self.backend.dev.destroy_fence(self.in_flight[i], None);
                }
            }
        }

        self.destroy_image_objects();
        // the surface is owned by the output layer that created it
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slots_alternate() {
        let mut frame = 0;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(frame);
            frame = next_frame(frame);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn out_of_date_is_flagged_not_fatal() {
        let state = classify_surface_result::<()>(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), false);
        assert_eq!(state, SurfaceState::OutOfDate);

        let state = classify_surface_result::<()>(Err(vk::Result::SUBOPTIMAL_KHR), false);
        assert_eq!(state, SurfaceState::Suboptimal);

        let state = classify_surface_result(Ok(()), true);
        assert_eq!(state, SurfaceState::Suboptimal);

        let state = classify_surface_result(Ok(()), false);
        assert_eq!(state, SurfaceState::Usable);

        let state = classify_surface_result::<()>(Err(vk::Result::ERROR_DEVICE_LOST), false);
        assert_eq!(state, SurfaceState::Failed(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = Swapchain::select_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn surface_format_falls_back_to_bgra_unorm() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = Swapchain::select_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            Swapchain::select_present_mode(&modes),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            Swapchain::select_present_mode(&[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }
}
