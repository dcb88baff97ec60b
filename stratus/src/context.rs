// The per-thread rendering context
//
// Sole owner of the command pool, the descriptor pool, the pipeline
// cache, and the streaming vertex arena. Resources allocated through a
// context are destroyed through its deferred destruction queue, never
// in place. There is one context per rendering thread; for this
// compositor that means exactly one.

use ash::vk;

use crate::allocator::Allocator;
use crate::backend::Backend;
use crate::buffer::Buffer;
use crate::deletion::DeletionQueue;
use crate::format::{drm_format_to_vk_format, yuv_plane_layout};
use crate::item_renderer::FrameTarget;
use crate::pipeline_cache::PipelineCache;
use crate::texture::Texture;
use crate::{MemImage, Result, StratusError};
use utils::log;

use nix::fcntl::{fcntl, FcntlArg};
use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The streaming vertex arena is at least 4 MiB, host visible and
/// persistently mapped.
const STREAMING_BUFFER_SIZE: vk::DeviceSize = 4 * 1024 * 1024;

/// Descriptor sets provisioned per output. The pool is reset rather
/// than freed set-by-set, so this is sized for a full frame of draws.
const DESCRIPTOR_SETS_PER_OUTPUT: u32 = 15_000;

thread_local! {
    static CURRENT_CONTEXT: Cell<u64> = Cell::new(0);
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One dmabuf plane: the fd plus its layout within the buffer.
#[derive(Debug)]
pub struct DmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Everything DRI3 tells us about a client buffer.
#[derive(Debug)]
pub struct DmaBufAttributes {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc of the whole buffer
    pub format: u32,
    pub modifier: u64,
    pub planes: Vec<DmaBufPlane>,
}

pub struct Context {
    backend: Arc<Backend>,
    allocator: Arc<Allocator>,
    deletion: Arc<DeletionQueue>,

    command_pool: vk::CommandPool,

    descriptor_pool: vk::DescriptorPool,
    descriptor_pool_max_sets: u32,
    descriptor_alloc_count: u32,

    pipelines: PipelineCache,
    streaming: Option<Buffer>,

    /// Stack of render targets being drawn into; the top is the one
    /// draws currently land in. Nested entries are offscreen targets.
    framebuffer_stack: Vec<FrameTarget>,

    /// Lazily created fence for submissions that have no swapchain
    /// fence to ride on
    fence: vk::Fence,
    /// The in-flight fence of the last begun frame, guards descriptor
    /// pool resets
    last_frame_fence: vk::Fence,

    /// 1x1 opaque white, bound when a draw has no sampled texture
    white_texture: Option<Arc<Texture>>,

    supports_dmabuf_import: bool,

    id: u64,
}

/// Deferred guard returning a frame command buffer to the pool.
pub(crate) struct DeferredCommandBuffer {
    pub dev: ash::Device,
    pub pool: vk::CommandPool,
    pub cbuf: vk::CommandBuffer,
}

impl Drop for DeferredCommandBuffer {
    fn drop(&mut self) {
        unsafe { self.dev.free_command_buffers(self.pool, &[self.cbuf]) };
    }
}

impl Context {
    /// Create the context for this thread.
    ///
    /// `outputs` scales the descriptor pool: each output gets
    /// DESCRIPTOR_SETS_PER_OUTPUT sets of headroom.
    pub fn new(backend: Arc<Backend>, outputs: u32) -> Result<Context> {
        let allocator = Allocator::new(&backend)?;
        let deletion = Arc::new(DeletionQueue::new());

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(backend.graphics_queue_family());
        let command_pool = unsafe {
            backend
                .device()
                .create_command_pool(&pool_info, None)
                .or(Err(StratusError::INIT_FAILED))?
        };

        let max_sets = outputs.max(1) * DESCRIPTOR_SETS_PER_OUTPUT;
        let descriptor_pool = Self::create_descriptor_pool(&backend, max_sets)?;

        let pipelines = PipelineCache::new(backend.clone());

        let streaming = Buffer::new_streaming_raw(
            allocator.clone(),
            deletion.clone(),
            STREAMING_BUFFER_SIZE,
        )?;

        // dmabuf import needs VK_EXT_external_memory_dma_buf; probed
        // once at device creation and cached on the backend
        let supports_dmabuf_import = backend.supports_dmabuf();
        log::debug!("Context created, dmabuf import: {}", supports_dmabuf_import);

        Ok(Context {
            backend: backend,
            allocator: allocator,
            deletion: deletion,
            command_pool: command_pool,
            descriptor_pool: descriptor_pool,
            descriptor_pool_max_sets: max_sets,
            descriptor_alloc_count: 0,
            pipelines: pipelines,
            streaming: Some(streaming),
            framebuffer_stack: Vec::new(),
            fence: vk::Fence::null(),
            last_frame_fence: vk::Fence::null(),
            white_texture: None,
            supports_dmabuf_import: supports_dmabuf_import,
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn create_descriptor_pool(backend: &Backend, max_sets: u32) -> Result<vk::DescriptorPool> {
        // uniform : sampler : storage provisioned 1:10:1 relative to
        // the set count
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 10,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
        ];

        // no FREE_DESCRIPTOR_SET: sets are never freed individually,
        // the whole pool is reset instead
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(max_sets);

        unsafe {
            backend
                .device()
                .create_descriptor_pool(&info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    /// Make this context the active one for the calling thread.
    pub fn make_current(&self) {
        CURRENT_CONTEXT.with(|c| c.set(self.id));
    }

    pub fn done_current(&self) {
        CURRENT_CONTEXT.with(|c| {
            if c.get() == self.id {
                c.set(0);
            }
        });
    }

    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|c| c.get() == self.id)
    }

    pub fn is_valid(&self) -> bool {
        self.command_pool != vk::CommandPool::null()
            && self.descriptor_pool != vk::DescriptorPool::null()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub(crate) fn dev(&self) -> &ash::Device {
        self.backend.device()
    }

    pub(crate) fn dev_instance(&self) -> &ash::Instance {
        self.backend.instance()
    }

    pub(crate) fn pdev(&self) -> vk::PhysicalDevice {
        self.backend.physical_device()
    }

    pub fn allocator(&self) -> Arc<Allocator> {
        self.allocator.clone()
    }

    pub fn deletion(&self) -> Arc<DeletionQueue> {
        self.deletion.clone()
    }

    pub fn pipelines(&mut self) -> &mut PipelineCache {
        &mut self.pipelines
    }

    pub fn streaming(&mut self) -> &mut Buffer {
        self.streaming.as_mut().unwrap()
    }

    /// Push a render target onto the framebuffer stack.
    pub fn push_framebuffer(&mut self, target: FrameTarget) {
        self.framebuffer_stack.push(target);
    }

    /// Pop the top render target from the framebuffer stack.
    pub fn pop_framebuffer(&mut self) -> Option<FrameTarget> {
        self.framebuffer_stack.pop()
    }

    /// The render target draws currently land in.
    pub fn current_framebuffer(&self) -> Option<&FrameTarget> {
        self.framebuffer_stack.last()
    }

    pub fn supports_dmabuf_import(&self) -> bool {
        self.supports_dmabuf_import
    }

    pub fn supports_external_fence_fd(&self) -> bool {
        self.backend.supports_external_fence_fd()
    }

    /// Record the fence of the frame being recorded; resources dropped
    /// from here on are tied to it, and the descriptor pool reset
    /// waits on it.
    pub fn begin_frame(&mut self, frame_fence: vk::Fence) {
        self.deletion.set_frame_fence(frame_fence);
        self.last_frame_fence = frame_fence;
    }

    /// Drop retired resources. Called once per frame before anything
    /// new is allocated.
    pub fn cleanup_pending_resources(&self) {
        self.deletion.drain(self.dev());
    }

    /// Allocate a primary command buffer from the pool.
    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let bufs = unsafe {
            self.dev()
                .allocate_command_buffers(&info)
                .or(Err(StratusError::OUT_OF_MEMORY))?
        };
        Ok(bufs[0])
    }

    /// Return a frame command buffer to the pool once the frame that
    /// used it retires.
    pub fn free_command_buffer_deferred(&self, cbuf: vk::CommandBuffer) {
        self.deletion.schedule(Box::new(DeferredCommandBuffer {
            dev: self.dev().clone(),
            pool: self.command_pool,
            cbuf: cbuf,
        }));
    }

    /// Begin a one-shot command buffer for resource setup work.
    ///
    /// This path waits for the queue on submit, so it never appears on
    /// the frame critical path.
    pub fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer> {
        let cbuf = self.allocate_command_buffer()?;

        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.dev()
                .begin_command_buffer(cbuf, &info)
                .or(Err(StratusError::INVALID))?;
        }
        Ok(cbuf)
    }

    /// Submit a one-shot command buffer and wait for it to finish.
    pub fn end_single_time_commands(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.dev()
                .end_command_buffer(cbuf)
                .or(Err(StratusError::INVALID))?;

            let cbufs = [cbuf];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

            self.dev()
                .queue_submit(self.backend.graphics_queue(), &[submit], vk::Fence::null())
                .or(Err(StratusError::DEVICE_LOST))?;
            self.dev()
                .queue_wait_idle(self.backend.graphics_queue())
                .or(Err(StratusError::DEVICE_LOST))?;

            self.dev().free_command_buffers(self.command_pool, &[cbuf]);
        }
        Ok(())
    }

    /// Allocate one descriptor set.
    ///
    /// On pool exhaustion the pool is reset (guarded by a wait on the
    /// previous frame's fence) and the allocation retried once.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        match self.try_allocate_descriptor_set(layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                log::error!("Descriptor pool exhausted, resetting");
                self.reset_descriptor_pool()?;
                self.try_allocate_descriptor_set(layout)
                    .or(Err(StratusError::DESCRIPTOR_POOL_FULL))
            }
            Err(_) => Err(StratusError::DESCRIPTOR_POOL_FULL),
        }
    }

    fn try_allocate_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        if self.descriptor_alloc_count >= self.descriptor_pool_max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.dev().allocate_descriptor_sets(&info)? };
        self.descriptor_alloc_count += 1;
        Ok(sets[0])
    }

    /// Reset the descriptor pool, invalidating every allocated set.
    ///
    /// Waits for the previous frame's fence first so no in-flight
    /// command buffer still reads the old sets.
    pub fn reset_descriptor_pool(&mut self) -> Result<()> {
        if self.last_frame_fence != vk::Fence::null() {
            unsafe {
                let _ = self
                    .dev()
                    .wait_for_fences(&[self.last_frame_fence], true, u64::MAX);
            }
        }

        unsafe {
            self.dev()
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .or(Err(StratusError::DESCRIPTOR_POOL_FULL))?;
        }
        self.descriptor_alloc_count = 0;
        Ok(())
    }

    pub(crate) fn descriptor_alloc_count(&self) -> u32 {
        self.descriptor_alloc_count
    }

    pub(crate) fn descriptor_pool_max_sets(&self) -> u32 {
        self.descriptor_pool_max_sets
    }

    /// The 1x1 opaque white texture bound for draws that sample
    /// nothing (borders). Created on first use.
    pub fn white_texture(&mut self) -> Result<Arc<Texture>> {
        if let Some(tex) = self.white_texture.as_ref() {
            return Ok(tex.clone());
        }

        let pixels: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
        let img = MemImage::new(pixels.as_ptr(), 4, 1, 1);
        let tex = Texture::upload(self, &img, vk::Format::B8G8R8A8_UNORM)?;
        self.white_texture = Some(tex.clone());
        Ok(tex)
    }

    /// Get or create the context fence used when no swapchain fence is
    /// available.
    pub fn get_or_create_fence(&mut self) -> Result<vk::Fence> {
        if self.fence == vk::Fence::null() {
            let info = vk::FenceCreateInfo::builder();
            self.fence = unsafe {
                self.dev()
                    .create_fence(&info, None)
                    .or(Err(StratusError::INIT_FAILED))?
            };
        }
        Ok(self.fence)
    }

    /// Create a one-shot fence that can be exported as a sync fd.
    /// Returns None when the device lacks the export extension.
    pub fn create_exportable_fence(&self) -> Option<vk::Fence> {
        if !self.backend.supports_external_fence_fd() {
            return None;
        }

        let mut export_info = vk::ExportFenceCreateInfo::builder()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD);
        let info = vk::FenceCreateInfo::builder().push_next(&mut export_info);

        match unsafe { self.dev().create_fence(&info, None) } {
            Ok(fence) => Some(fence),
            Err(e) => {
                log::error!("Failed to create exportable fence: {:?}", e);
                None
            }
        }
    }

    /// Export `fence` as a sync file descriptor.
    pub fn export_fence_to_sync_fd(&self, fence: vk::Fence) -> Result<OwnedFd> {
        let loader = self
            .backend
            .external_fence_fd_loader()
            .ok_or(StratusError::VK_NOT_ALL_EXTENSIONS_AVAILABLE)?;

        let info = vk::FenceGetFdInfoKHR::builder()
            .fence(fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD);

        let fd = unsafe {
            loader
                .get_fence_fd(&info)
                .or(Err(StratusError::INVALID_FD))?
        };
        if fd < 0 {
            // -1 means the fence was already signaled
            return Err(StratusError::INVALID_FD);
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Import a single-plane dmabuf as a sampled texture.
    pub fn import_dmabuf_as_texture(&self, attrs: &DmaBufAttributes) -> Result<Arc<Texture>> {
        let format = drm_format_to_vk_format(attrs.format);
        if format == vk::Format::UNDEFINED {
            return Err(StratusError::INVALID_DMABUF);
        }

        self.import_dmabuf_plane_as_texture(attrs, 0, format, (attrs.width, attrs.height))
    }

    /// Import one plane of a dmabuf as its own texture. YUV buffers
    /// get one texture per plane, each with a single-channel format
    /// and the subsampled size.
    pub fn import_dmabuf_plane_as_texture(
        &self,
        attrs: &DmaBufAttributes,
        plane_index: usize,
        format: vk::Format,
        size: (u32, u32),
    ) -> Result<Arc<Texture>> {
        if !self.supports_dmabuf_import {
            return Err(StratusError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }
        let plane = attrs
            .planes
            .get(plane_index)
            .ok_or(StratusError::INVALID_DMABUF)?;

        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: size.0,
                height: size.1,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut ext_mem_info);

        let image = unsafe {
            self.dev()
                .create_image(&image_info, None)
                .or(Err(StratusError::INVALID_DMABUF))?
        };

        let mem_reqs = unsafe { self.dev().get_image_memory_requirements(image) };

        // supported memory types for this fd; don't require
        // DEVICE_LOCAL since the dmabuf may live in system memory
        let fd_type_bits = match self.backend.external_memory_fd_loader() {
            Some(loader) => unsafe {
                loader
                    .get_memory_fd_properties(
                        vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                        plane.fd.as_raw_fd(),
                    )
                    .map(|p| p.memory_type_bits)
                    .unwrap_or(mem_reqs.memory_type_bits)
            },
            None => mem_reqs.memory_type_bits,
        };

        let memtype = match find_memtype_for_dmabuf(fd_type_bits, &mem_reqs) {
            Some(m) => m,
            None => {
                unsafe { self.dev().destroy_image(image, None) };
                return Err(StratusError::INVALID_DMABUF);
            }
        };

        // The implementation consumes the fd on success, and the X
        // server still owns the one in `attrs`, so import a dup.
        let fd = match fcntl(plane.fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("could not dup dmabuf fd: {:?}", e);
                unsafe { self.dev().destroy_image(image, None) };
                return Err(StratusError::INVALID_FD);
            }
        };

        let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_reqs.size)
            .memory_type_index(memtype)
            .push_next(&mut import_info)
            .push_next(&mut dedicated_info);

        let memory = match unsafe { self.dev().allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                log::debug!("dmabuf import failed: {:?}", e);
                unsafe {
                    // the fd was not consumed on failure
                    drop(OwnedFd::from_raw_fd(fd));
                    self.dev().destroy_image(image, None);
                }
                return Err(StratusError::INVALID_DMABUF);
            }
        };

        unsafe {
            if self.dev().bind_image_memory(image, memory, 0).is_err() {
                self.dev().free_memory(memory, None);
                self.dev().destroy_image(image, None);
                return Err(StratusError::INVALID_DMABUF);
            }
        }

        Texture::from_import(self, image, memory, format, size)
    }

    /// Import every plane of a YUV dmabuf; helper used by the surface
    /// texture importer.
    pub fn import_dmabuf_all_planes(
        &self,
        attrs: &DmaBufAttributes,
    ) -> Result<Vec<Arc<Texture>>> {
        let layout = yuv_plane_layout(attrs.format).ok_or(StratusError::INVALID_DMABUF)?;
        if attrs.planes.len() != layout.len() {
            log::debug!(
                "dmabuf plane count mismatch: got {}, format wants {}",
                attrs.planes.len(),
                layout.len()
            );
            return Err(StratusError::INVALID_DMABUF);
        }

        let mut planes = Vec::with_capacity(layout.len());
        for (i, plane) in layout.iter().enumerate() {
            let format = drm_format_to_vk_format(plane.drm_format);
            let size = (
                attrs.width / plane.width_div,
                attrs.height / plane.height_div,
            );
            planes.push(self.import_dmabuf_plane_as_texture(attrs, i, format, size)?);
        }
        Ok(planes)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.dev().device_wait_idle();
        }

        // From here on everything is destroyed in place: the queue
        // drains what has accumulated, then drops future guards
        // immediately.
        self.deletion.drain_all();
        self.white_texture = None;
        self.streaming = None;
        self.pipelines.clear();

        unsafe {
            if self.fence != vk::Fence::null() {
                self.dev().destroy_fence(self.fence, None);
            }
            self.dev().destroy_descriptor_pool(self.descriptor_pool, None);
            self.dev().destroy_command_pool(self.command_pool, None);
        }

        self.done_current();
    }
}

/// Memory type selection for imported buffers: the type must satisfy
/// both the image's requirements and the fd's supported set.
fn find_memtype_for_dmabuf(fd_type_bits: u32, reqs: &vk::MemoryRequirements) -> Option<u32> {
    for i in 0..32 {
        if (fd_type_bits >> i) & 1 == 1 && (reqs.memory_type_bits >> i) & 1 == 1 {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmabuf_memtype_intersects_both_masks() {
        let reqs = vk::MemoryRequirements {
            size: 0,
            alignment: 0,
            memory_type_bits: 0b1100,
        };
        assert_eq!(find_memtype_for_dmabuf(0b0100, &reqs), Some(2));
        assert_eq!(find_memtype_for_dmabuf(0b1000, &reqs), Some(3));
        assert_eq!(find_memtype_for_dmabuf(0b0011, &reqs), None);
    }
}
