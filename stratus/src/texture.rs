// 2D textures
//
// A texture bundles a VkImage, its view, and a sampler, and tracks the
// image layout most recently recorded into a submitted command buffer.
// Textures are never destroyed in place: dropping one pushes guards
// onto the owning context's deferred destruction queue, view first so
// it always dies before its parent image.

use ash::vk;
use cgmath::{Deg, Matrix4, SquareMatrix, Vector3};

use crate::allocator::{Allocator, MemoryHint};
use crate::context::Context;
use crate::deletion::DeletionQueue;
use crate::format::vk_format_has_alpha;
use crate::{Buffer, MemImage, Rect, Region, Result, StratusError};
use utils::log;

use std::cell::Cell;
use std::sync::Arc;

/// Orientation of the texture contents relative to the sampled
/// coordinate space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ContentTransform {
    #[default]
    Normal,
    FlipY,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Texture coordinate space of incoming geometry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinateType {
    /// Coordinates already in [0, 1]
    Normalized,
    /// Coordinates in [0, width] x [0, height]
    Unnormalized,
}

/// The handle bundle a draw needs from a texture. Plain Vk handles, so
/// render nodes stay Copy and never borrow the texture itself.
#[derive(Debug, Copy, Clone)]
pub struct TextureInfo {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub size: (u32, u32),
    pub has_alpha: bool,
    pub transform: ContentTransform,
}

impl TextureInfo {
    pub fn is_valid(&self) -> bool {
        self.view != vk::ImageView::null()
    }
}

pub struct Texture {
    dev: ash::Device,
    deletion: Arc<DeletionQueue>,
    /// Present for VMA backed images, None for imports and wrappers
    allocator: Option<Arc<Allocator>>,

    image: vk::Image,
    view: vk::ImageView,
    sampler: vk::Sampler,
    /// VMA allocation backing `image`
    allocation: Option<vk_mem::Allocation>,
    /// Raw memory backing `image` for dmabuf imports
    memory: vk::DeviceMemory,

    format: vk::Format,
    size: (u32, u32),
    /// The layout most recently recorded into a submitted command
    /// buffer. Callers must transition before use.
    current_layout: Cell<vk::ImageLayout>,

    content_transform: ContentTransform,
    filter: vk::Filter,
    wrap_mode: vk::SamplerAddressMode,

    /// false for swapchain image wrappers
    owns_image: bool,
}

/// Deferred guards. Each destroys exactly one handle; the texture
/// schedules them in view-sampler-image order.
struct DeferredView {
    dev: ash::Device,
    view: vk::ImageView,
}
impl Drop for DeferredView {
    fn drop(&mut self) {
        unsafe { self.dev.destroy_image_view(self.view, None) };
    }
}

struct DeferredSampler {
    dev: ash::Device,
    sampler: vk::Sampler,
}
impl Drop for DeferredSampler {
    fn drop(&mut self) {
        unsafe { self.dev.destroy_sampler(self.sampler, None) };
    }
}

struct DeferredImage {
    dev: ash::Device,
    allocator: Option<Arc<Allocator>>,
    image: vk::Image,
    allocation: Option<vk_mem::Allocation>,
    memory: vk::DeviceMemory,
}
impl Drop for DeferredImage {
    fn drop(&mut self) {
        match (self.allocator.as_ref(), self.allocation.as_mut()) {
            (Some(allocator), Some(allocation)) => {
                allocator.destroy_image(self.image, allocation);
            }
            _ => unsafe {
                self.dev.destroy_image(self.image, None);
                if self.memory != vk::DeviceMemory::null() {
                    self.dev.free_memory(self.memory, None);
                }
            },
        }
    }
}

impl Texture {
    /// Shared construction core: image from VMA, view, sampler.
    fn create(
        ctx: &Context,
        size: (u32, u32),
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Texture> {
        let allocator = ctx.allocator();
        let info = vk::ImageCreateInfo::builder()
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
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (image, allocation) = allocator.create_image(&info, MemoryHint::DeviceLocal)?;

        let mut ret = Texture {
            dev: ctx.dev().clone(),
            deletion: ctx.deletion(),
            allocator: Some(allocator),
            image: image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: Some(allocation),
            memory: vk::DeviceMemory::null(),
            format: format,
            size: size,
            current_layout: Cell::new(vk::ImageLayout::UNDEFINED),
            content_transform: ContentTransform::Normal,
            filter: vk::Filter::LINEAR,
            wrap_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            owns_image: true,
        };

        ret.create_view(aspect)?;
        if aspect.contains(vk::ImageAspectFlags::COLOR) {
            ret.create_sampler()?;
        }

        Ok(ret)
    }

    fn create_view(&mut self, aspect: vk::ImageAspectFlags) -> Result<()> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            );

        self.view = unsafe {
            self.dev
                .create_image_view(&info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?
        };
        Ok(())
    }

    fn create_sampler(&mut self) -> Result<()> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .address_mode_u(self.wrap_mode)
            .address_mode_v(self.wrap_mode)
            .address_mode_w(self.wrap_mode)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        self.sampler = unsafe {
            self.dev
                .create_sampler(&info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?
        };
        Ok(())
    }

    /// Create a texture and fill it from a CPU pixel buffer.
    pub fn upload(ctx: &Context, image: &MemImage, format: vk::Format) -> Result<Arc<Texture>> {
        let size = (image.width as u32, image.height as u32);
        let tex = Self::allocate(ctx, size, format)?;
        tex.update(
            ctx,
            image,
            &Region::from_rect(Rect::new(0, 0, size.0 as i32, size.1 as i32)),
        )?;
        Ok(tex)
    }

    /// Create an empty sampled texture of the given size and format.
    pub fn allocate(ctx: &Context, size: (u32, u32), format: vk::Format) -> Result<Arc<Texture>> {
        Ok(Arc::new(Self::create(
            ctx,
            size,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?))
    }

    /// Create a texture usable as a color attachment and later sampled.
    pub fn create_render_target(
        ctx: &Context,
        size: (u32, u32),
        format: vk::Format,
    ) -> Result<Arc<Texture>> {
        Ok(Arc::new(Self::create(
            ctx,
            size,
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
        )?))
    }

    /// Create a depth/stencil attachment texture.
    pub fn create_depth_stencil(ctx: &Context, size: (u32, u32)) -> Result<Arc<Texture>> {
        let format = find_depth_format(ctx.dev_instance(), ctx.pdev())?;

        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if format == vk::Format::D24_UNORM_S8_UINT || format == vk::Format::D32_SFLOAT_S8_UINT {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }

        Ok(Arc::new(Self::create(
            ctx,
            size,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
        )?))
    }

    /// Wrap an existing image (a swapchain image) without taking
    /// ownership of it.
    pub fn create_non_owning_wrapper(
        ctx: &Context,
        image: vk::Image,
        format: vk::Format,
        size: (u32, u32),
    ) -> Result<Arc<Texture>> {
        let mut ret = Texture {
            dev: ctx.dev().clone(),
            deletion: ctx.deletion(),
            allocator: None,
            image: image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: None,
            memory: vk::DeviceMemory::null(),
            format: format,
            size: size,
            current_layout: Cell::new(vk::ImageLayout::UNDEFINED),
            content_transform: ContentTransform::Normal,
            filter: vk::Filter::LINEAR,
            wrap_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            owns_image: false,
        };
        ret.create_view(vk::ImageAspectFlags::COLOR)?;
        ret.create_sampler()?;
        Ok(Arc::new(ret))
    }

    /// Used by the context's dmabuf import, which builds image and
    /// memory by hand.
    pub(crate) fn from_import(
        ctx: &Context,
        image: vk::Image,
        memory: vk::DeviceMemory,
        format: vk::Format,
        size: (u32, u32),
    ) -> Result<Arc<Texture>> {
        let mut ret = Texture {
            dev: ctx.dev().clone(),
            deletion: ctx.deletion(),
            allocator: None,
            image: image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: None,
            memory: memory,
            format: format,
            size: size,
            current_layout: Cell::new(vk::ImageLayout::UNDEFINED),
            content_transform: ContentTransform::Normal,
            filter: vk::Filter::LINEAR,
            wrap_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            owns_image: true,
        };
        ret.create_view(vk::ImageAspectFlags::COLOR)?;
        ret.create_sampler()?;
        Ok(Arc::new(ret))
    }

    pub fn is_valid(&self) -> bool {
        self.image != vk::Image::null() && self.view != vk::ImageView::null()
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn has_alpha_channel(&self) -> bool {
        vk_format_has_alpha(self.format)
    }

    pub fn current_layout(&self) -> vk::ImageLayout {
        self.current_layout.get()
    }

    /// Record the layout after a transition performed outside of
    /// `transition_layout` (render pass final layouts).
    pub fn set_current_layout(&self, layout: vk::ImageLayout) {
        self.current_layout.set(layout);
    }

    pub fn content_transform(&self) -> ContentTransform {
        self.content_transform
    }

    pub fn set_content_transform(&mut self, transform: ContentTransform) {
        self.content_transform = transform;
    }

    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            view: self.view,
            sampler: self.sampler,
            size: self.size,
            has_alpha: self.has_alpha_channel(),
            transform: self.content_transform,
        }
    }

    /// The matrix that maps incoming texture coordinates into the
    /// normalized, content-oriented space the sampler expects. For
    /// unnormalized input this folds in the 1/size scale.
    pub fn matrix(&self, coords: CoordinateType) -> Matrix4<f32> {
        let mut matrix = content_transform_matrix(self.content_transform);

        if coords == CoordinateType::Unnormalized {
            matrix = matrix
                * Matrix4::from_nonuniform_scale(
                    1.0 / self.size.0 as f32,
                    1.0 / self.size.1 as f32,
                    1.0,
                );
        }

        matrix
    }

    /// Emit a single image memory barrier moving the image from `old`
    /// to `new`, with access masks derived from the two layouts.
    ///
    /// The new layout is recorded unconditionally, whether or not the
    /// barrier was semantically required; callers treat this as the
    /// source of truth for the image's state.
    pub fn transition_layout(
        &self,
        cmd: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let aspect = match self.format {
            vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
            vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(self.image)
            .old_layout(old)
            .new_layout(new)
            .src_access_mask(src_access_for_layout(old))
            .dst_access_mask(dst_access_for_layout(new))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.current_layout.set(new);
    }

    /// Update a region of the texture from a CPU pixel buffer.
    ///
    /// Stages the bytes, records a transition to transfer-dst, the
    /// buffer-to-image copy, and the transition back to shader read.
    pub fn update(&self, ctx: &Context, image: &MemImage, region: &Region) -> Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        let bounds = region.bounding_rect();

        let mut staging = Buffer::new_staging(ctx, image.as_slice().len() as vk::DeviceSize)?;
        staging.write_mapped(image.as_slice(), 0)?;

        let cmd = ctx.begin_single_time_commands()?;

        self.transition_layout(
            cmd,
            self.current_layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );

        // offset into the staged pixels where the damaged rect starts
        let row_pixels = match image.stride {
            0 => image.width as u32,
            s => s,
        };
        let buffer_offset = (row_pixels as i32 * bounds.r_pos.1 + bounds.r_pos.0) as u64
            * image.element_size as u64;

        let copy = vk::BufferImageCopy::builder()
            .buffer_offset(buffer_offset)
            .buffer_row_length(row_pixels)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D {
                x: bounds.r_pos.0,
                y: bounds.r_pos.1,
                z: 0,
            })
            .image_extent(vk::Extent3D {
                width: bounds.r_size.0 as u32,
                height: bounds.r_size.1 as u32,
                depth: 1,
            })
            .build();

        unsafe {
            self.dev.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer(),
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        self.transition_layout(
            cmd,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        ctx.end_single_time_commands(cmd)?;
        Ok(())
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // Views must always be destroyed before their parent image;
        // schedule order is drain order.
        if self.sampler != vk::Sampler::null() {
            self.deletion.schedule(Box::new(DeferredSampler {
                dev: self.dev.clone(),
                sampler: self.sampler,
            }));
        }
        if self.view != vk::ImageView::null() {
            self.deletion.schedule(Box::new(DeferredView {
                dev: self.dev.clone(),
                view: self.view,
            }));
        }
        if self.owns_image && self.image != vk::Image::null() {
            self.deletion.schedule(Box::new(DeferredImage {
                dev: self.dev.clone(),
                allocator: self.allocator.take(),
                image: self.image,
                allocation: self.allocation.take(),
                memory: self.memory,
            }));
        }
    }
}

/// Source access implied by an image layout we transition away from.
pub(crate) fn src_access_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        _ => vk::AccessFlags::empty(),
    }
}

/// Destination access implied by an image layout we transition into.
pub(crate) fn dst_access_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        _ => vk::AccessFlags::empty(),
    }
}

/// The matrix for a content transform in normalized texture space.
pub(crate) fn content_transform_matrix(transform: ContentTransform) -> Matrix4<f32> {
    match transform {
        ContentTransform::Normal => Matrix4::identity(),
        ContentTransform::FlipY => {
            Matrix4::from_translation(Vector3::new(0.0, 1.0, 0.0))
                * Matrix4::from_nonuniform_scale(1.0, -1.0, 1.0)
        }
        ContentTransform::Rotate90 => Matrix4::from_angle_z(Deg(90.0)),
        ContentTransform::Rotate180 => Matrix4::from_angle_z(Deg(180.0)),
        ContentTransform::Rotate270 => Matrix4::from_angle_z(Deg(270.0)),
    }
}

/// Find a depth format the device can render with.
pub(crate) fn find_depth_format(
    inst: &ash::Instance,
    pdev: vk::PhysicalDevice,
) -> Result<vk::Format> {
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ];

    for format in candidates {
        let props = unsafe { inst.get_physical_device_format_properties(pdev, format) };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return Ok(format);
        }
    }

    log::error!("No depth format with optimal tiling support");
    Err(StratusError::INVALID_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector4;

    #[test]
    fn access_masks_follow_the_layout_pair() {
        assert_eq!(
            src_access_for_layout(vk::ImageLayout::UNDEFINED),
            vk::AccessFlags::empty()
        );
        assert_eq!(
            src_access_for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            dst_access_for_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            dst_access_for_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AccessFlags::empty()
        );
    }

    #[test]
    fn unnormalized_matrix_scales_pixels_into_unit_space() {
        // 512x256 texture: (512, 256) must land on (1, 1)
        let m = content_transform_matrix(ContentTransform::Normal)
            * Matrix4::from_nonuniform_scale(1.0 / 512.0, 1.0 / 256.0, 1.0);
        let mapped = m * Vector4::new(512.0, 256.0, 0.0, 1.0);
        assert!((mapped.x - 1.0).abs() < 1e-6);
        assert!((mapped.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flip_y_mirrors_the_unit_square() {
        let m = content_transform_matrix(ContentTransform::FlipY);
        let mapped = m * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert!((mapped.y - 1.0).abs() < 1e-6);
        let mapped = m * Vector4::new(0.0, 1.0, 0.0, 1.0);
        assert!(mapped.y.abs() < 1e-6);
    }
}
