// Render pass presets
//
// Two configurations cover everything the backend draws: the
// presentation pass targeting swapchain images, and the offscreen pass
// whose color attachment ends up shader readable. Both are one subpass
// with an external dependency on color attachment output.

use ash::vk;

use crate::backend::Backend;
use crate::texture::find_depth_format;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

#[derive(Debug, Copy, Clone)]
pub struct RenderPassConfig {
    pub color_format: vk::Format,
    pub color_load_op: vk::AttachmentLoadOp,
    pub color_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub has_depth: bool,
    pub depth_format: vk::Format,
}

pub struct RenderPass {
    backend: Arc<Backend>,
    render_pass: vk::RenderPass,
    config: RenderPassConfig,
}

impl RenderPass {
    /// The pass used for swapchain rendering: clear on load, keep the
    /// result, hand the image to the presentation engine.
    pub fn new_for_presentation(
        backend: Arc<Backend>,
        color_format: vk::Format,
    ) -> Result<Arc<RenderPass>> {
        Self::new(
            backend,
            RenderPassConfig {
                color_format: color_format,
                color_load_op: vk::AttachmentLoadOp::CLEAR,
                color_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                has_depth: false,
                depth_format: vk::Format::UNDEFINED,
            },
        )
    }

    /// The pass used for effect intermediates: the color attachment
    /// ends up shader readable, optionally with a depth attachment.
    pub fn new_for_offscreen(
        backend: Arc<Backend>,
        color_format: vk::Format,
        with_depth: bool,
    ) -> Result<Arc<RenderPass>> {
        let depth_format = match with_depth {
            true => find_depth_format(backend.instance(), backend.physical_device())?,
            false => vk::Format::UNDEFINED,
        };

        Self::new(
            backend,
            RenderPassConfig {
                color_format: color_format,
                color_load_op: vk::AttachmentLoadOp::CLEAR,
                color_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                has_depth: with_depth,
                depth_format: depth_format,
            },
        )
    }

    fn new(backend: Arc<Backend>, config: RenderPassConfig) -> Result<Arc<RenderPass>> {
        let mut attachments = vec![vk::AttachmentDescription {
            format: config.color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: config.color_load_op,
            store_op: config.color_store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: config.initial_layout,
            final_layout: config.final_layout,
            ..Default::default()
        }];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let with_depth = config.has_depth && config.depth_format != vk::Format::UNDEFINED;
        if with_depth {
            attachments.push(vk::AttachmentDescription {
                format: config.depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if with_depth {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        // one external dependency covering color output, extended to
        // the early fragment tests when a depth attachment is present
        let mut dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ..Default::default()
        };
        if with_depth {
            dependency.src_stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            dependency.dst_stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            dependency.dst_access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        let dependencies = [dependency];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            backend
                .device()
                .create_render_pass(&create_info, None)
                .or_else(|e| {
                    log::error!("Failed to create render pass: {:?}", e);
                    Err(StratusError::INIT_FAILED)
                })?
        };

        Ok(Arc::new(RenderPass {
            backend: backend,
            render_pass: render_pass,
            config: config,
        }))
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn config(&self) -> &RenderPassConfig {
        &self.config
    }

    pub fn begin(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);

        unsafe {
            self.backend.device().cmd_begin_render_pass(
                cmd,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
    }

    pub fn end(&self, cmd: vk::CommandBuffer) {
        unsafe { self.backend.device().cmd_end_render_pass(cmd) };
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        // passes only die on swapchain teardown, after device idle
        unsafe {
            self.backend
                .device()
                .destroy_render_pass(self.render_pass, None);
        }
    }
}
