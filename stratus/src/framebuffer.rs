// Framebuffers
//
// A framebuffer binds a render pass to one color attachment view (and
// optionally a depth view) at a fixed size. Layer support beyond
// layers=1 is intentionally absent. A framebuffer may own its backing
// textures, which is how offscreen targets keep their attachments
// alive.

use ash::vk;

use crate::backend::Backend;
use crate::render_pass::RenderPass;
use crate::texture::Texture;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

pub struct Framebuffer {
    backend: Arc<Backend>,
    framebuffer: vk::Framebuffer,
    render_pass: Arc<RenderPass>,
    size: (u32, u32),

    /// Attachment textures this framebuffer owns. Swapchain
    /// framebuffers leave these empty, their views are owned by the
    /// swapchain.
    _color: Option<Arc<Texture>>,
    _depth: Option<Arc<Texture>>,
}

impl Framebuffer {
    /// Bind `color_view` (plus an optional depth view) to the pass.
    pub fn new(
        backend: Arc<Backend>,
        render_pass: Arc<RenderPass>,
        color_view: vk::ImageView,
        depth_view: Option<vk::ImageView>,
        size: (u32, u32),
    ) -> Result<Framebuffer> {
        let mut attachments = vec![color_view];
        if let Some(depth) = depth_view {
            attachments.push(depth);
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.render_pass())
            .attachments(&attachments)
            .width(size.0)
            .height(size.1)
            .layers(1);

        let framebuffer = unsafe {
            backend
                .device()
                .create_framebuffer(&info, None)
                .or_else(|e| {
                    log::error!("Failed to create framebuffer: {:?}", e);
                    Err(StratusError::INIT_FAILED)
                })?
        };

        Ok(Framebuffer {
            backend: backend,
            framebuffer: framebuffer,
            render_pass: render_pass,
            size: size,
            _color: None,
            _depth: None,
        })
    }

    /// Create a framebuffer that owns its attachments, for offscreen
    /// rendering into a texture.
    pub fn new_offscreen(
        backend: Arc<Backend>,
        render_pass: Arc<RenderPass>,
        color: Arc<Texture>,
        depth: Option<Arc<Texture>>,
    ) -> Result<Framebuffer> {
        let size = color.size();
        let mut ret = Self::new(
            backend,
            render_pass,
            color.view(),
            depth.as_ref().map(|d| d.view()),
            size,
        )?;
        ret._color = Some(color);
        ret._depth = depth;
        Ok(ret)
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.size.0,
                height: self.size.1,
            },
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        // framebuffers die on swapchain recreate, after device idle
        unsafe {
            self.backend
                .device()
                .destroy_framebuffer(self.framebuffer, None);
        }
    }
}
