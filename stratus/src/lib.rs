//! # The Stratus rendering backend.
//!
//! Stratus is the Vulkan rendering backend for an X11 compositor. It
//! takes a scene graph of window items (client surfaces, decorations,
//! shadows, images, outlined borders) and produces per-monitor
//! framebuffer images which are presented to an X11 overlay window
//! through a Vulkan swapchain.
//!
//! The major pieces are:
//! * `Backend` - instance/device bootstrap and capability probing.
//! * `Context` - the per-thread rendering context: command pool,
//!   descriptor pool, pipeline cache, streaming vertex arena, and the
//!   deferred destruction queue that keeps GPU resources alive until
//!   the frames referencing them have retired.
//! * `Swapchain` - the presentable image ring with its per-frame
//!   semaphore/fence triplets.
//! * `Texture` / `Buffer` - VMA backed GPU resources.
//! * `SurfaceTextureX11` - imports client window pixmaps, zero-copy
//!   through DRI3 dma-buf when possible, `GetImage` upload otherwise.
//! * `ItemRenderer` - walks the item tree and turns it into a batched
//!   stream of textured-quad draws.
//! * `X11VulkanOutput` - the per-output glue: overlay window, Vulkan
//!   surface, and the begin/end/present loop.

extern crate thiserror;
use thiserror::Error;

extern crate utils;
pub use utils::region::{Rect, Region};
pub use utils::MemImage;

#[macro_use]
extern crate memoffset;

mod allocator;
mod backend;
mod buffer;
mod context;
mod deletion;
mod format;
mod framebuffer;
mod item;
mod item_renderer;
mod pipeline;
mod pipeline_cache;
mod platform;
mod render_pass;
mod surface_texture;
mod swapchain;
mod texture;
mod workspace;
mod x11_output;

#[cfg(test)]
mod tests;

pub use allocator::{Allocator, MemoryHint};
pub use backend::Backend;
pub use buffer::{Buffer, Vertex2D};
pub use context::{Context, DmaBufAttributes, DmaBufPlane};
pub use deletion::DeletionQueue;
pub use format::{depth_to_drm_format, drm_format_to_vk_format, vk_format_has_alpha};
pub use framebuffer::Framebuffer;
pub use item::{
    BorderOutline, BorderRadius, ColorDescription, DecorationItem, ImageItem, Item, ItemKind,
    ReleasePoint, ShadowItem, SurfaceItem, WindowQuad,
};
pub use item_renderer::{
    FrameTarget, ItemRenderer, RenderViewport, SyncInfo, WindowPaintData, PAINT_WINDOW_TRANSFORMED,
};
pub use pipeline::{PipelineHandles, PushConstants, ShaderTraits, Uniforms};
pub use pipeline_cache::{PipelineBinder, PipelineCache};
pub use render_pass::RenderPass;
pub use surface_texture::{SurfacePixmapX11, SurfaceTexture, SurfaceTextureX11};
pub use swapchain::Swapchain;
pub use texture::{ContentTransform, Texture, TextureInfo};
pub use workspace::{SceneDecorationRenderer, ShadowTextureProvider};
pub use x11_output::{OutputFrame, PresentationMode, X11VulkanOutput, XcbHandle};

pub type Result<T> = std::result::Result<T, StratusError>;

/// Stratus error codes
/// These signify that action should be taken by the compositor.
#[derive(Error, Eq, PartialEq, Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub enum StratusError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Allocation failure")]
    OUT_OF_MEMORY,
    #[error("The Vulkan device was lost")]
    DEVICE_LOST,
    #[error("The internal Vulkan swapchain is out of date")]
    OUT_OF_DATE,
    #[error("Failed to acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("vkQueuePresent failed")]
    PRESENT_FAILED,
    #[error("Vulkan surface is not supported by the chosen queue family")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Vulkan device does not expose the required extensions")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Backend initialization failed")]
    INIT_FAILED,
    #[error("Could not create a Vulkan image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not create the Vulkan swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("No surface format is usable")]
    INVALID_FORMAT,
    #[error("Could not duplicate a dmabuf file descriptor")]
    INVALID_FD,
    #[error("The dmabuf could not be imported")]
    INVALID_DMABUF,
    #[error("Compiled SPIR-V shaders could not be located")]
    SHADERS_NOT_FOUND,
    #[error("The streaming vertex buffer is exhausted")]
    STREAMING_BUFFER_FULL,
    #[error("The descriptor pool is exhausted")]
    DESCRIPTOR_POOL_FULL,
    #[error("An X11 request failed")]
    X11_ERROR,
    #[error("Invalid internal state")]
    INVALID,
}

/// Marker for resources that can sit on the deferred destruction queue.
///
/// The boxed value's Drop impl performs the actual vkDestroy call, so
/// holding the box alive is what keeps the GPU resource alive.
pub trait Droppable {}
impl<T> Droppable for T {}

/// View a #[repr(C)] value as raw bytes for push constant and uniform
/// uploads. The caller must only use this on plain-old-data types.
pub(crate) unsafe fn as_bytes<T: Copy>(t: &T) -> &[u8] {
    std::slice::from_raw_parts(t as *const T as *const u8, std::mem::size_of::<T>())
}
