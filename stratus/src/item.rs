// Scene items
//
// The walker consumes a tree of items. An item is a small shared
// header (position, opacity, z, transform, border radius, children)
// plus a tagged variant carrying what the item actually draws. There
// is no virtual dispatch in the render hot path; the walker matches on
// the variant.

use cgmath::{Matrix4, SquareMatrix};

use crate::context::Context;
use crate::surface_texture::SurfaceTextureX11;
use crate::texture::TextureInfo;
use crate::workspace::{SceneDecorationRenderer, ShadowTextureProvider};
use crate::{Rect, Region, Result};

use nix::fcntl::{fcntl, FcntlArg};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

/// Per-corner radii of a rounded rectangle.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct BorderRadius {
    pub top_left: f32,
    pub top_right: f32,
    pub bottom_right: f32,
    pub bottom_left: f32,
}

impl BorderRadius {
    pub fn uniform(radius: f32) -> Self {
        Self {
            top_left: radius,
            top_right: radius,
            bottom_right: radius,
            bottom_left: radius,
        }
    }

    pub fn is_null(&self) -> bool {
        self.top_left == 0.0
            && self.top_right == 0.0
            && self.bottom_right == 0.0
            && self.bottom_left == 0.0
    }

    pub fn scaled(&self, scale: f32) -> Self {
        Self {
            top_left: self.top_left * scale,
            top_right: self.top_right * scale,
            bottom_right: self.bottom_right * scale,
            bottom_left: self.bottom_left * scale,
        }
    }

    pub fn rounded(&self) -> Self {
        Self {
            top_left: self.top_left.round(),
            top_right: self.top_right.round(),
            bottom_right: self.bottom_right.round(),
            bottom_left: self.bottom_left.round(),
        }
    }

    pub fn to_vector(&self) -> [f32; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }
}

/// The outline an OutlinedBorder item draws.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BorderOutline {
    pub thickness: f32,
    /// premultiplied RGBA
    pub color: [f32; 4],
}

/// Color tagging for the sRGB passthrough. Anything beyond this is
/// someone else's color management policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ColorDescription {
    #[default]
    Srgb,
    Linear,
}

/// A release point hands sync file descriptors back to the client that
/// owns the buffer, so it learns when the compositor is done reading.
#[derive(Debug, Default)]
pub struct ReleasePoint {
    fences: Mutex<Vec<OwnedFd>>,
}

impl ReleasePoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a duplicate of `fd` to this release point.
    pub fn add_release_fence(&self, fd: BorrowedFd<'_>) {
        if let Ok(dup) = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
            let owned = unsafe { OwnedFd::from_raw_fd(dup) };
            self.fences.lock().unwrap().push(owned);
        }
    }

    /// Drain the collected fds for delivery to the client.
    pub fn take_fences(&self) -> Vec<OwnedFd> {
        std::mem::take(&mut *self.fences.lock().unwrap())
    }

    pub fn fence_count(&self) -> usize {
        self.fences.lock().unwrap().len()
    }
}

/// One textured quad in item-local logical coordinates, with texture
/// coordinates in native texture pixels. Corner order: top-left,
/// top-right, bottom-right, bottom-left.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct WindowQuad {
    pub positions: [[f32; 2]; 4],
    pub texcoords: [[f32; 2]; 4],
}

impl WindowQuad {
    /// An axis-aligned quad covering `rect` with texcoords spanning
    /// `tex_size` pixels.
    pub fn from_rect(rect: Rect<f32>, tex_size: (f32, f32)) -> Self {
        let (x, y) = rect.r_pos;
        let (w, h) = rect.r_size;
        Self {
            positions: [[x, y], [x + w, y], [x + w, y + h], [x, y + h]],
            texcoords: [
                [0.0, 0.0],
                [tex_size.0, 0.0],
                [tex_size.0, tex_size.1],
                [0.0, tex_size.1],
            ],
        }
    }
}

/// Client window content. The pixmap describes what the X server has;
/// the importer turns it into sampled textures on demand.
pub struct SurfaceItem {
    pub pixmap: Option<crate::surface_texture::SurfacePixmapX11>,
    pub texture: Option<SurfaceTextureX11>,
    pub release_point: Option<Arc<ReleasePoint>>,
    /// Damage accumulated since the last frame, in buffer coordinates
    pub damage: Region,
    pub has_alpha: bool,
}

pub struct DecorationItem {
    pub renderer: SceneDecorationRenderer,
}

pub struct ShadowItem {
    pub provider: ShadowTextureProvider,
}

/// An item whose content is a CPU image uploaded once.
pub struct ImageItem {
    /// Pixels waiting to be uploaded (BGRA, tightly packed)
    pub pending: Option<(Vec<u8>, (u32, u32))>,
    pub texture: Option<Arc<crate::texture::Texture>>,
}

pub enum ItemKind {
    Surface(SurfaceItem),
    Decoration(DecorationItem),
    Shadow(ShadowItem),
    Image(ImageItem),
    OutlinedBorder(BorderOutline),
}

/// One node of the scene tree.
pub struct Item {
    /// position of the item in its parent, logical coordinates
    pub position: (f32, f32),
    /// the item's own rect in item-local logical coordinates
    pub rect: Rect<f32>,
    pub opacity: f32,
    pub z: i32,
    pub transform: Matrix4<f32>,
    pub border_radius: BorderRadius,
    pub visible: bool,
    pub color_description: ColorDescription,

    pub kind: ItemKind,
    pub children: Vec<Item>,

    /// Geometry rebuilt by preprocess each frame. Empty when the item
    /// has nothing to draw (e.g. no pixmap yet).
    pub quads: Vec<WindowQuad>,
}

impl Item {
    pub fn new(kind: ItemKind, rect: Rect<f32>) -> Self {
        Self {
            position: (0.0, 0.0),
            rect: rect,
            opacity: 1.0,
            z: 0,
            transform: Matrix4::identity(),
            border_radius: BorderRadius::default(),
            visible: true,
            color_description: ColorDescription::Srgb,
            kind: kind,
            children: Vec::new(),
            quads: Vec::new(),
        }
    }

    pub fn has_transform(&self) -> bool {
        self.transform != Matrix4::identity()
    }

    /// Child indices sorted by z, stable for equal z.
    pub fn sorted_child_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.children.len()).collect();
        indices.sort_by_key(|&i| self.children[i].z);
        indices
    }

    /// Create pixmaps/textures this item needs before its quads can be
    /// built. Quad construction depends on the pixmap existing, which
    /// is why this must run first.
    pub fn preprocess(&mut self, ctx: &mut Context) -> Result<()> {
        match &mut self.kind {
            ItemKind::Surface(surface) => {
                if let (Some(pixmap), Some(texture)) =
                    (surface.pixmap.as_ref(), surface.texture.as_mut())
                {
                    if texture.create(ctx, pixmap) {
                        let damage = std::mem::take(&mut surface.damage);
                        if !damage.is_empty() {
                            texture.update(ctx, pixmap, &damage);
                        }
                    }
                }
            }
            ItemKind::Decoration(deco) => {
                deco.renderer.preprocess(ctx)?;
            }
            ItemKind::Shadow(shadow) => {
                shadow.provider.preprocess(ctx)?;
            }
            ItemKind::Image(image) => {
                if let Some((pixels, size)) = image.pending.take() {
                    let img = crate::MemImage::new(
                        pixels.as_ptr(),
                        4,
                        size.0 as usize,
                        size.1 as usize,
                    );
                    image.texture =
                        Some(crate::texture::Texture::upload(
                            ctx,
                            &img,
                            ash::vk::Format::B8G8R8A8_UNORM,
                        )?);
                }
            }
            ItemKind::OutlinedBorder(_) => {}
        }

        self.build_quads();
        Ok(())
    }

    /// Rebuild the quad list from the item's current content. An item
    /// whose content is not ready gets no quads; its children may
    /// still draw.
    fn build_quads(&mut self) {
        let tex_size = match &self.kind {
            ItemKind::Surface(s) => s
                .texture
                .as_ref()
                .filter(|t| t.is_valid())
                .map(|t| t.size()),
            ItemKind::Decoration(d) => d.renderer.texture_info().map(|i| i.size),
            ItemKind::Shadow(s) => s.provider.texture_info().map(|i| i.size),
            ItemKind::Image(i) => i.texture.as_ref().map(|t| t.size()),
            ItemKind::OutlinedBorder(_) => Some((
                self.rect.r_size.0.max(0.0) as u32,
                self.rect.r_size.1.max(0.0) as u32,
            )),
        };

        self.quads.clear();
        if let Some(size) = tex_size {
            self.quads.push(WindowQuad::from_rect(
                self.rect,
                (size.0 as f32, size.1 as f32),
            ));
        }
    }

    /// The sampled texture this item draws with, if it has one and it
    /// is ready.
    pub fn kind_texture_info(&self) -> Option<TextureInfo> {
        match &self.kind {
            ItemKind::Surface(surface) => {
                let texture = surface.texture.as_ref()?;
                if !texture.is_valid() {
                    return None;
                }
                texture.texture_info()
            }
            ItemKind::Decoration(deco) => deco.renderer.texture_info(),
            ItemKind::Shadow(shadow) => shadow.provider.texture_info(),
            ItemKind::Image(image) => image.texture.as_ref().map(|t| t.info()),
            ItemKind::OutlinedBorder(_) => None,
        }
    }
}
