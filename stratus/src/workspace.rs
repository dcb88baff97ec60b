// Workspace scene glue
//
// The window manager side renders decorations and shadow tiles into
// CPU images; these providers own the GPU textures backing them and
// re-upload when the source changes. The scene walker only ever asks
// for the current texture.

use ash::vk;

use crate::context::Context;
use crate::texture::{Texture, TextureInfo};
use crate::{MemImage, Rect, Region, Result};

use std::sync::Arc;

/// Texture provider for window decorations.
///
/// The decoration plugin paints the frame (borders + titlebar) into a
/// single atlas image; we keep one texture per window and patch the
/// damaged region on update.
pub struct SceneDecorationRenderer {
    texture: Option<Arc<Texture>>,
    /// Atlas pixels waiting for upload, replaced by the WM side
    pending: Option<(Vec<u8>, (u32, u32))>,
    damage: Region,
}

impl SceneDecorationRenderer {
    pub fn new() -> Self {
        Self {
            texture: None,
            pending: None,
            damage: Region::new(),
        }
    }

    /// Hand over a freshly painted decoration atlas. Pixels are BGRA,
    /// tightly packed.
    pub fn set_image(&mut self, pixels: Vec<u8>, size: (u32, u32), damage: Region) {
        self.pending = Some((pixels, size));
        self.damage = damage;
    }

    pub fn texture_info(&self) -> Option<TextureInfo> {
        let tex = self.texture.as_ref()?;
        match tex.is_valid() {
            true => Some(tex.info()),
            false => None,
        }
    }

    pub fn texture(&self) -> Option<&Arc<Texture>> {
        self.texture.as_ref()
    }

    /// Upload pending pixels. Called by the item's preprocess.
    pub fn preprocess(&mut self, ctx: &mut Context) -> Result<()> {
        let (pixels, size) = match self.pending.take() {
            Some(p) => p,
            None => return Ok(()),
        };

        let img = MemImage::new(pixels.as_ptr(), 4, size.0 as usize, size.1 as usize);

        let recreate = match self.texture.as_ref() {
            Some(tex) => tex.size() != size,
            None => true,
        };

        if recreate {
            // the old texture rides the deferred queue out
            self.texture = Some(Texture::upload(ctx, &img, vk::Format::B8G8R8A8_SRGB)?);
        } else if let Some(tex) = self.texture.as_ref() {
            let damage = match self.damage.is_empty() {
                true => Region::from_rect(Rect::new(0, 0, size.0 as i32, size.1 as i32)),
                false => std::mem::take(&mut self.damage),
            };
            tex.update(ctx, &img, &damage)?;
        }
        self.damage = Region::new();

        Ok(())
    }
}

/// Texture provider for window shadows.
///
/// Shadow tiles come in as one pre-composited image per window
/// geometry; they change rarely, so this is an upload-on-change
/// provider like the decoration renderer without partial damage.
pub struct ShadowTextureProvider {
    texture: Option<Arc<Texture>>,
    pending: Option<(Vec<u8>, (u32, u32))>,
}

impl ShadowTextureProvider {
    pub fn new() -> Self {
        Self {
            texture: None,
            pending: None,
        }
    }

    pub fn set_image(&mut self, pixels: Vec<u8>, size: (u32, u32)) {
        self.pending = Some((pixels, size));
    }

    pub fn texture_info(&self) -> Option<TextureInfo> {
        let tex = self.texture.as_ref()?;
        match tex.is_valid() {
            true => Some(tex.info()),
            false => None,
        }
    }

    pub fn texture(&self) -> Option<&Arc<Texture>> {
        self.texture.as_ref()
    }

    pub fn preprocess(&mut self, ctx: &mut Context) -> Result<()> {
        if let Some((pixels, size)) = self.pending.take() {
            let img = MemImage::new(pixels.as_ptr(), 4, size.0 as usize, size.1 as usize);
            self.texture = Some(Texture::upload(ctx, &img, vk::Format::B8G8R8A8_SRGB)?);
        }
        Ok(())
    }
}
