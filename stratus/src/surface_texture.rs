// X11 pixmap import
//
// Client window contents arrive as X11 pixmaps. When the server and
// device cooperate (DRI3 >= 1.2 plus dmabuf import) we pass the pixmap
// to the GPU zero-copy; otherwise we pull the pixels over the wire
// with GetImage and stage them up. Either way the result is a list of
// texture planes: one for RGB content, one per plane for YUV.

use ash::vk;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};

use crate::buffer::Buffer;
use crate::context::{Context, DmaBufAttributes, DmaBufPlane};
use crate::format::{depth_to_drm_format, yuv_plane_layout, DRM_FORMAT_MOD_INVALID};
use crate::texture::{Texture, TextureInfo};
use crate::x11_output::XcbHandle;
use crate::{Rect, Region};
use utils::log;

use std::os::fd::OwnedFd;
use std::sync::{Arc, OnceLock};

/// An X11 pixmap as the compositor tracks it: id, geometry, and depth.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SurfacePixmapX11 {
    pub pixmap: u32,
    pub size: (u32, u32),
    pub depth: u8,
}

impl SurfacePixmapX11 {
    pub fn is_valid(&self) -> bool {
        self.pixmap != 0 && self.size.0 > 0 && self.size.1 > 0
    }
}

/// The imported planes of one client surface. Valid iff non-empty.
#[derive(Default)]
pub struct SurfaceTexture {
    pub planes: Vec<Arc<Texture>>,
}

impl SurfaceTexture {
    pub fn is_valid(&self) -> bool {
        !self.planes.is_empty()
    }

    pub fn reset(&mut self) {
        // the planes ride the deferred destruction queue out
        self.planes.clear();
    }
}

/// DRI3 capabilities, probed once per process.
#[derive(Debug, Copy, Clone, Default)]
struct Dri3Capabilities {
    present: bool,
    /// DRI3 >= 1.2, required for multi-plane buffers
    multi_plane: bool,
    /// DRI3 >= 1.4 syncobj support; capability-flagged, unused so far
    syncobj: bool,
}

static DRI3_CAPS: OnceLock<Dri3Capabilities> = OnceLock::new();

fn dri3_capabilities(conn: &XcbHandle) -> Dri3Capabilities {
    *DRI3_CAPS.get_or_init(|| {
        let mut caps = Dri3Capabilities::default();

        let reply = conn
            .conn()
            .dri3_query_version(1, 4)
            .ok()
            .and_then(|c| c.reply().ok());

        if let Some(version) = reply {
            caps.present = true;
            caps.multi_plane =
                version.major_version > 1 || (version.major_version == 1 && version.minor_version >= 2);
            caps.syncobj =
                version.major_version > 1 || (version.major_version == 1 && version.minor_version >= 4);
            log::info!(
                "DRI3 {}.{}: multi-plane={} syncobj={}",
                version.major_version,
                version.minor_version,
                caps.multi_plane,
                caps.syncobj
            );
        } else {
            log::info!("DRI3 extension not available");
        }

        caps
    })
}

fn force_cpu_upload() -> bool {
    static FORCE: OnceLock<bool> = OnceLock::new();
    *FORCE.get_or_init(|| {
        std::env::var("STRATUS_FORCE_CPU_UPLOAD").map(|v| v == "1").unwrap_or(false)
    })
}

/// Importer for one client window's pixmap.
///
/// Caches the pixmap id and size; `create` is a no-op while both
/// match. Any mismatch drops the old planes through the deferred queue
/// and re-imports.
pub struct SurfaceTextureX11 {
    conn: Arc<XcbHandle>,
    texture: SurfaceTexture,
    staging: Option<Buffer>,
    pixmap_id: u32,
    size: (u32, u32),
    use_dmabuf: bool,
}

impl SurfaceTextureX11 {
    pub fn new(conn: Arc<XcbHandle>) -> Self {
        Self {
            conn: conn,
            texture: SurfaceTexture::default(),
            staging: None,
            pixmap_id: 0,
            size: (0, 0),
            use_dmabuf: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.texture.is_valid()
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn uses_dmabuf(&self) -> bool {
        self.use_dmabuf
    }

    pub fn planes(&self) -> &[Arc<Texture>] {
        &self.texture.planes
    }

    /// The draw handles of the first plane, which is all the RGB fast
    /// path samples.
    pub fn texture_info(&self) -> Option<TextureInfo> {
        self.texture.planes.first().map(|t| t.info())
    }

    /// Import (or reuse) the texture for `pixmap`.
    ///
    /// Returns true when a valid texture is available afterwards. The
    /// dmabuf path falls through to CPU upload on any failure.
    pub fn create(&mut self, ctx: &mut Context, pixmap: &SurfacePixmapX11) -> bool {
        if !pixmap.is_valid() {
            log::debug!("surface texture create: invalid pixmap");
            return false;
        }

        // reuse while the id and geometry still match
        if self.texture.is_valid() && self.pixmap_id == pixmap.pixmap && self.size == pixmap.size {
            return true;
        }

        if self.texture.is_valid() {
            self.texture.reset();
            self.staging = None;
        }

        self.pixmap_id = pixmap.pixmap;
        self.size = pixmap.size;

        let caps = dri3_capabilities(&self.conn);
        if ctx.supports_dmabuf_import() && caps.present && !force_cpu_upload() {
            if self.create_with_dmabuf(ctx, pixmap) {
                self.use_dmabuf = true;
                log::info!(
                    "zero-copy dmabuf import for pixmap {} ({}x{})",
                    pixmap.pixmap,
                    pixmap.size.0,
                    pixmap.size.1
                );
                return true;
            }
            log::info!("dmabuf import failed, falling back to CPU upload");
        }

        if self.create_with_cpu_upload(ctx, pixmap) {
            self.use_dmabuf = false;
            return true;
        }

        false
    }

    fn create_with_dmabuf(&mut self, ctx: &mut Context, pixmap: &SurfacePixmapX11) -> bool {
        let attrs = match self.fetch_dmabuf_attributes(pixmap) {
            Some(a) => a,
            None => return false,
        };

        // YUV content splits into one texture per plane
        if yuv_plane_layout(attrs.format).is_some() {
            match ctx.import_dmabuf_all_planes(&attrs) {
                Ok(planes) => {
                    self.texture.planes = planes;
                    return true;
                }
                Err(e) => {
                    log::debug!("multi-plane dmabuf import failed: {:?}", e);
                    return false;
                }
            }
        }

        match ctx.import_dmabuf_as_texture(&attrs) {
            Ok(texture) => {
                self.texture.planes = vec![texture];
                true
            }
            Err(e) => {
                log::debug!("dmabuf import failed: {:?}", e);
                false
            }
        }
    }

    /// Ask DRI3 for the pixmap's plane fds and build the import
    /// attributes from the reply.
    fn fetch_dmabuf_attributes(&self, pixmap: &SurfacePixmapX11) -> Option<DmaBufAttributes> {
        let caps = dri3_capabilities(&self.conn);

        let reply = self
            .conn
            .conn()
            .dri3_buffers_from_pixmap(pixmap.pixmap)
            .ok()?
            .reply()
            .ok()?;

        if reply.buffers.is_empty() {
            log::debug!("dri3 returned no buffers for pixmap {}", pixmap.pixmap);
            return None;
        }
        if reply.buffers.len() > 1 && !caps.multi_plane {
            log::debug!("multi-plane buffer but DRI3 < 1.2");
            return None;
        }

        let format = depth_to_drm_format(reply.depth);
        if format == 0 {
            log::debug!("unsupported pixmap depth {}", reply.depth);
            return None;
        }

        let mut planes = Vec::with_capacity(reply.buffers.len());
        for (i, fd) in reply.buffers.into_iter().enumerate() {
            let fd: OwnedFd = fd;
            planes.push(DmaBufPlane {
                fd: fd,
                offset: reply.offsets.get(i).copied().unwrap_or(0),
                stride: reply.strides.get(i).copied().unwrap_or(0),
            });
        }

        let modifier = match reply.modifier {
            0 => DRM_FORMAT_MOD_INVALID,
            m => m,
        };

        Some(DmaBufAttributes {
            width: reply.width as u32,
            height: reply.height as u32,
            format: format,
            modifier: modifier,
            planes: planes,
        })
    }

    fn create_with_cpu_upload(&mut self, ctx: &mut Context, pixmap: &SurfacePixmapX11) -> bool {
        // X11 data is sRGB encoded; a SRGB view makes the hardware do
        // the decode on sample
        let texture = match Texture::allocate(ctx, pixmap.size, vk::Format::B8G8R8A8_SRGB) {
            Ok(t) => t,
            Err(e) => {
                log::error!("could not allocate surface texture: {:?}", e);
                return false;
            }
        };

        let staging_size = pixmap.size.0 as u64 * pixmap.size.1 as u64 * 4;
        let staging = match Buffer::new_staging(ctx, staging_size) {
            Ok(b) => b,
            Err(e) => {
                log::error!("could not allocate staging buffer: {:?}", e);
                return false;
            }
        };

        self.texture.planes = vec![texture];
        self.staging = Some(staging);

        // initial full upload
        self.update(
            ctx,
            pixmap,
            &Region::from_rect(Rect::new(0, 0, pixmap.size.0 as i32, pixmap.size.1 as i32)),
        );

        self.texture.is_valid()
    }

    /// Refresh the texture from the pixmap for the damaged region.
    pub fn update(&mut self, ctx: &mut Context, pixmap: &SurfacePixmapX11, region: &Region) {
        if !self.texture.is_valid() || region.is_empty() {
            return;
        }

        if self.use_dmabuf {
            self.update_dmabuf(ctx);
            return;
        }

        self.update_with_cpu_upload(ctx, pixmap, region);
    }

    /// The zero-copy path has nothing to copy; issue an acquire
    /// barrier per plane so the GPU observes what the X server wrote.
    fn update_dmabuf(&self, ctx: &Context) {
        let cmd = match ctx.begin_single_time_commands() {
            Ok(c) => c,
            Err(_) => return,
        };

        for plane in self.texture.planes.iter() {
            let layout = plane.current_layout();
            plane.transition_layout(
                cmd,
                layout,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            );
        }

        let _ = ctx.end_single_time_commands(cmd);
    }

    fn update_with_cpu_upload(
        &mut self,
        ctx: &mut Context,
        pixmap: &SurfacePixmapX11,
        region: &Region,
    ) {
        let bounds = region.bounding_rect();
        let (x, y) = (bounds.r_pos.0, bounds.r_pos.1);
        let (w, h) = (bounds.r_size.0, bounds.r_size.1);
        if w <= 0 || h <= 0 {
            return;
        }

        let reply = match self
            .conn
            .conn()
            .get_image(
                ImageFormat::Z_PIXMAP,
                pixmap.pixmap,
                x as i16,
                y as i16,
                w as u16,
                h as u16,
                !0,
            )
            .ok()
            .and_then(|c| c.reply().ok())
        {
            Some(r) => r,
            None => {
                log::error!("GetImage failed for pixmap {}", pixmap.pixmap);
                return;
            }
        };

        let staging = match self.staging.as_mut() {
            Some(s) => s,
            None => return,
        };

        let (tex_w, tex_h) = self.size;
        let dst = match staging.map() {
            Ok(p) => p,
            Err(_) => {
                log::error!("could not map the surface staging buffer");
                return;
            }
        };

        // write the damaged rows into the mapping at their offsets,
        // forcing alpha to opaque as X11 pixmaps carry undefined alpha
        // even at depth 32
        let dst_stride = tex_w as usize * 4;
        let dst_slice =
            unsafe { std::slice::from_raw_parts_mut(dst, tex_h as usize * dst_stride) };
        copy_forcing_alpha(
            dst_slice,
            dst_stride,
            (x as usize, y as usize),
            &reply.data,
            (w as usize, h as usize),
        );

        staging.unmap();
        staging.flush(0, tex_w as u64 * tex_h as u64 * 4);

        let texture = self.texture.planes.first().unwrap().clone();

        let cmd = match ctx.begin_single_time_commands() {
            Ok(c) => c,
            Err(_) => return,
        };

        texture.transition_layout(
            cmd,
            texture.current_layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );

        let copy = vk::BufferImageCopy::builder()
            .buffer_offset((y as u64 * tex_w as u64 + x as u64) * 4)
            .buffer_row_length(tex_w)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: x, y: y, z: 0 })
            .image_extent(vk::Extent3D {
                width: w as u32,
                height: h as u32,
                depth: 1,
            })
            .build();

        unsafe {
            ctx.dev().cmd_copy_buffer_to_image(
                cmd,
                self.staging.as_ref().unwrap().buffer(),
                texture.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        texture.transition_layout(
            cmd,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        let _ = ctx.end_single_time_commands(cmd);
    }
}

/// Copy BGRX rows into a BGRA destination, forcing every alpha byte to
/// opaque. X11 pixmaps carry undefined alpha even at depth 32.
fn copy_forcing_alpha(
    dst: &mut [u8],
    dst_stride: usize,
    dst_pos: (usize, usize),
    src: &[u8],
    src_size: (usize, usize),
) {
    let (w, h) = src_size;
    let src_stride = w * 4;

    for row in 0..h {
        let src_row = &src[row * src_stride..row * src_stride + w * 4];
        let dst_off = (dst_pos.1 + row) * dst_stride + dst_pos.0 * 4;
        let dst_row = &mut dst[dst_off..dst_off + w * 4];

        for col in 0..w {
            dst_row[col * 4 + 0] = src_row[col * 4 + 0]; // B
            dst_row[col * 4 + 1] = src_row[col * 4 + 1]; // G
            dst_row[col * 4 + 2] = src_row[col * 4 + 2]; // R
            dst_row[col * 4 + 3] = 0xff;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_is_forced_opaque() {
        // 2x1 BGRX source with garbage alpha
        let src = [10u8, 20, 30, 0, 40, 50, 60, 7];
        let mut dst = [0u8; 8];
        copy_forcing_alpha(&mut dst, 8, (0, 0), &src, (2, 1));

        assert_eq!(&dst[0..4], &[10, 20, 30, 0xff]);
        assert_eq!(&dst[4..8], &[40, 50, 60, 0xff]);
    }

    #[test]
    fn partial_copy_lands_at_the_offset() {
        // 1x1 source into a 4x2 destination at (2, 1)
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4 * 2 * 4];
        copy_forcing_alpha(&mut dst, 16, (2, 1), &src, (1, 1));

        let off = 1 * 16 + 2 * 4;
        assert_eq!(&dst[off..off + 4], &[1, 2, 3, 0xff]);
        // everything before the target pixel is untouched
        assert!(dst[..off].iter().all(|&b| b == 0));
    }

    #[test]
    fn surface_texture_validity_tracks_planes() {
        let mut tex = SurfaceTexture::default();
        assert!(!tex.is_valid());
        tex.reset();
        assert!(!tex.is_valid());
    }

    #[test]
    fn pixmap_validity() {
        assert!(!SurfacePixmapX11 {
            pixmap: 0,
            size: (10, 10),
            depth: 24
        }
        .is_valid());
        assert!(!SurfacePixmapX11 {
            pixmap: 5,
            size: (0, 10),
            depth: 24
        }
        .is_valid());
        assert!(SurfacePixmapX11 {
            pixmap: 5,
            size: (10, 10),
            depth: 24
        }
        .is_valid());
    }
}
