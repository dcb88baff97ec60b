// The X11 output layer
//
// Owns the compositor's drawing surface on the X side: the composite
// overlay window, a colormap matching the default visual, and a child
// input-output window hosting the Vulkan surface. Drives the per-frame
// begin/end/present loop against the swapchain.

use ash::extensions::khr;
use ash::vk;
use x11rb::connection::Connection;
use x11rb::protocol::composite::ConnectionExt as _;
use x11rb::protocol::xproto::{
    ColormapAlloc, ConfigureWindowAux, ConnectionExt as _, CreateWindowAux, Screen, WindowClass,
};
use x11rb::xcb_ffi::XCBConnection;

use crate::backend::Backend;
use crate::context::Context;
use crate::item_renderer::{FrameTarget, ItemRenderer};
use crate::surface_texture::{SurfacePixmapX11, SurfaceTextureX11};
use crate::swapchain::Swapchain;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;
use std::time::Instant;

/// How a frame reached the screen.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentationMode {
    VSync,
}

/// Presentation record for one output frame.
#[derive(Debug, Default)]
pub struct OutputFrame {
    presented_at: Option<Instant>,
    mode: Option<PresentationMode>,
}

impl OutputFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&mut self, mode: PresentationMode) {
        self.presented_at = Some(Instant::now());
        self.mode = Some(mode);
    }

    pub fn presentation_time(&self) -> Option<Instant> {
        self.presented_at
    }

    pub fn presentation_mode(&self) -> Option<PresentationMode> {
        self.mode
    }
}

/// The shared X11 connection plus the screen we live on.
pub struct XcbHandle {
    conn: XCBConnection,
    screen: usize,
}

impl XcbHandle {
    pub fn connect() -> Result<Arc<XcbHandle>> {
        let (conn, screen) = XCBConnection::connect(None).or_else(|e| {
            log::error!("could not connect to the X server: {:?}", e);
            Err(StratusError::X11_ERROR)
        })?;

        Ok(Arc::new(XcbHandle {
            conn: conn,
            screen: screen,
        }))
    }

    pub fn conn(&self) -> &XCBConnection {
        &self.conn
    }

    pub fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen]
    }

    pub fn root(&self) -> u32 {
        self.screen().root
    }
}

/// The composite overlay window: the server-provided window stacked
/// above all clients that the compositor draws into.
struct OverlayWindow {
    conn: Arc<XcbHandle>,
    window: u32,
}

impl OverlayWindow {
    fn create(conn: Arc<XcbHandle>) -> Result<OverlayWindow> {
        let root = conn.root();

        conn.conn()
            .composite_query_version(0, 4)
            .ok()
            .and_then(|c| c.reply().ok())
            .ok_or(StratusError::X11_ERROR)?;

        let overlay = conn
            .conn()
            .composite_get_overlay_window(root)
            .ok()
            .and_then(|c| c.reply().ok())
            .ok_or(StratusError::X11_ERROR)?
            .overlay_win;

        Ok(OverlayWindow {
            conn: conn,
            window: overlay,
        })
    }

    fn window(&self) -> u32 {
        self.window
    }

    fn show(&self) {
        let _ = self.conn.conn().map_window(self.window);
        let _ = self.conn.conn().flush();
    }
}

impl Drop for OverlayWindow {
    fn drop(&mut self) {
        let _ = self
            .conn
            .conn()
            .composite_release_overlay_window(self.window);
        let _ = self.conn.conn().flush();
    }
}

/// One X11 output presenting through a Vulkan swapchain.
pub struct X11VulkanOutput {
    conn: Arc<XcbHandle>,
    backend: Arc<Backend>,

    overlay: OverlayWindow,
    colormap: u32,
    /// Child input-output window hosting the Vulkan surface
    window: u32,
    size: (u32, u32),

    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,

    swapchain: Option<Swapchain>,
    renderer: ItemRenderer,
    context: Context,
}

impl X11VulkanOutput {
    /// Bring up the whole backend against the current X display.
    pub fn new() -> Result<X11VulkanOutput> {
        let conn = XcbHandle::connect()?;

        let surface_extensions = [
            khr::Surface::name().as_ptr(),
            khr::XcbSurface::name().as_ptr(),
        ];
        let backend = Backend::new(&surface_extensions)?;

        let mut context = Context::new(backend.clone(), 1)?;
        if !context.is_valid() {
            backend.set_failed("context creation");
            return Err(StratusError::INIT_FAILED);
        }

        // The overlay window must exist before the Vulkan surface can
        let overlay = OverlayWindow::create(conn.clone())?;

        let screen = conn.screen();
        let size = (
            screen.width_in_pixels as u32,
            screen.height_in_pixels as u32,
        );
        let visual = screen.root_visual;
        let depth = screen.root_depth;
        let root = screen.root;

        // colormap for the default visual, then the child window that
        // actually hosts the surface
        let colormap = conn.conn().generate_id().or(Err(StratusError::X11_ERROR))?;
        conn.conn()
            .create_colormap(ColormapAlloc::NONE, colormap, root, visual)
            .or(Err(StratusError::X11_ERROR))?;

        let window = conn.conn().generate_id().or(Err(StratusError::X11_ERROR))?;
        conn.conn()
            .create_window(
                depth,
                window,
                overlay.window(),
                0,
                0,
                size.0 as u16,
                size.1 as u16,
                0,
                WindowClass::INPUT_OUTPUT,
                visual,
                &CreateWindowAux::new().colormap(colormap),
            )
            .or(Err(StratusError::X11_ERROR))?;
        conn.conn().map_window(window).or(Err(StratusError::X11_ERROR))?;
        conn.conn().flush().or(Err(StratusError::X11_ERROR))?;

        // the platform surface over the child window
        let xcb_loader = khr::XcbSurface::new(&backend.loader, &backend.inst);
        let surface_info = vk::XcbSurfaceCreateInfoKHR::builder()
            .connection(conn.conn().get_raw_xcb_connection())
            .window(window);
        let surface = unsafe {
            xcb_loader.create_xcb_surface(&surface_info, None).or_else(|e| {
                backend.set_failed("surface creation");
                log::error!("vkCreateXcbSurfaceKHR failed: {:?}", e);
                Err(StratusError::INIT_FAILED)
            })?
        };

        let surface_loader = khr::Surface::new(&backend.loader, &backend.inst);

        // the chosen queue family must be able to present here
        let present_supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(
                    backend.physical_device(),
                    backend.graphics_queue_family(),
                    surface,
                )
                .unwrap_or(false)
        };
        if !present_supported {
            backend.set_failed("queue family cannot present to the X11 surface");
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(StratusError::VK_SURF_NOT_SUPPORTED);
        }

        let swapchain = Swapchain::new(backend.clone(), surface, size)?;

        // pipelines are tied to the presentation pass
        context
            .pipelines()
            .set_render_pass(swapchain.render_pass().render_pass());

        let renderer = ItemRenderer::new(&mut context)?;

        log::debug!("X11 Vulkan output initialized at {}x{}", size.0, size.1);

        Ok(X11VulkanOutput {
            conn: conn,
            backend: backend,
            overlay: overlay,
            colormap: colormap,
            window: window,
            size: size,
            surface: surface,
            surface_loader: surface_loader,
            swapchain: Some(swapchain),
            renderer: renderer,
            context: context,
        })
    }

    pub fn is_failed(&self) -> bool {
        self.backend.is_failed()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn context(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn renderer(&mut self) -> &mut ItemRenderer {
        &mut self.renderer
    }

    /// Split borrows for callers that drive the renderer directly.
    pub fn renderer_and_context(&mut self) -> (&mut ItemRenderer, &mut Context) {
        (&mut self.renderer, &mut self.context)
    }

    pub fn connection(&self) -> &Arc<XcbHandle> {
        &self.conn
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Importer for one client window's pixmap.
    pub fn create_surface_texture(&self) -> SurfaceTextureX11 {
        SurfaceTextureX11::new(self.conn.clone())
    }

    /// Pixmap descriptor helper for the scene side.
    pub fn describe_pixmap(&self, pixmap: u32, size: (u32, u32), depth: u8) -> SurfacePixmapX11 {
        SurfacePixmapX11 {
            pixmap: pixmap,
            size: size,
            depth: depth,
        }
    }

    /// Start a frame: wait out this slot's previous submission, then
    /// acquire an image and hand back the target the walker renders
    /// into.
    pub fn begin_frame(&mut self) -> Result<FrameTarget> {
        if self.backend.is_failed() {
            return Err(StratusError::INIT_FAILED);
        }

        let swapchain = self.swapchain.as_mut().ok_or(StratusError::INVALID)?;

        swapchain.wait_for_fence();
        swapchain.reset_fence();

        swapchain.acquire_next_image()?;

        let sync = swapchain.sync_info();
        let framebuffer = swapchain
            .current_framebuffer()
            .ok_or(StratusError::COULD_NOT_ACQUIRE_NEXT_IMAGE)?;

        Ok(FrameTarget {
            framebuffer: framebuffer.framebuffer(),
            render_pass: framebuffer.render_pass().render_pass(),
            size: framebuffer.size(),
            has_depth: framebuffer.render_pass().config().has_depth,
            sync: Some(sync),
        })
    }

    /// Frame end hook. Submission already happened in the walker's
    /// end_frame, so there is nothing left to do here.
    pub fn end_frame(&mut self, _damage: &crate::Region) {}

    /// Present the rendered frame and advance the frame slot.
    pub fn present(&mut self, frame: &mut OutputFrame) -> Result<()> {
        let swapchain = self.swapchain.as_mut().ok_or(StratusError::INVALID)?;

        let result = swapchain.present();

        // the frame clock must keep ticking even when presentation
        // failed, otherwise the compositor stalls
        frame.presented(PresentationMode::VSync);

        if result == Err(StratusError::OUT_OF_DATE) && swapchain.needs_recreation() {
            let size = self.size;
            log::debug!("recreating swapchain at {}x{}", size.0, size.1);
            swapchain.recreate(size)?;
            self.context
                .pipelines()
                .set_render_pass(swapchain.render_pass().render_pass());
        }

        let swapchain = self.swapchain.as_mut().ok_or(StratusError::INVALID)?;
        swapchain.advance_frame();

        self.overlay.show();

        result
    }

    /// The workspace geometry changed; resize the child window and let
    /// the swapchain go out of date naturally.
    pub fn screen_geometry_changed(&mut self, size: (u32, u32)) {
        self.size = size;

        let _ = self.conn.conn().configure_window(
            self.window,
            &ConfigureWindowAux::new().width(size.0).height(size.1),
        );
        let _ = self.conn.conn().flush();
    }
}

impl Drop for X11VulkanOutput {
    fn drop(&mut self) {
        // swapchain first (waits device idle), then the surface it
        // rendered to, then the X resources
        self.swapchain = None;

        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }

        let _ = self.conn.conn().destroy_window(self.window);
        let _ = self.conn.conn().free_colormap(self.colormap);
        let _ = self.conn.conn().flush();
    }
}
