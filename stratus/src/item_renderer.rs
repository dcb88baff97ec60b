// The scene walker
//
// Invoked once per output per frame. Walks the item tree, turns every
// drawable item into a transient render node, batches the node
// geometry into the streaming vertex arena, and issues one draw per
// node with pipeline/descriptor state deduplicated along the way.
// Submission synchronizes with the presentation engine purely through
// semaphores; the only CPU wait on the fast path is the in-flight
// fence wait the output layer performs before acquire.

use ash::vk;
use cgmath::{ortho, Deg, Matrix4, SquareMatrix, Vector3, Vector4};

use crate::buffer::{Buffer, Vertex2D};
use crate::context::Context;
use crate::item::{BorderRadius, ColorDescription, Item, ItemKind, ReleasePoint, WindowQuad};
use crate::pipeline::{PushConstants, ShaderTraits, Uniforms};
use crate::texture::{ContentTransform, TextureInfo};
use crate::{Rect, Region, Result, StratusError};
use utils::log;

use std::os::fd::AsFd;
use std::sync::Arc;

/// Paint mask bit: the window is transformed and the clip region must
/// be enforced with the scissor.
pub const PAINT_WINDOW_TRANSFORMED: u32 = 1 << 2;

/// Uniform ring: 1024 per-draw slots, each holding one `Uniforms`
/// block at a 256 byte offset alignment.
const UNIFORM_SLOT_COUNT: u32 = 1024;
const UNIFORM_SLOT_SIZE: vk::DeviceSize = {
    let size = std::mem::size_of::<Uniforms>() as vk::DeviceSize;
    (size + 255) & !255
};

/// The swapchain synchronization triplet for one frame slot.
#[derive(Debug, Copy, Clone)]
pub struct SyncInfo {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Everything the walker needs to know about where a frame is going.
#[derive(Debug, Copy, Clone)]
pub struct FrameTarget {
    pub framebuffer: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub size: (u32, u32),
    pub has_depth: bool,
    /// Present for swapchain targets; None means offscreen
    pub sync: Option<SyncInfo>,
}

/// The per-output view the scene is rendered through.
#[derive(Debug, Copy, Clone)]
pub struct RenderViewport {
    /// Device-pixel geometry of the output
    pub rect: Rect<i32>,
    /// logical-to-device pixel ratio
    pub scale: f32,
    /// Output rotation
    pub transform: ContentTransform,
}

impl RenderViewport {
    pub fn new(rect: Rect<i32>, scale: f32) -> Self {
        Self {
            rect: rect,
            scale: scale,
            transform: ContentTransform::Normal,
        }
    }

    /// Logical-coordinate orthographic projection including the
    /// per-output rotation. Pairs with the y-flipped dynamic viewport
    /// so that y grows downward in scene space.
    pub fn projection_matrix(&self) -> Matrix4<f32> {
        let w = self.rect.r_size.0 as f32;
        let h = self.rect.r_size.1 as f32;

        let rotation = match self.transform {
            ContentTransform::Rotate90 => Matrix4::from_angle_z(Deg(90.0)),
            ContentTransform::Rotate180 => Matrix4::from_angle_z(Deg(180.0)),
            ContentTransform::Rotate270 => Matrix4::from_angle_z(Deg(270.0)),
            _ => Matrix4::identity(),
        };

        rotation * ortho(0.0, w, h, 0.0, -1.0, 1.0)
    }
}

/// The window-level paint parameters handed down by the compositor.
#[derive(Debug, Copy, Clone)]
pub struct WindowPaintData {
    pub opacity: f32,
    /// additional logical translation applied to the whole window
    pub translation: (f32, f32),
    /// additional scale applied to the whole window
    pub scale: (f32, f32),
}

impl Default for WindowPaintData {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            translation: (0.0, 0.0),
            scale: (1.0, 1.0),
        }
    }
}

impl WindowPaintData {
    /// The root transform in device pixels.
    pub fn to_matrix(&self, device_scale: f32) -> Matrix4<f32> {
        Matrix4::from_translation(Vector3::new(
            self.translation.0 * device_scale,
            self.translation.1 * device_scale,
            0.0,
        )) * Matrix4::from_nonuniform_scale(self.scale.0, self.scale.1, 1.0)
    }
}

/// A rounded-corner clip in device pixels.
#[derive(Debug, Copy, Clone)]
pub(crate) struct CornerClip {
    pub box_: Rect<f32>,
    pub radius: BorderRadius,
}

/// One draw, built per frame and discarded at frame end.
pub(crate) struct RenderNode {
    pub traits: ShaderTraits,
    pub texture: Option<TextureInfo>,
    pub geometry: Vec<Vertex2D>,
    pub transform: Matrix4<f32>,
    pub first_vertex: u32,
    pub opacity: f32,
    pub has_alpha: bool,
    pub geometry_box: [f32; 4],
    pub border_radius: [f32; 4],
    pub border_thickness: f32,
    pub border_color: [f32; 4],
    pub color: ColorDescription,
    pub release_point: Option<Arc<ReleasePoint>>,
}

/// Walk state for one render_item invocation.
pub(crate) struct RenderContext {
    pub nodes: Vec<RenderNode>,
    pub transform_stack: Vec<Matrix4<f32>>,
    pub opacity_stack: Vec<f32>,
    pub corner_stack: Vec<CornerClip>,
    pub projection: Matrix4<f32>,
    pub root_transform: Matrix4<f32>,
    pub clip: Region,
    pub hardware_clipping: bool,
    pub scale: f32,
}

pub struct ItemRenderer {
    /// Host-visible ring of per-draw uniform blocks
    uniform_buffer: Buffer,
    uniform_index: u32,

    frame_number: u64,
    /// Outputs whose frame is between begin_frame and end_frame. The
    /// descriptor pool may only be reset while this is zero.
    outputs_in_flight: u32,

    cmd: vk::CommandBuffer,
    projection: Matrix4<f32>,

    release_points: Vec<Arc<ReleasePoint>>,
    streaming_warned: bool,
}

impl ItemRenderer {
    pub fn new(ctx: &mut Context) -> Result<ItemRenderer> {
        let uniform_buffer =
            Buffer::new_uniform(ctx, UNIFORM_SLOT_SIZE * UNIFORM_SLOT_COUNT as vk::DeviceSize)?;

        Ok(ItemRenderer {
            uniform_buffer: uniform_buffer,
            uniform_index: 0,
            frame_number: 0,
            outputs_in_flight: 0,
            cmd: vk::CommandBuffer::null(),
            projection: Matrix4::identity(),
            release_points: Vec::new(),
            streaming_warned: false,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Start recording a frame into `target`.
    pub fn begin_frame(
        &mut self,
        ctx: &mut Context,
        target: FrameTarget,
        viewport: &RenderViewport,
    ) -> Result<()> {
        ctx.make_current();

        self.frame_number += 1;

        // Descriptor sets are never freed one by one; when no output
        // is mid-frame and the pool is running hot, reset it wholesale
        // before this frame starts allocating.
        if self.outputs_in_flight == 0
            && ctx.descriptor_alloc_count() > ctx.descriptor_pool_max_sets() / 2
        {
            ctx.reset_descriptor_pool()?;
        }
        self.outputs_in_flight += 1;

        // Resources dropped from here on are tied to this frame's
        // fence
        let frame_fence = match target.sync {
            Some(sync) => sync.in_flight,
            None => ctx.get_or_create_fence()?,
        };
        ctx.begin_frame(frame_fence);
        ctx.cleanup_pending_resources();

        // the in-flight fence was waited before acquire, the arena's
        // previous contents have retired
        ctx.streaming().reset();
        self.uniform_index = 0;

        self.cmd = ctx.allocate_command_buffer()?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            ctx.dev()
                .begin_command_buffer(self.cmd, &begin_info)
                .or(Err(StratusError::INVALID))?;
        }

        // clear to transparent black, depth to the far plane
        let mut clear_values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        }];
        if target.has_depth {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }

        let pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: target.size.0,
                    height: target.size.1,
                },
            })
            .clear_values(&clear_values);

        unsafe {
            ctx.dev()
                .cmd_begin_render_pass(self.cmd, &pass_begin, vk::SubpassContents::INLINE);

            // y-flip trick: logical coordinates stay y-down while clip
            // space behaves like GL
            let vk_viewport = vk::Viewport {
                x: 0.0,
                y: target.size.1 as f32,
                width: target.size.0 as f32,
                height: -(target.size.1 as f32),
                min_depth: 0.0,
                max_depth: 1.0,
            };
            ctx.dev().cmd_set_viewport(self.cmd, 0, &[vk_viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: target.size.0,
                    height: target.size.1,
                },
            };
            ctx.dev().cmd_set_scissor(self.cmd, 0, &[scissor]);
        }

        self.projection = viewport.projection_matrix();
        ctx.push_framebuffer(target);

        Ok(())
    }

    /// Render one item tree into the current frame.
    pub fn render_item(
        &mut self,
        ctx: &mut Context,
        viewport: &RenderViewport,
        item: &mut Item,
        mask: u32,
        region: &Region,
        data: &WindowPaintData,
    ) -> Result<()> {
        if self.cmd == vk::CommandBuffer::null() {
            log::error!("render_item called without an active frame");
            return Err(StratusError::INVALID);
        }

        // Textures and pixmaps must exist before quads can be built
        preprocess_tree(ctx, item)?;

        let mut rc = RenderContext {
            nodes: Vec::new(),
            transform_stack: vec![Matrix4::identity()],
            opacity_stack: vec![data.opacity],
            corner_stack: Vec::new(),
            projection: self.projection,
            root_transform: data.to_matrix(viewport.scale),
            clip: region.clone(),
            hardware_clipping: (mask & PAINT_WINDOW_TRANSFORMED) != 0,
            scale: viewport.scale,
        };

        create_render_node(item, &mut rc);

        // every push was matched by a pop
        debug_assert!(rc.transform_stack.len() == 1);
        debug_assert!(rc.opacity_stack.len() == 1);
        debug_assert!(rc.corner_stack.is_empty());
        rc.transform_stack.pop();
        rc.opacity_stack.pop();

        if rc.hardware_clipping && !rc.clip.is_empty() {
            let bounds = rc.clip.bounding_rect();
            let scissor = vk::Rect2D {
                offset: vk::Offset2D {
                    x: bounds.r_pos.0,
                    y: bounds.r_pos.1,
                },
                extent: vk::Extent2D {
                    width: bounds.r_size.0 as u32,
                    height: bounds.r_size.1 as u32,
                },
            };
            unsafe { ctx.dev().cmd_set_scissor(self.cmd, 0, &[scissor]) };
        }

        // remember release points for the end_frame sync fd delivery
        for node in rc.nodes.iter() {
            if let Some(point) = node.release_point.as_ref() {
                if !self
                    .release_points
                    .iter()
                    .any(|p| Arc::ptr_eq(p, point))
                {
                    self.release_points.push(point.clone());
                }
            }
        }

        self.render_nodes(ctx, &mut rc);
        Ok(())
    }

    /// Upload all node geometry in one block and issue the draws.
    fn render_nodes(&mut self, ctx: &mut Context, rc: &mut RenderContext) {
        if rc.nodes.is_empty() {
            return;
        }

        let vertex_size = std::mem::size_of::<Vertex2D>() as vk::DeviceSize;
        let total_bytes: vk::DeviceSize = rc
            .nodes
            .iter()
            .map(|n| n.geometry.len() as vk::DeviceSize * vertex_size)
            .sum();

        let (block_offset, ptr) = match ctx.streaming().allocate(total_bytes, vertex_size) {
            Some(r) => r,
            None => {
                if !self.streaming_warned {
                    log::error!("streaming vertex buffer exhausted, dropping nodes");
                    self.streaming_warned = true;
                }
                return;
            }
        };

        // copy every node's vertices and assign its arena position
        let mut cursor = 0usize;
        let mut first_vertex = (block_offset / vertex_size) as u32;
        for node in rc.nodes.iter_mut() {
            node.first_vertex = first_vertex;
            let bytes = node.geometry.len() * vertex_size as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    node.geometry.as_ptr() as *const u8,
                    ptr.add(cursor),
                    bytes,
                );
            }
            cursor += bytes;
            first_vertex += node.geometry.len() as u32;
        }
        ctx.streaming().flush(block_offset, total_bytes);

        let vertex_buffer = ctx.streaming().buffer();
        unsafe {
            ctx.dev()
                .cmd_bind_vertex_buffers(self.cmd, 0, &[vertex_buffer], &[0]);
        }

        for i in 0..rc.nodes.len() {
            let node = &rc.nodes[i];
            if node.geometry.is_empty() {
                continue;
            }

            let handles = match ctx.pipelines().pipeline(node.traits) {
                Some(h) if h.pipeline != vk::Pipeline::null() => h,
                _ => {
                    log::error!("no pipeline for traits {:?}", node.traits);
                    continue;
                }
            };

            // the cache's binding stack tracks what this frame scope
            // currently has bound; rebind only on change
            let bound = ctx.pipelines().current_pipeline().map(|h| h.pipeline);
            if bound != Some(handles.pipeline) {
                unsafe {
                    ctx.dev().cmd_bind_pipeline(
                        self.cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        handles.pipeline,
                    );
                }
                if bound.is_some() {
                    ctx.pipelines().pop_pipeline();
                }
                ctx.pipelines().push_pipeline(handles);
            }

            // texcoords were normalized on the CPU, the shader-side
            // texture matrix stays identity
            let push = PushConstants {
                mvp: matrix_to_array(&(rc.projection * rc.nodes[i].transform)),
                texture_matrix: matrix_to_array(&Matrix4::identity()),
            };
            unsafe {
                ctx.dev().cmd_push_constants(
                    self.cmd,
                    handles.layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    crate::as_bytes(&push),
                );
            }

            // binding 0 always carries a texture; non-sampling draws
            // get the white fallback
            let texture = match rc.nodes[i].texture {
                Some(info) => info,
                None => match ctx.white_texture() {
                    Ok(tex) => tex.info(),
                    Err(_) => continue,
                },
            };

            let set = match ctx.allocate_descriptor_set(handles.descriptor_set_layout) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("failed to allocate a descriptor set: {:?}", e);
                    continue;
                }
            };

            let node = &rc.nodes[i];
            let uniforms = node_uniforms(node);
            let slot = self.uniform_index % UNIFORM_SLOT_COUNT;
            self.uniform_index += 1;
            let uniform_offset = slot as vk::DeviceSize * UNIFORM_SLOT_SIZE;
            if self
                .uniform_buffer
                .upload(ctx, unsafe { crate::as_bytes(&uniforms) }, uniform_offset)
                .is_err()
            {
                continue;
            }

            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: self.uniform_buffer.buffer(),
                offset: uniform_offset,
                range: std::mem::size_of::<Uniforms>() as vk::DeviceSize,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
            ];

            unsafe {
                ctx.dev().update_descriptor_sets(&writes, &[]);
                ctx.dev().cmd_bind_descriptor_sets(
                    self.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    handles.layout,
                    0,
                    &[set],
                    &[],
                );
                ctx.dev().cmd_draw(
                    self.cmd,
                    rc.nodes[i].geometry.len() as u32,
                    1,
                    rc.nodes[i].first_vertex,
                    0,
                );
            }
        }
    }

    /// Finish recording and submit.
    ///
    /// Swapchain frames ride the semaphore chain with no CPU wait;
    /// offscreen frames fall back to an exportable fence when clients
    /// are waiting for release, or a blocking wait otherwise.
    pub fn end_frame(&mut self, ctx: &mut Context) -> Result<()> {
        if self.cmd == vk::CommandBuffer::null() {
            return Err(StratusError::INVALID);
        }

        let target = ctx.pop_framebuffer().ok_or(StratusError::INVALID)?;

        // ending the pass invalidates the bound pipeline; close the
        // frame's binding scope with it
        let _ = ctx.pipelines().pop_pipeline();

        unsafe {
            ctx.dev().cmd_end_render_pass(self.cmd);
            ctx.dev()
                .end_command_buffer(self.cmd)
                .or(Err(StratusError::INVALID))?;
        }

        let cmd = self.cmd;
        self.cmd = vk::CommandBuffer::null();

        let result = match target.sync {
            Some(sync) => self.submit_with_gpu_sync(ctx, cmd, sync),
            None => self.submit_offscreen(ctx, cmd),
        };

        ctx.free_command_buffer_deferred(cmd);
        self.release_points.clear();

        if self.outputs_in_flight > 0 {
            self.outputs_in_flight -= 1;
        }

        result
    }

    fn submit_with_gpu_sync(
        &mut self,
        ctx: &mut Context,
        cmd: vk::CommandBuffer,
        sync: SyncInfo,
    ) -> Result<()> {
        let wait_semas = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semas = [sync.render_finished];
        let cbufs = [cmd];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build();

        let fence = match sync.in_flight {
            f if f != vk::Fence::null() => f,
            _ => {
                let f = ctx.get_or_create_fence()?;
                unsafe {
                    let _ = ctx.dev().reset_fences(&[f]);
                }
                f
            }
        };

        unsafe {
            ctx.dev()
                .queue_submit(ctx.backend().graphics_queue(), &[submit], fence)
                .or(Err(StratusError::DEVICE_LOST))?;
        }

        // No CPU wait here. Render waits on image-available, present
        // waits on render-finished, and the in-flight fence is waited
        // at the start of the next frame on this slot.

        if !self.release_points.is_empty() && ctx.supports_external_fence_fd() {
            self.signal_release_points_after(ctx, &signal_semas);
        }

        Ok(())
    }

    /// Submit a tiny follow-up job that waits on the render-finished
    /// semaphore, signals an exportable fence, and hands its sync fd
    /// to every collected release point.
    fn signal_release_points_after(&mut self, ctx: &mut Context, wait_semas: &[vk::Semaphore]) {
        let fence = match ctx.create_exportable_fence() {
            Some(f) => f,
            None => return,
        };

        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .build();

        let submitted = unsafe {
            ctx.dev()
                .queue_submit(ctx.backend().graphics_queue(), &[submit], fence)
                .is_ok()
        };

        if submitted {
            if let Ok(sync_fd) = ctx.export_fence_to_sync_fd(fence) {
                for point in self.release_points.iter() {
                    point.add_release_fence(sync_fd.as_fd());
                }
            }
        }

        unsafe { ctx.dev().destroy_fence(fence, None) };
    }

    fn submit_offscreen(&mut self, ctx: &mut Context, cmd: vk::CommandBuffer) -> Result<()> {
        let cbufs = [cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

        // Fast path: clients want release fds and the device can
        // export fences, so nobody has to block.
        if ctx.supports_external_fence_fd() && !self.release_points.is_empty() {
            if let Some(fence) = ctx.create_exportable_fence() {
                let submitted = unsafe {
                    ctx.dev()
                        .queue_submit(ctx.backend().graphics_queue(), &[submit], fence)
                        .is_ok()
                };

                if submitted {
                    match ctx.export_fence_to_sync_fd(fence) {
                        Ok(sync_fd) => {
                            for point in self.release_points.iter() {
                                point.add_release_fence(sync_fd.as_fd());
                            }
                            unsafe { ctx.dev().destroy_fence(fence, None) };
                            return Ok(());
                        }
                        Err(_) => unsafe {
                            // export failed, block on the fence instead
                            let _ = ctx.dev().wait_for_fences(&[fence], true, u64::MAX);
                            ctx.dev().destroy_fence(fence, None);
                            return Ok(());
                        },
                    }
                }
                unsafe { ctx.dev().destroy_fence(fence, None) };
            }
        }

        // Final fallback: block on the context fence.
        let fence = ctx.get_or_create_fence()?;
        unsafe {
            let _ = ctx.dev().reset_fences(&[fence]);
            ctx.dev()
                .queue_submit(ctx.backend().graphics_queue(), &[submit], fence)
                .or(Err(StratusError::DEVICE_LOST))?;
            let _ = ctx.dev().wait_for_fences(&[fence], true, u64::MAX);
        }
        Ok(())
    }
}

/// Run preprocess over the visible tree so that pixmaps and textures
/// exist before any quads are built.
fn preprocess_tree(ctx: &mut Context, item: &mut Item) -> Result<()> {
    if !item.visible {
        return Ok(());
    }
    item.preprocess(ctx)?;
    for child in item.children.iter_mut() {
        preprocess_tree(ctx, child)?;
    }
    Ok(())
}

/// Recursively build render nodes for `item` and its children.
pub(crate) fn create_render_node(item: &Item, rc: &mut RenderContext) {
    let scale = rc.scale;

    // device-pixel-snapped item translation; the root transform only
    // applies at the tree root
    let mut matrix = Matrix4::from_translation(Vector3::new(
        (item.position.0 * scale).round(),
        (item.position.1 * scale).round(),
        0.0,
    ));
    if rc.transform_stack.len() == 1 {
        matrix = matrix * rc.root_transform;
    }
    if item.has_transform() {
        // item transforms are authored in logical coordinates
        matrix = matrix
            * Matrix4::from_nonuniform_scale(scale, scale, 1.0)
            * item.transform
            * Matrix4::from_nonuniform_scale(1.0 / scale, 1.0 / scale, 1.0);
    }

    rc.transform_stack
        .push(rc.transform_stack.last().unwrap() * matrix);
    rc.opacity_stack
        .push(rc.opacity_stack.last().unwrap() * item.opacity);

    let sorted = item.sorted_child_indices();

    // children behind this item first
    for &ci in sorted.iter() {
        let child = &item.children[ci];
        if child.z >= 0 {
            break;
        }
        if child.visible {
            create_render_node(child, rc);
        }
    }

    // A rounded item starts a new clip; anything below an active clip
    // carries it along, translated into the child's coordinate space.
    let pushed_corner;
    if !item.border_radius.is_null() {
        let native_rect = item.rect.scaled(scale).snapped();
        rc.corner_stack.push(CornerClip {
            box_: native_rect,
            radius: item.border_radius.scaled(scale).rounded(),
        });
        pushed_corner = true;
    } else if let Some(top) = rc.corner_stack.last().copied() {
        let inverse = matrix.invert().unwrap_or_else(Matrix4::identity);
        rc.corner_stack.push(CornerClip {
            box_: map_rect(&inverse, top.box_),
            radius: top.radius,
        });
        pushed_corner = true;
    } else {
        pushed_corner = false;
    }

    let geometry = build_geometry_from_quads(&item.quads, scale);

    if let Some(node) = make_render_node(
        item,
        item.kind_texture_info(),
        geometry,
        *rc.transform_stack.last().unwrap(),
        *rc.opacity_stack.last().unwrap(),
        rc.corner_stack.last(),
        scale,
    ) {
        rc.nodes.push(node);
    }

    // children in front
    for &ci in sorted.iter() {
        let child = &item.children[ci];
        if child.z < 0 {
            continue;
        }
        if child.visible {
            create_render_node(child, rc);
        }
    }

    rc.transform_stack.pop();
    rc.opacity_stack.pop();
    if pushed_corner {
        rc.corner_stack.pop();
    }
}

/// Expand quads into the triangle-list stream, snapping positions to
/// the device pixel grid.
pub(crate) fn build_geometry_from_quads(quads: &[WindowQuad], scale: f32) -> Vec<Vertex2D> {
    let mut geometry = Vec::with_capacity(quads.len() * 6);

    for quad in quads {
        let corner = |i: usize| Vertex2D {
            position: [
                (quad.positions[i][0] * scale).round(),
                (quad.positions[i][1] * scale).round(),
            ],
            texcoord: quad.texcoords[i],
        };

        // two triangles: (tl, tr, br) and (br, bl, tl)
        geometry.push(corner(0));
        geometry.push(corner(1));
        geometry.push(corner(2));
        geometry.push(corner(2));
        geometry.push(corner(3));
        geometry.push(corner(0));
    }

    geometry
}

/// Build the render node for a single item, or None when the item has
/// nothing drawable this frame.
///
/// A node that would sample a texture but has none is skipped, never
/// emitted: pipelines with MAP_TEXTURE statically use descriptor set
/// 0, and a draw without a bound texture is a validation failure.
pub(crate) fn make_render_node(
    item: &Item,
    texture: Option<TextureInfo>,
    mut geometry: Vec<Vertex2D>,
    transform: Matrix4<f32>,
    opacity: f32,
    corner: Option<&CornerClip>,
    scale: f32,
) -> Option<RenderNode> {
    if geometry.is_empty() {
        return None;
    }

    let mut node = match &item.kind {
        ItemKind::Surface(surface) => {
            let texture = texture?;
            normalize_texcoords(&mut geometry, &texture);

            let mut node = RenderNode {
                traits: ShaderTraits::MAP_TEXTURE,
                texture: Some(texture),
                geometry: geometry,
                transform: transform,
                first_vertex: 0,
                opacity: opacity,
                has_alpha: surface.has_alpha,
                geometry_box: [0.0; 4],
                border_radius: [0.0; 4],
                border_thickness: 0.0,
                border_color: [0.0; 4],
                color: item.color_description,
                release_point: surface.release_point.clone(),
            };

            if let Some(clip) = corner {
                if !clip.radius.is_null() {
                    node.traits |= ShaderTraits::ROUNDED_CORNERS;
                    node.has_alpha = true;
                    node.geometry_box = corner_box(clip.box_);
                    node.border_radius = clip.radius.to_vector();
                }
            }

            node
        }
        ItemKind::Decoration(_) | ItemKind::Shadow(_) | ItemKind::Image(_) => {
            let texture = texture?;
            normalize_texcoords(&mut geometry, &texture);

            RenderNode {
                traits: ShaderTraits::MAP_TEXTURE,
                texture: Some(texture),
                geometry: geometry,
                transform: transform,
                first_vertex: 0,
                opacity: opacity,
                has_alpha: true,
                geometry_box: [0.0; 4],
                border_radius: [0.0; 4],
                border_thickness: 0.0,
                border_color: [0.0; 4],
                color: item.color_description,
                release_point: None,
            }
        }
        ItemKind::OutlinedBorder(outline) => {
            let thickness = (outline.thickness * scale).round();
            let outer = item.rect.scaled(scale).snapped();
            let inner = outer.adjusted(thickness);

            RenderNode {
                traits: ShaderTraits::BORDER,
                texture: None,
                geometry: geometry,
                transform: transform,
                first_vertex: 0,
                opacity: opacity,
                has_alpha: true,
                geometry_box: [outer.r_pos.0, outer.r_pos.1, outer.r_size.0, outer.r_size.1],
                // the inner rect rides in the radius slot for the
                // border shader
                border_radius: [inner.r_pos.0, inner.r_pos.1, inner.r_size.0, inner.r_size.1],
                border_thickness: thickness,
                border_color: outline.color,
                color: item.color_description,
                release_point: None,
            }
        }
    };

    if node.opacity < 1.0 {
        node.traits |= ShaderTraits::MODULATE;
    }

    Some(node)
}

/// Multiply native-pixel texcoords through the texture's
/// unnormalized-to-normalized matrix (1/size scale plus the content
/// transform). Done on the CPU so the shader-side texture matrix can
/// stay identity.
fn normalize_texcoords(geometry: &mut [Vertex2D], texture: &TextureInfo) {
    let matrix = crate::texture::content_transform_matrix(texture.transform)
        * Matrix4::from_nonuniform_scale(
            1.0 / texture.size.0 as f32,
            1.0 / texture.size.1 as f32,
            1.0,
        );

    for vert in geometry.iter_mut() {
        let mapped = matrix * Vector4::new(vert.texcoord[0], vert.texcoord[1], 0.0, 1.0);
        vert.texcoord = [mapped.x, mapped.y];
    }
}

/// Rounded-corner box encoding: center and half-extents.
pub(crate) fn corner_box(rect: Rect<f32>) -> [f32; 4] {
    [
        rect.r_pos.0 + rect.r_size.0 * 0.5,
        rect.r_pos.1 + rect.r_size.1 * 0.5,
        rect.r_size.0 * 0.5,
        rect.r_size.1 * 0.5,
    ]
}

/// Modulation for opacity/brightness in premultiplied-alpha space.
pub(crate) fn modulate(opacity: f32, brightness: f32) -> [f32; 4] {
    let rgb = opacity * brightness;
    [rgb, rgb, rgb, opacity]
}

fn node_uniforms(node: &RenderNode) -> Uniforms {
    let mut uniforms = Uniforms::default();

    uniforms.uniform_color = modulate(node.opacity, 1.0);
    uniforms.opacity = node.opacity;
    uniforms.brightness = 1.0;
    uniforms.saturation = 1.0;
    uniforms.geometry_box = node.geometry_box;
    uniforms.border_radius = node.border_radius;
    uniforms.border_thickness = node.border_thickness;
    uniforms.border_color = node.border_color;

    uniforms
}

/// Map an axis-aligned rect through an affine matrix, returning the
/// bounding rect of the result.
fn map_rect(m: &Matrix4<f32>, rect: Rect<f32>) -> Rect<f32> {
    let corners = [
        m * Vector4::new(rect.r_pos.0, rect.r_pos.1, 0.0, 1.0),
        m * Vector4::new(rect.r_pos.0 + rect.r_size.0, rect.r_pos.1, 0.0, 1.0),
        m * Vector4::new(
            rect.r_pos.0 + rect.r_size.0,
            rect.r_pos.1 + rect.r_size.1,
            0.0,
            1.0,
        ),
        m * Vector4::new(rect.r_pos.0, rect.r_pos.1 + rect.r_size.1, 0.0, 1.0),
    ];

    let mut x0 = corners[0].x;
    let mut y0 = corners[0].y;
    let mut x1 = corners[0].x;
    let mut y1 = corners[0].y;
    for c in corners.iter().skip(1) {
        x0 = x0.min(c.x);
        y0 = y0.min(c.y);
        x1 = x1.max(c.x);
        y1 = y1.max(c.y);
    }

    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// cgmath stores column-major, which is exactly what the shaders
/// expect in the push constant block.
pub(crate) fn matrix_to_array(m: &Matrix4<f32>) -> [f32; 16] {
    [
        m.x.x, m.x.y, m.x.z, m.x.w, //
        m.y.x, m.y.y, m.y.z, m.y.w, //
        m.z.x, m.z.y, m.z.z, m.z.w, //
        m.w.x, m.w.y, m.w.z, m.w.w,
    ]
}
