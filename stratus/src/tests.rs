// Scene walker and node construction tests
//
// These cover the device-independent half of the backend: geometry
// building, node construction rules, stack discipline, and the
// projection conventions. GPU handles are fabricated where a node
// needs one; nothing here talks to a device or an X server.

use crate::item::{
    BorderOutline, BorderRadius, Item, ItemKind, ReleasePoint, SurfaceItem, WindowQuad,
};
use crate::item_renderer::{
    build_geometry_from_quads, corner_box, create_render_node, make_render_node, modulate,
    CornerClip, RenderContext, RenderViewport,
};
use crate::pipeline::ShaderTraits;
use crate::texture::TextureInfo;
use crate::{Rect, Region};

use ash::vk::{self, Handle};
use cgmath::{Matrix4, SquareMatrix, Vector4};
use std::os::fd::AsFd;

fn fake_texture(size: (u32, u32)) -> TextureInfo {
    TextureInfo {
        view: vk::ImageView::from_raw(0x10),
        sampler: vk::Sampler::from_raw(0x20),
        size: size,
        has_alpha: true,
        transform: crate::texture::ContentTransform::Normal,
    }
}

fn surface_item(rect: Rect<f32>) -> Item {
    Item::new(
        ItemKind::Surface(SurfaceItem {
            pixmap: None,
            texture: None,
            release_point: None,
            damage: Region::new(),
            has_alpha: false,
        }),
        rect,
    )
}

fn border_item(rect: Rect<f32>) -> Item {
    let mut item = Item::new(
        ItemKind::OutlinedBorder(BorderOutline {
            thickness: 2.0,
            color: [1.0, 0.0, 0.0, 1.0],
        }),
        rect,
    );
    item.quads
        .push(WindowQuad::from_rect(rect, rect.r_size));
    item
}

fn empty_render_context() -> RenderContext {
    RenderContext {
        nodes: Vec::new(),
        transform_stack: vec![Matrix4::identity()],
        opacity_stack: vec![1.0],
        corner_stack: Vec::new(),
        projection: Matrix4::identity(),
        root_transform: Matrix4::identity(),
        clip: Region::new(),
        hardware_clipping: false,
        scale: 1.0,
    }
}

/// A 512x256 opaque window produces one MAP_TEXTURE node whose six
/// vertices cover the four corners, with texcoords normalized to the
/// unit square.
#[test]
fn single_opaque_window() {
    let rect = Rect::new(0.0, 0.0, 512.0, 256.0);
    let mut item = surface_item(rect);
    item.quads.push(WindowQuad::from_rect(rect, (512.0, 256.0)));

    let geometry = build_geometry_from_quads(&item.quads, 1.0);
    assert_eq!(geometry.len(), 6);

    let node = make_render_node(
        &item,
        Some(fake_texture((512, 256))),
        geometry,
        Matrix4::identity(),
        1.0,
        None,
        1.0,
    )
    .expect("valid surface must produce a node");

    assert_eq!(node.traits, ShaderTraits::MAP_TEXTURE);
    assert_eq!(node.geometry.len(), 6);

    // distinct positions are exactly the four corners
    let mut positions: Vec<[f32; 2]> = node.geometry.iter().map(|v| v.position).collect();
    positions.sort_by(|a, b| a.partial_cmp(b).unwrap());
    positions.dedup();
    assert_eq!(
        positions,
        vec![[0.0, 0.0], [0.0, 256.0], [512.0, 0.0], [512.0, 256.0]]
    );

    // texcoords were normalized on the CPU
    let mut texcoords: Vec<[f32; 2]> = node.geometry.iter().map(|v| v.texcoord).collect();
    texcoords.sort_by(|a, b| a.partial_cmp(b).unwrap());
    texcoords.dedup();
    assert_eq!(
        texcoords,
        vec![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]
    );
}

/// A surface whose texture is not ready must be skipped entirely.
/// Emitting it would bind a MAP_TEXTURE pipeline with nothing in
/// descriptor set 0.
#[test]
fn surface_without_texture_is_skipped() {
    let rect = Rect::new(0.0, 0.0, 100.0, 100.0);
    let mut item = surface_item(rect);
    item.quads.push(WindowQuad::from_rect(rect, (100.0, 100.0)));

    let geometry = build_geometry_from_quads(&item.quads, 1.0);
    let node = make_render_node(
        &item,
        None,
        geometry,
        Matrix4::identity(),
        1.0,
        None,
        1.0,
    );
    assert!(node.is_none());
}

#[test]
fn empty_geometry_is_skipped() {
    let item = surface_item(Rect::new(0.0, 0.0, 100.0, 100.0));
    let node = make_render_node(
        &item,
        Some(fake_texture((100, 100))),
        Vec::new(),
        Matrix4::identity(),
        1.0,
        None,
        1.0,
    );
    assert!(node.is_none());
}

/// A 200x200 item with border radius 10 produces MAP_TEXTURE with
/// ROUNDED_CORNERS; the box is encoded as center plus half-extents.
#[test]
fn rounded_corner_window() {
    let rect = Rect::new(0.0, 0.0, 200.0, 200.0);
    let mut item = surface_item(rect);
    item.border_radius = BorderRadius::uniform(10.0);
    item.quads.push(WindowQuad::from_rect(rect, (200.0, 200.0)));

    let clip = CornerClip {
        box_: rect,
        radius: BorderRadius::uniform(10.0),
    };

    let geometry = build_geometry_from_quads(&item.quads, 1.0);
    let node = make_render_node(
        &item,
        Some(fake_texture((200, 200))),
        geometry,
        Matrix4::identity(),
        1.0,
        Some(&clip),
        1.0,
    )
    .unwrap();

    assert_eq!(
        node.traits,
        ShaderTraits::MAP_TEXTURE | ShaderTraits::ROUNDED_CORNERS
    );
    assert!(node.has_alpha);
    assert_eq!(node.geometry_box, [100.0, 100.0, 100.0, 100.0]);
    assert_eq!(node.border_radius, [10.0, 10.0, 10.0, 10.0]);
}

#[test]
fn corner_box_encodes_center_and_half_extents() {
    assert_eq!(
        corner_box(Rect::new(100.0, 100.0, 100.0, 100.0)),
        [150.0, 150.0, 50.0, 50.0]
    );
}

/// Outlined borders carry the outer rect in the box, the inner rect in
/// the radius slot, and the color in the border color.
#[test]
fn outlined_border_node() {
    let item = border_item(Rect::new(10.0, 10.0, 80.0, 60.0));
    let geometry = build_geometry_from_quads(&item.quads, 1.0);

    let node = make_render_node(
        &item,
        None,
        geometry,
        Matrix4::identity(),
        1.0,
        None,
        1.0,
    )
    .expect("borders draw without a texture");

    assert_eq!(node.traits, ShaderTraits::BORDER);
    assert!(node.texture.is_none());
    assert_eq!(node.geometry_box, [10.0, 10.0, 80.0, 60.0]);
    // inner rect = outer shrunk by the 2px thickness
    assert_eq!(node.border_radius, [12.0, 12.0, 76.0, 56.0]);
    assert_eq!(node.border_thickness, 2.0);
    assert_eq!(node.border_color, [1.0, 0.0, 0.0, 1.0]);
}

#[test]
fn translucent_nodes_pick_up_modulate() {
    let rect = Rect::new(0.0, 0.0, 64.0, 64.0);
    let mut item = surface_item(rect);
    item.quads.push(WindowQuad::from_rect(rect, (64.0, 64.0)));

    let geometry = build_geometry_from_quads(&item.quads, 1.0);
    let node = make_render_node(
        &item,
        Some(fake_texture((64, 64))),
        geometry,
        Matrix4::identity(),
        0.5,
        None,
        1.0,
    )
    .unwrap();

    assert!(node.traits.contains(ShaderTraits::MODULATE));
    assert_eq!(node.opacity, 0.5);
}

#[test]
fn modulation_is_premultiplied() {
    assert_eq!(modulate(1.0, 1.0), [1.0, 1.0, 1.0, 1.0]);
    assert_eq!(modulate(0.5, 1.0), [0.5, 0.5, 0.5, 0.5]);
    assert_eq!(modulate(0.5, 0.5), [0.25, 0.25, 0.25, 0.5]);
}

/// Every stack pushed during the walk must be popped: after walking an
/// arbitrary tree only the seed entries remain.
#[test]
fn walk_balances_all_stacks() {
    let mut root = border_item(Rect::new(0.0, 0.0, 100.0, 100.0));
    root.border_radius = BorderRadius::uniform(4.0);

    let mut behind = border_item(Rect::new(0.0, 0.0, 50.0, 50.0));
    behind.z = -1;
    let mut front = border_item(Rect::new(10.0, 10.0, 50.0, 50.0));
    front.z = 1;
    let mut nested = border_item(Rect::new(0.0, 0.0, 10.0, 10.0));
    nested.opacity = 0.5;
    front.children.push(nested);

    root.children.push(front);
    root.children.push(behind);

    let mut rc = empty_render_context();
    create_render_node(&root, &mut rc);

    assert_eq!(rc.transform_stack.len(), 1);
    assert_eq!(rc.opacity_stack.len(), 1);
    assert!(rc.corner_stack.is_empty());

    // all four items drew
    assert_eq!(rc.nodes.len(), 4);
}

/// Children with negative z render before their parent, positive z
/// after.
#[test]
fn z_order_splits_children_around_the_item() {
    let mut root = border_item(Rect::new(0.0, 0.0, 100.0, 100.0));

    let mut behind = border_item(Rect::new(1.0, 0.0, 10.0, 10.0));
    behind.z = -5;
    let mut front = border_item(Rect::new(2.0, 0.0, 10.0, 10.0));
    front.z = 5;
    root.children.push(front);
    root.children.push(behind);

    let mut rc = empty_render_context();
    create_render_node(&root, &mut rc);

    assert_eq!(rc.nodes.len(), 3);
    // behind at x=1, root at x=0, front at x=2
    assert_eq!(rc.nodes[0].geometry_box[0], 1.0);
    assert_eq!(rc.nodes[1].geometry_box[0], 0.0);
    assert_eq!(rc.nodes[2].geometry_box[0], 2.0);
}

/// Item positions are snapped to device pixels and accumulate down the
/// tree through the transform stack.
#[test]
fn item_positions_accumulate_in_device_pixels() {
    let mut root = border_item(Rect::new(0.0, 0.0, 100.0, 100.0));
    root.position = (10.0, 20.0);

    let mut child = border_item(Rect::new(0.0, 0.0, 10.0, 10.0));
    child.position = (5.0, 5.0);
    root.children.push(child);

    let mut rc = empty_render_context();
    rc.scale = 2.0;
    create_render_node(&root, &mut rc);

    assert_eq!(rc.nodes.len(), 2);
    // root at (10, 20) * 2
    let root_t = rc.nodes[0].transform;
    assert_eq!((root_t.w.x, root_t.w.y), (20.0, 40.0));
    // child accumulates (10+5, 20+5) * 2
    let child_t = rc.nodes[1].transform;
    assert_eq!((child_t.w.x, child_t.w.y), (30.0, 50.0));
}

/// The viewport projection maps the logical rect onto the full NDC
/// square with y growing downward.
#[test]
fn projection_maps_logical_corners_to_ndc() {
    let viewport = RenderViewport::new(Rect::new(0, 0, 1920, 1080), 1.0);
    let proj = viewport.projection_matrix();

    let top_left = proj * Vector4::new(0.0, 0.0, 0.0, 1.0);
    assert!((top_left.x - -1.0).abs() < 1e-6);
    assert!((top_left.y - 1.0).abs() < 1e-6);

    let bottom_right = proj * Vector4::new(1920.0, 1080.0, 0.0, 1.0);
    assert!((bottom_right.x - 1.0).abs() < 1e-6);
    assert!((bottom_right.y - -1.0).abs() < 1e-6);
}

/// Release points receive duplicated sync fds and hand them out once.
#[test]
fn release_point_collects_fds() {
    let point = ReleasePoint::new();
    assert_eq!(point.fence_count(), 0);

    let file = std::fs::File::open("/dev/null").unwrap();
    point.add_release_fence(file.as_fd());
    point.add_release_fence(file.as_fd());
    assert_eq!(point.fence_count(), 2);

    let fds = point.take_fences();
    assert_eq!(fds.len(), 2);
    assert_eq!(point.fence_count(), 0);
}

/// NV12 import maths: plane 0 keeps the pixmap size, plane 1 halves
/// both dimensions.
#[test]
fn nv12_plane_sizes() {
    let layout = crate::format::yuv_plane_layout(crate::format::DRM_FORMAT_NV12).unwrap();
    let (w, h) = (512u32, 256u32);

    let plane0 = (w / layout[0].width_div, h / layout[0].height_div);
    let plane1 = (w / layout[1].width_div, h / layout[1].height_div);

    assert_eq!(plane0, (512, 256));
    assert_eq!(plane1, (256, 128));
}
