// DRM fourcc and Vulkan format mappings
//
// X11 hands us pixmap depths; DRI3 hands us DRM fourccs. Everything
// has to end up as a VkFormat before it can be sampled. Multi-plane
// YUV formats additionally split into one texture per plane, each with
// its own single-channel format and subsampled size.

use ash::vk;

const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const DRM_FORMAT_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const DRM_FORMAT_BGR565: u32 = fourcc_code(b'B', b'G', b'1', b'6');
pub const DRM_FORMAT_ARGB2101010: u32 = fourcc_code(b'A', b'R', b'3', b'0');
pub const DRM_FORMAT_XRGB2101010: u32 = fourcc_code(b'X', b'R', b'3', b'0');
pub const DRM_FORMAT_ABGR2101010: u32 = fourcc_code(b'A', b'B', b'3', b'0');
pub const DRM_FORMAT_XBGR2101010: u32 = fourcc_code(b'X', b'B', b'3', b'0');
pub const DRM_FORMAT_ABGR16161616F: u32 = fourcc_code(b'A', b'B', b'4', b'H');
pub const DRM_FORMAT_R8: u32 = fourcc_code(b'R', b'8', b' ', b' ');
pub const DRM_FORMAT_GR88: u32 = fourcc_code(b'G', b'R', b'8', b'8');
pub const DRM_FORMAT_NV12: u32 = fourcc_code(b'N', b'V', b'1', b'2');
pub const DRM_FORMAT_YUV420: u32 = fourcc_code(b'Y', b'U', b'1', b'2');
pub const DRM_FORMAT_YVU420: u32 = fourcc_code(b'Y', b'V', b'1', b'2');

pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Map an X11 pixmap depth to the DRM fourcc the server scans it out
/// as. Returns 0 for depths we cannot import.
pub fn depth_to_drm_format(depth: u8) -> u32 {
    match depth {
        32 => DRM_FORMAT_ARGB8888,
        24 => DRM_FORMAT_XRGB8888,
        30 => DRM_FORMAT_XRGB2101010,
        16 => DRM_FORMAT_RGB565,
        _ => 0,
    }
}

/// Map a DRM fourcc to the VkFormat we sample it as.
///
/// DRM names formats by their little-endian memory order while Vulkan
/// names them component-first, which is why ARGB8888 pairs with
/// B8G8R8A8.
pub fn drm_format_to_vk_format(drm_format: u32) -> vk::Format {
    match drm_format {
        DRM_FORMAT_ARGB8888 => vk::Format::B8G8R8A8_UNORM,
        DRM_FORMAT_XRGB8888 => vk::Format::B8G8R8A8_UNORM,
        DRM_FORMAT_ABGR8888 => vk::Format::R8G8B8A8_UNORM,
        DRM_FORMAT_XBGR8888 => vk::Format::R8G8B8A8_UNORM,
        DRM_FORMAT_RGB565 => vk::Format::R5G6B5_UNORM_PACK16,
        DRM_FORMAT_BGR565 => vk::Format::B5G6R5_UNORM_PACK16,
        DRM_FORMAT_ARGB2101010 => vk::Format::A2R10G10B10_UNORM_PACK32,
        DRM_FORMAT_XRGB2101010 => vk::Format::A2R10G10B10_UNORM_PACK32,
        DRM_FORMAT_ABGR2101010 => vk::Format::A2B10G10R10_UNORM_PACK32,
        DRM_FORMAT_XBGR2101010 => vk::Format::A2B10G10R10_UNORM_PACK32,
        DRM_FORMAT_ABGR16161616F => vk::Format::R16G16B16A16_SFLOAT,
        DRM_FORMAT_R8 => vk::Format::R8_UNORM,
        DRM_FORMAT_GR88 => vk::Format::R8G8_UNORM,
        _ => vk::Format::UNDEFINED,
    }
}

/// Whether a sampled VkFormat carries alpha the blender should honor.
pub fn vk_format_has_alpha(format: vk::Format) -> bool {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A8B8G8R8_UNORM_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32B32A32_SFLOAT => true,
        _ => false,
    }
}

/// One plane of a multi-planar YUV layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct YuvPlane {
    /// fourcc of the plane when imported on its own
    pub drm_format: u32,
    /// horizontal subsampling divisor
    pub width_div: u32,
    /// vertical subsampling divisor
    pub height_div: u32,
}

/// Per-plane layout of a YUV fourcc, or None for single plane formats.
pub fn yuv_plane_layout(drm_format: u32) -> Option<&'static [YuvPlane]> {
    const NV12: [YuvPlane; 2] = [
        YuvPlane {
            drm_format: DRM_FORMAT_R8,
            width_div: 1,
            height_div: 1,
        },
        YuvPlane {
            drm_format: DRM_FORMAT_GR88,
            width_div: 2,
            height_div: 2,
        },
    ];
    const YUV420: [YuvPlane; 3] = [
        YuvPlane {
            drm_format: DRM_FORMAT_R8,
            width_div: 1,
            height_div: 1,
        },
        YuvPlane {
            drm_format: DRM_FORMAT_R8,
            width_div: 2,
            height_div: 2,
        },
        YuvPlane {
            drm_format: DRM_FORMAT_R8,
            width_div: 2,
            height_div: 2,
        },
    ];

    match drm_format {
        DRM_FORMAT_NV12 => Some(&NV12),
        DRM_FORMAT_YUV420 | DRM_FORMAT_YVU420 => Some(&YUV420),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_depths_round_trip_to_vulkan() {
        for depth in [16u8, 24, 30, 32] {
            let drm = depth_to_drm_format(depth);
            assert_ne!(drm, 0, "depth {} must map to a DRM format", depth);
            assert_ne!(
                drm_format_to_vk_format(drm),
                vk::Format::UNDEFINED,
                "depth {} must reach a supported VkFormat",
                depth
            );
        }
    }

    #[test]
    fn unsupported_depths_are_rejected() {
        assert_eq!(depth_to_drm_format(8), 0);
        assert_eq!(depth_to_drm_format(1), 0);
    }

    #[test]
    fn drm_formats_map_component_swapped() {
        assert_eq!(
            drm_format_to_vk_format(DRM_FORMAT_ARGB8888),
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            drm_format_to_vk_format(DRM_FORMAT_XBGR8888),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            drm_format_to_vk_format(DRM_FORMAT_XRGB2101010),
            vk::Format::A2R10G10B10_UNORM_PACK32
        );
        assert_eq!(
            drm_format_to_vk_format(DRM_FORMAT_ABGR16161616F),
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert_eq!(drm_format_to_vk_format(0x12345678), vk::Format::UNDEFINED);
    }

    #[test]
    fn alpha_table_matches_blending_expectations() {
        assert!(vk_format_has_alpha(vk::Format::B8G8R8A8_UNORM));
        assert!(vk_format_has_alpha(vk::Format::A2R10G10B10_UNORM_PACK32));
        assert!(!vk_format_has_alpha(vk::Format::R5G6B5_UNORM_PACK16));
        assert!(!vk_format_has_alpha(vk::Format::R8_UNORM));
    }

    #[test]
    fn nv12_splits_into_luma_and_chroma_planes() {
        let planes = yuv_plane_layout(DRM_FORMAT_NV12).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(drm_format_to_vk_format(planes[0].drm_format), vk::Format::R8_UNORM);
        assert_eq!(
            drm_format_to_vk_format(planes[1].drm_format),
            vk::Format::R8G8_UNORM
        );
        assert_eq!((planes[1].width_div, planes[1].height_div), (2, 2));
    }

    #[test]
    fn rgb_formats_are_single_plane() {
        assert!(yuv_plane_layout(DRM_FORMAT_ARGB8888).is_none());
        assert!(yuv_plane_layout(DRM_FORMAT_RGB565).is_none());
    }
}
