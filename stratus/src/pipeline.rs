// Graphics pipelines for the scene shaders
//
// One vertex/fragment shader pair covers every draw; the fragment
// shader is specialized per trait set through seven boolean
// specialization constants. All pipelines share the same vertex
// layout, premultiplied-alpha blending, dynamic viewport/scissor, and
// a 128 byte push constant block of two column-major matrices.

use ash::vk;
use bitflags::bitflags;

use crate::backend::Backend;
use crate::buffer::Vertex2D;
use crate::{Result, StratusError};
use utils::log;

use std::ffi::CString;
use std::sync::Arc;

bitflags! {
    /// Feature bits controlling fragment shader specialization.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ShaderTraits: u32 {
        const MAP_TEXTURE          = 1 << 0;
        const UNIFORM_COLOR        = 1 << 1;
        const MODULATE             = 1 << 2;
        const ADJUST_SATURATION    = 1 << 3;
        const TRANSFORM_COLORSPACE = 1 << 4;
        const ROUNDED_CORNERS      = 1 << 5;
        const BORDER               = 1 << 6;
    }
}

pub(crate) const SHADER_TRAIT_COUNT: usize = 7;

/// Specialization constant block: constant id N carries trait bit N.
pub(crate) fn specialization_data(traits: ShaderTraits) -> [vk::Bool32; SHADER_TRAIT_COUNT] {
    let mut data = [vk::FALSE; SHADER_TRAIT_COUNT];
    for (i, bit) in [
        ShaderTraits::MAP_TEXTURE,
        ShaderTraits::UNIFORM_COLOR,
        ShaderTraits::MODULATE,
        ShaderTraits::ADJUST_SATURATION,
        ShaderTraits::TRANSFORM_COLORSPACE,
        ShaderTraits::ROUNDED_CORNERS,
        ShaderTraits::BORDER,
    ]
    .iter()
    .enumerate()
    {
        if traits.contains(*bit) {
            data[i] = vk::TRUE;
        }
    }
    data
}

/// Push constant block, visible to both stages.
/// Bytes 0..63 hold the column-major MVP, 64..127 the texture matrix.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PushConstants {
    pub mvp: [f32; 16],
    pub texture_matrix: [f32; 16],
}

/// Per-draw uniform block, std140 compatible with the fragment shader
/// declaration.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Uniforms {
    pub uniform_color: [f32; 4],
    pub opacity: f32,
    pub brightness: f32,
    pub saturation: f32,
    pub _pad0: f32,
    pub primary_brightness: [f32; 3],
    pub _pad1: f32,

    // rounded corners: box center/half-extents, per-corner radii
    pub geometry_box: [f32; 4],
    pub border_radius: [f32; 4],

    // outlined borders
    pub border_thickness: f32,
    pub _pad2: [f32; 3],
    pub border_color: [f32; 4],

    // colorspace transform parameters
    pub source_transfer_function: i32,
    pub _pad3: [f32; 3],
    pub source_transfer_params: [f32; 2],
    pub _pad4: [f32; 2],
    pub dest_transfer_function: i32,
    pub _pad5: [f32; 3],
    pub dest_transfer_params: [f32; 2],
    pub _pad6: [f32; 2],
    pub colorimetry_transform: [f32; 16],
    pub source_reference_luminance: f32,
    pub max_tonemapping_luminance: f32,
    pub dest_reference_luminance: f32,
    pub max_dest_luminance: f32,
    pub dest_to_lms: [f32; 16],
    pub lms_to_dest: [f32; 16],
}

/// The copyable handle set a draw needs from a pipeline. Returned by
/// the cache so callers never hold a borrow into it.
#[derive(Debug, Copy, Clone)]
pub struct PipelineHandles {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
}

/// A specialized graphics pipeline with its layout and descriptor set
/// layout (binding 0 sampler, binding 1 uniform buffer).
pub struct Pipeline {
    backend: Arc<Backend>,
    traits: ShaderTraits,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
}

impl Pipeline {
    pub fn traits(&self) -> ShaderTraits {
        self.traits
    }

    pub fn is_valid(&self) -> bool {
        self.pipeline != vk::Pipeline::null()
    }

    pub fn handles(&self) -> PipelineHandles {
        PipelineHandles {
            pipeline: self.pipeline,
            layout: self.layout,
            descriptor_set_layout: self.descriptor_set_layout,
        }
    }

    fn create_descriptor_set_layout(backend: &Backend) -> Result<vk::DescriptorSetLayout> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        ];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        unsafe {
            backend
                .device()
                .create_descriptor_set_layout(&info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    fn create_pipeline_layout(
        backend: &Backend,
        dsl: vk::DescriptorSetLayout,
    ) -> Result<vk::PipelineLayout> {
        let constants = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32)
            .build()];
        let set_layouts = [dsl];

        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&constants);

        unsafe {
            backend
                .device()
                .create_pipeline_layout(&info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    fn create_shader_module(backend: &Backend, spirv: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe {
            backend
                .device()
                .create_shader_module(&info, None)
                .or(Err(StratusError::INIT_FAILED))
        }
    }

    /// Build the pipeline for `traits` against `render_pass`.
    ///
    /// The same SPIR-V binaries are reused for every trait set; only
    /// the specialization constants differ.
    pub fn new(
        backend: Arc<Backend>,
        render_pass: vk::RenderPass,
        traits: ShaderTraits,
        vert_spirv: &[u32],
        frag_spirv: &[u32],
    ) -> Result<Pipeline> {
        let dsl = Self::create_descriptor_set_layout(&backend)?;
        let layout = match Self::create_pipeline_layout(&backend, dsl) {
            Ok(l) => l,
            Err(e) => {
                unsafe { backend.device().destroy_descriptor_set_layout(dsl, None) };
                return Err(e);
            }
        };

        let modules = Self::create_shader_module(&backend, vert_spirv).and_then(|vert| {
            match Self::create_shader_module(&backend, frag_spirv) {
                Ok(frag) => Ok((vert, frag)),
                Err(e) => {
                    unsafe { backend.device().destroy_shader_module(vert, None) };
                    Err(e)
                }
            }
        });
        let (vert_module, frag_module) = match modules {
            Ok(m) => m,
            Err(e) => {
                unsafe {
                    backend.device().destroy_pipeline_layout(layout, None);
                    backend.device().destroy_descriptor_set_layout(dsl, None);
                }
                return Err(e);
            }
        };

        let entrypoint = CString::new("main").unwrap();

        let spec_data = specialization_data(traits);
        let mut spec_entries = [vk::SpecializationMapEntry::default(); SHADER_TRAIT_COUNT];
        for i in 0..SHADER_TRAIT_COUNT {
            spec_entries[i] = vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * std::mem::size_of::<vk::Bool32>()) as u32,
                size: std::mem::size_of::<vk::Bool32>(),
            };
        }
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&spec_entries)
            .data(unsafe { crate::as_bytes(&spec_data) });

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(&entrypoint)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(&entrypoint)
                .specialization_info(&spec_info)
                .build(),
        ];

        let vertex_bindings = [Vertex2D::binding_description()];
        let vertex_attributes = Vertex2D::attribute_descriptions();
        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };

        // viewport and scissor are dynamic, only the counts matter
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let raster_info = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };

        let multisample_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        // premultiplied alpha: src ONE, dst ONE_MINUS_SRC_ALPHA
        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }];
        let blend_info =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let res = unsafe {
            backend.device().create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        };

        unsafe {
            backend.device().destroy_shader_module(vert_module, None);
            backend.device().destroy_shader_module(frag_module, None);
        }

        let pipeline = match res {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                log::error!("Failed to create graphics pipeline: {:?}", e);
                unsafe {
                    backend.device().destroy_pipeline_layout(layout, None);
                    backend.device().destroy_descriptor_set_layout(dsl, None);
                }
                return Err(StratusError::INIT_FAILED);
            }
        };

        Ok(Pipeline {
            backend: backend,
            traits: traits,
            pipeline: pipeline,
            layout: layout,
            descriptor_set_layout: dsl,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // pipelines are only dropped on cache clears, which happen
        // after the render pass change has idled the device
        unsafe {
            self.backend.device().destroy_pipeline(self.pipeline, None);
            self.backend.device().destroy_pipeline_layout(self.layout, None);
            self.backend
                .device()
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_are_exactly_128_bytes() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 128);
        assert_eq!(offset_of!(PushConstants, mvp), 0);
        assert_eq!(offset_of!(PushConstants, texture_matrix), 64);
    }

    #[test]
    fn uniform_block_is_std140_compatible() {
        // std140 wants vec4 aligned members; all our offsets are
        // multiples of 16
        assert_eq!(offset_of!(Uniforms, uniform_color), 0);
        assert_eq!(offset_of!(Uniforms, opacity), 16);
        assert_eq!(offset_of!(Uniforms, primary_brightness), 32);
        assert_eq!(offset_of!(Uniforms, geometry_box), 48);
        assert_eq!(offset_of!(Uniforms, border_radius), 64);
        assert_eq!(offset_of!(Uniforms, border_thickness), 80);
        assert_eq!(offset_of!(Uniforms, border_color), 96);
        assert_eq!(offset_of!(Uniforms, colorimetry_transform) % 16, 0);
        assert_eq!(offset_of!(Uniforms, dest_to_lms) % 16, 0);
        assert_eq!(std::mem::size_of::<Uniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<Uniforms>(), 384);
    }

    #[test]
    fn specialization_constants_mirror_the_trait_bits() {
        let data = specialization_data(ShaderTraits::MAP_TEXTURE | ShaderTraits::ROUNDED_CORNERS);
        assert_eq!(data[0], vk::TRUE); // map texture
        assert_eq!(data[1], vk::FALSE); // uniform color
        assert_eq!(data[2], vk::FALSE); // modulate
        assert_eq!(data[5], vk::TRUE); // rounded corners
        assert_eq!(data[6], vk::FALSE); // border

        let none = specialization_data(ShaderTraits::empty());
        assert!(none.iter().all(|&b| b == vk::FALSE));
    }

    #[test]
    fn trait_bits_are_independent() {
        let all = ShaderTraits::all();
        assert_eq!(all.bits().count_ones(), SHADER_TRAIT_COUNT as u32);
        assert!(ShaderTraits::MAP_TEXTURE.bits() != ShaderTraits::BORDER.bits());
    }
}
