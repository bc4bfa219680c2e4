//! Shader modules, pipeline cache and pipeline construction
//!
//! Pipelines are built against the bindless pipeline layout. They remember
//! which layout that was, so a grown descriptor table can be detected and the
//! pipeline rebuilt from its stored descriptor.

use std::ffi::CString;
use std::io::Cursor;

use ash::{vk, Device};

use crate::render::api::descriptors::{sample_count_flags, ComputePipelineDesc, RenderPipelineDesc};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// SPIR-V shader module with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytes
    pub fn from_bytes(
        device: Device,
        stage: vk::ShaderStageFlags,
        bytes: &[u8],
    ) -> VulkanResult<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(VulkanError::ArgumentInvalid(format!(
                "SPIR-V size {} is not a non-zero multiple of 4",
                bytes.len()
            )));
        }

        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| VulkanError::ArgumentInvalid(format!("Invalid SPIR-V: {e}")))?;
        log::debug!("[SHADER] Creating {:?} module from {} words", stage, words.len());

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe {
            device.create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, module, stage })
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage the module was created for
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Driver pipeline cache, seeded from and serialized to bytes
pub struct PipelineCache {
    device: Device,
    cache: vk::PipelineCache,
}

impl PipelineCache {
    /// Create a cache, seeded with `initial_data` when given
    pub fn new(device: Device, initial_data: Option<&[u8]>) -> VulkanResult<Self> {
        let mut create_info = vk::PipelineCacheCreateInfo::builder();
        if let Some(data) = initial_data {
            create_info = create_info.initial_data(data);
        }

        let cache = unsafe {
            device.create_pipeline_cache(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, cache })
    }

    /// Get the cache handle
    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Serialized cache contents
    pub fn data(&self) -> VulkanResult<Vec<u8>> {
        unsafe {
            self.device.get_pipeline_cache_data(self.cache)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_cache(self.cache, None);
        }
    }
}

/// A built pipeline and the layout it was built against
///
/// The layout is owned by the bindless table; only the pipeline is destroyed here.
pub struct VulkanPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl VulkanPipeline {
    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout the pipeline was built against
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        log::debug!("[PIPELINE] Destroying pipeline {:?}", self.pipeline);
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Pool entry of a compute pipeline
pub struct ComputePipelineState {
    /// Descriptor used for (re)building
    pub desc: ComputePipelineDesc,
    /// Built pipeline; `None` only while being replaced
    pub pipeline: Option<VulkanPipeline>,
}

/// Pool entry of a render pipeline
pub struct RenderPipelineState {
    /// Descriptor used for (re)building
    pub desc: RenderPipelineDesc,
    /// Built pipeline; `None` only while being replaced
    pub pipeline: Option<VulkanPipeline>,
}

fn entry_point_name(name: &str) -> VulkanResult<CString> {
    CString::new(name)
        .map_err(|_| {
            VulkanError::ArgumentInvalid(format!("Entry point {name:?} contains a NUL byte"))
        })
}

/// Build a compute pipeline
pub fn create_compute_pipeline(
    device: &Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    shader: &ShaderModule,
    desc: &ComputePipelineDesc,
) -> VulkanResult<VulkanPipeline> {
    let entry_point = entry_point_name(&desc.entry_point)?;
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader.handle())
        .name(&entry_point)
        .build();

    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout);

    let pipelines = unsafe {
        device.create_compute_pipelines(cache, &[pipeline_info.build()], None)
            .map_err(|(_, err)| VulkanError::Api(err))?
    };
    let pipeline = pipelines
        .into_iter()
        .next()
        .ok_or_else(|| {
            VulkanError::RuntimeError("Driver returned no compute pipeline".to_string())
        })?;

    log::debug!("[PIPELINE] Built compute pipeline {:?} '{}'", pipeline, desc.debug_name);
    Ok(VulkanPipeline {
        device: device.clone(),
        pipeline,
        layout,
    })
}

fn color_blend_attachment(blend_enabled: bool) -> vk::PipelineColorBlendAttachmentState {
    if !blend_enabled {
        return vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
    }

    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
        .build()
}

/// Build a graphics pipeline for dynamic rendering
pub fn create_render_pipeline(
    device: &Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    vertex_shader: &ShaderModule,
    fragment_shader: &ShaderModule,
    desc: &RenderPipelineDesc,
) -> VulkanResult<VulkanPipeline> {
    let vertex_entry = entry_point_name(&desc.vertex_entry_point)?;
    let fragment_entry = entry_point_name(&desc.fragment_entry_point)?;

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_shader.handle())
            .name(&vertex_entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_shader.handle())
            .name(&fragment_entry)
            .build(),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(sample_count_flags(desc.samples));

    let has_depth = desc.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(has_depth)
        .depth_write_enable(has_depth)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = desc
        .color_attachments
        .iter()
        .map(|attachment| color_blend_attachment(attachment.blend_enabled))
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let color_formats: Vec<vk::Format> = desc
        .color_attachments
        .iter()
        .map(|attachment| attachment.format.to_vk())
        .collect();
    let depth_format = desc.depth_format.map_or(vk::Format::UNDEFINED, |f| f.to_vk());
    let stencil_format = desc
        .depth_format
        .filter(|f| f.properties().stencil)
        .map_or(vk::Format::UNDEFINED, |f| f.to_vk());
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(cache, &[pipeline_info.build()], None)
            .map_err(|(_, err)| VulkanError::Api(err))?
    };
    let pipeline = pipelines
        .into_iter()
        .next()
        .ok_or_else(|| {
            VulkanError::RuntimeError("Driver returned no graphics pipeline".to_string())
        })?;

    log::debug!("[PIPELINE] Built render pipeline {:?} '{}'", pipeline, desc.debug_name);
    Ok(VulkanPipeline {
        device: device.clone(),
        pipeline,
        layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_rejects_nul() {
        assert!(entry_point_name("main").is_ok());
        assert!(matches!(entry_point_name("ma\0in"), Err(VulkanError::ArgumentInvalid(_))));
    }

    #[test]
    fn test_blend_attachment_modes() {
        let opaque = color_blend_attachment(false);
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);

        let blended = color_blend_attachment(true);
        assert_eq!(blended.blend_enable, vk::TRUE);
        assert_eq!(blended.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blended.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }
}
