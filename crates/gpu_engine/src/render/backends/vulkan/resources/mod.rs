//! Vulkan resource management
//!
//! Native buffers, images, samplers, pipelines and query pools, plus the
//! staging ring that feeds device-local memory and the bindless descriptor
//! table that exposes textures and samplers to shaders.

/// Buffers with persistent mapping and device addresses
pub mod buffer;

/// Images, views and samplers
pub mod texture;

/// Staging ring for uploads and readbacks
pub mod staging;

/// Bindless descriptor table
pub mod descriptor_set;

/// Shader modules, pipeline cache and pipelines
pub mod pipeline;

/// Timestamp query pools
pub mod query;

pub use buffer::{find_memory_type, VulkanBuffer};
pub use descriptor_set::{BindlessDescriptors, NUM_BUFFERED_SETS, PUSH_CONSTANTS_SIZE};
pub use pipeline::{
    ComputePipelineState, PipelineCache, RenderPipelineState, ShaderModule, VulkanPipeline,
};
pub use query::QueryPool;
pub use staging::{MemoryRegionDesc, StagingDevice, StagingRing, STAGING_ALIGNMENT};
pub use texture::{
    calc_num_mip_levels, validate_image_limits, validate_range, ImageCreateInfo, VulkanImage,
    VulkanSampler, VulkanTexture,
};
