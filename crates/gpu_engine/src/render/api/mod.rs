//! Public resource API
//!
//! Handles, creation descriptors and the texture format table shared by the
//! context and its callers.

pub mod descriptors;
pub mod format;
pub mod handles;

pub use descriptors::{
    BufferDesc, BufferUsage, ColorAttachmentDesc, ComputePipelineDesc, Dimensions,
    RenderPipelineDesc, SamplerDesc, ShaderModuleDesc, StorageType, TextureDesc, TextureRangeDesc,
    TextureType, TextureUsage,
};
pub use format::{closest_depth_stencil_format, Format, FormatProperties};
pub use handles::{
    BufferHandle, BufferTag, ComputePipelineHandle, ComputePipelineTag, QueryPoolHandle,
    QueryPoolTag, ReleasedHandle, RenderPipelineHandle, RenderPipelineTag, ResourceTag,
    SamplerHandle, SamplerTag, ShaderModuleHandle, ShaderModuleTag, TextureHandle, TextureTag,
};
