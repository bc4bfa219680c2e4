//! # GPU Engine
//!
//! A command and resource lifecycle engine over Vulkan 1.3.
//!
//! ## Features
//!
//! - **Submission tracking**: a fixed ring of command buffers with fences and
//!   chained semaphores, addressed through [`SubmitHandle`]s
//! - **Staging ring**: uploads and readbacks through one host-visible buffer
//! - **Deferred deletion**: resources are destroyed only after the GPU is done
//!   with them
//! - **Bindless descriptors**: textures and samplers are addressed by pool slot
//!   and the table grows on demand
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpu_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = Context::new(ContextConfig::new().with_application_name("demo"))?;
//!
//!     let desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, 64)
//!         .with_debug_name("data");
//!     let buffer = ctx.create_buffer(&desc)?;
//!     ctx.upload_buffer(buffer.handle(), &[1u8; 64], 0)?;
//!
//!     let cmd = ctx.acquire_command_buffer()?;
//!     let handle = ctx.submit(cmd, None)?;
//!     ctx.wait(handle)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core engine modules
pub mod core;

pub mod config;
pub mod foundation;
pub mod render;

pub use render::backends::vulkan::state::SubmitHandle;
pub use render::backends::vulkan::{ResultCode, VulkanError, VulkanResult};
pub use render::{CommandBuffer, Context, Holder, Presenter};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        core::config::ContextConfig,
        foundation::Handle,
        render::{
            api::{
                BufferDesc, BufferHandle, BufferUsage, ComputePipelineDesc, Dimensions, Format,
                RenderPipelineDesc, SamplerDesc, ShaderModuleDesc, StorageType, TextureDesc,
                TextureHandle, TextureRangeDesc, TextureType, TextureUsage,
            },
            ColorTarget, CommandBuffer, Context, DepthTarget, Holder, Presenter,
        },
        SubmitHandle, VulkanError, VulkanResult,
    };
}
