//! Vulkan backend implementation
//!
//! Organized into initialization, resources and state modules.

/// Vulkan initialization types (instance, device, errors)
pub mod initialization;

/// Vulkan resource management (buffers, textures, staging, descriptors, pipelines)
pub mod resources;

/// Vulkan state management (submission tracking, deferred tasks, barriers)
pub mod state;

// Re-export core initialization types
pub use initialization::context::{
    LogicalDevice, PhysicalDeviceInfo, ResultCode, UpdateAfterBindLimits, VulkanError,
    VulkanInstance, VulkanResult,
};
