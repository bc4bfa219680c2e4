// Vulkan initialization: instance, physical device selection, logical device

pub mod context;

pub use context::*;
