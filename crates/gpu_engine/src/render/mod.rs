//! # Rendering System
//!
//! The [`Context`] facade and the types callers hold on to: typed handles,
//! RAII [`Holder`]s and the [`CommandBuffer`] being recorded.
//!
//! ## Architecture
//!
//! - **api**: handles, creation descriptors and the format table
//! - **holder**: RAII ownership of handles
//! - **context**: creation, upload, submission and command encoding
//! - **backends**: the Vulkan objects the context is built from

pub mod api;

/// Graphics backend implementations
///
/// Contains the Vulkan objects behind the context.
pub mod backends;

pub mod command_buffer;
pub mod context;
pub mod holder;

pub use command_buffer::{ColorTarget, CommandBuffer, DepthTarget};
pub use context::{Context, Presenter};
pub use holder::Holder;
