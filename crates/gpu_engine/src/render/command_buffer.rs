//! Command buffer handed out by the context
//!
//! Commands are recorded through `Context::cmd_*`; the buffer itself only
//! carries the native handle and the per-pass state those calls need.

use std::cell::{Cell, RefCell};

use ash::vk;

use crate::render::api::handles::TextureHandle;
use crate::render::backends::vulkan::state::{AcquiredCommandBuffer, SubmitHandle};

/// A command buffer in the Encoding state
///
/// Only one exists per context at a time. Give it back through
/// `Context::submit`.
#[must_use = "a command buffer must be submitted"]
pub struct CommandBuffer {
    inner: AcquiredCommandBuffer,
    color_targets: RefCell<Vec<TextureHandle>>,
    is_rendering: Cell<bool>,
}

impl CommandBuffer {
    pub(crate) fn new(inner: AcquiredCommandBuffer) -> Self {
        Self {
            inner,
            color_targets: RefCell::new(Vec::new()),
            is_rendering: Cell::new(false),
        }
    }

    pub(crate) fn raw(&self) -> vk::CommandBuffer {
        self.inner.raw()
    }

    /// Handle this buffer will have once submitted
    pub fn handle(&self) -> SubmitHandle {
        self.inner.handle()
    }

    /// True between `cmd_begin_rendering` and `cmd_end_rendering`
    pub fn is_rendering(&self) -> bool {
        self.is_rendering.get()
    }

    pub(crate) fn begin_pass(&self, color_targets: Vec<TextureHandle>) {
        assert!(!self.is_rendering.get(), "Rendering already begun on this command buffer");
        *self.color_targets.borrow_mut() = color_targets;
        self.is_rendering.set(true);
    }

    pub(crate) fn end_pass(&self) -> Vec<TextureHandle> {
        assert!(self.is_rendering.get(), "cmd_end_rendering without cmd_begin_rendering");
        self.is_rendering.set(false);
        std::mem::take(&mut *self.color_targets.borrow_mut())
    }

    pub(crate) fn into_inner(self) -> AcquiredCommandBuffer {
        assert!(!self.is_rendering.get(), "Submitting a command buffer inside a rendering pass");
        self.inner
    }
}

/// A color attachment of a rendering pass
#[derive(Debug, Clone, Copy)]
pub struct ColorTarget {
    /// Texture rendered into
    pub texture: TextureHandle,
    /// Clear color, or `None` to load the existing contents
    pub clear: Option<[f32; 4]>,
}

impl ColorTarget {
    /// Clear `texture` to `color`
    pub fn cleared(texture: TextureHandle, color: [f32; 4]) -> Self {
        Self {
            texture,
            clear: Some(color),
        }
    }

    /// Keep the existing contents of `texture`
    pub fn loaded(texture: TextureHandle) -> Self {
        Self { texture, clear: None }
    }

    pub(crate) fn load_op(&self) -> vk::AttachmentLoadOp {
        if self.clear.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        }
    }

    pub(crate) fn clear_value(&self) -> vk::ClearValue {
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear.unwrap_or_default(),
            },
        }
    }
}

/// The depth attachment of a rendering pass
#[derive(Debug, Clone, Copy)]
pub struct DepthTarget {
    /// Depth texture
    pub texture: TextureHandle,
    /// Clear depth, or `None` to load
    pub clear: Option<f32>,
}

impl DepthTarget {
    /// Clear `texture` to `depth`
    pub fn cleared(texture: TextureHandle, depth: f32) -> Self {
        Self {
            texture,
            clear: Some(depth),
        }
    }

    pub(crate) fn load_op(&self) -> vk::AttachmentLoadOp {
        if self.clear.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        }
    }

    pub(crate) fn clear_value(&self) -> vk::ClearValue {
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: self.clear.unwrap_or(1.0),
                stencil: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_ops_follow_clear_values() {
        let texture = TextureHandle::new(1, 1);
        assert_eq!(ColorTarget::cleared(texture, [0.0; 4]).load_op(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(ColorTarget::loaded(texture).load_op(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(DepthTarget::cleared(texture, 1.0).load_op(), vk::AttachmentLoadOp::CLEAR);

        let value = DepthTarget::cleared(texture, 0.25).clear_value();
        assert_eq!(unsafe { value.depth_stencil.depth }, 0.25);
    }
}
