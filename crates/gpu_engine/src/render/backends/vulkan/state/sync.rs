//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for the fence and semaphore owned by every submission slot,
//! plus the barrier helpers used by staging transfers and layout transitions.

use ash::vk;
use ash::Device;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Semaphore wrapper with RAII cleanup
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device.create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, fence })
    }

    /// Block until the fence is signaled or `timeout` nanoseconds pass
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        unsafe {
            self.device.wait_for_fences(&[self.fence], true, timeout)
                .map_err(VulkanError::Api)
        }
    }

    /// Non-blocking signaled check
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        unsafe {
            self.device.get_fence_status(self.fence)
                .map_err(VulkanError::Api)
        }
    }

    /// Reset fence
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device.reset_fences(&[self.fence])
                .map_err(VulkanError::Api)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Destination stage and access mask for a buffer written by a transfer
///
/// Every transfer destination is made visible to all commands; indirect,
/// index and vertex buffers additionally get the fixed-function stage that
/// consumes them.
pub fn buffer_barrier_masks(
    usage: vk::BufferUsageFlags,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stage = vk::PipelineStageFlags::ALL_COMMANDS;
    let mut access = vk::AccessFlags::empty();

    if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
        stage |= vk::PipelineStageFlags::DRAW_INDIRECT;
        access |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        stage |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::INDEX_READ;
    }
    if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        stage |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }

    (stage, access)
}

/// Record a transfer-write → consumer barrier on a range of `buffer`
pub fn transfer_write_buffer_barrier(
    device: &Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    usage: vk::BufferUsageFlags,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
) {
    let (dst_stage, dst_access) = buffer_barrier_masks(usage);
    let barrier = vk::BufferMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(offset)
        .size(size)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }
}

/// Parameters of one image layout transition
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    /// Access completed before the barrier
    pub src_access: vk::AccessFlags,
    /// Access that waits on the barrier
    pub dst_access: vk::AccessFlags,
    /// Layout before
    pub old_layout: vk::ImageLayout,
    /// Layout after
    pub new_layout: vk::ImageLayout,
    /// Stages that must complete
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
}

/// Record an image memory barrier over `range`
pub fn image_memory_barrier(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    transition: ImageTransition,
    range: vk::ImageSubresourceRange,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            transition.src_stage,
            transition.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_storage_barrier() {
        let (stage, access) = buffer_barrier_masks(vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert!(access.is_empty());
    }

    #[test]
    fn test_indirect_barrier() {
        let (stage, access) = buffer_barrier_masks(
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        );
        assert!(stage.contains(vk::PipelineStageFlags::DRAW_INDIRECT));
        assert_eq!(access, vk::AccessFlags::INDIRECT_COMMAND_READ);
    }

    #[test]
    fn test_index_and_vertex_barrier() {
        let (stage, access) = buffer_barrier_masks(
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER,
        );
        assert!(stage.contains(vk::PipelineStageFlags::VERTEX_INPUT));
        assert!(!stage.contains(vk::PipelineStageFlags::DRAW_INDIRECT));
        assert_eq!(access, vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
    }
}
