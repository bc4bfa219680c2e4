//! Submission tracking for immediate-mode command buffers
//!
//! [`ImmediateCommands`] owns a fixed pool of command buffers, each paired
//! with a fence and a binary semaphore. Callers acquire a slot, record into
//! it, and submit it; the returned [`SubmitHandle`] is the only way anything
//! else in the engine refers to "this piece of GPU work".
//!
//! ## Slot lifecycle
//!
//! ```text
//! Idle --acquire--> Encoding --submit--> Submitted --fence signaled + purge--> Idle
//! ```
//!
//! Submissions form a chain: each one waits on the semaphore signaled by the
//! previous one, so GPU execution order equals submission order. A submit
//! id is assigned from a running counter that skips 0, which keeps
//! `SubmitHandle::default()` free to mean "nothing to wait for".
//!
//! When every slot is in flight, `acquire` blocks on the in-flight fences
//! instead of failing.

use ash::vk;
use ash::Device;

use super::sync::{Fence, Semaphore};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Number of command buffer slots
pub const MAX_COMMAND_BUFFERS: u32 = 64;

/// Identifies one submission: the slot it ran in and its submit id
///
/// `submit_id == 0` is the empty handle, which is always ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubmitHandle {
    /// Slot index inside the tracker
    pub buffer_index: u32,
    /// Running submission counter value
    pub submit_id: u32,
}

impl SubmitHandle {
    /// Create a handle from raw parts
    pub const fn new(buffer_index: u32, submit_id: u32) -> Self {
        Self {
            buffer_index,
            submit_id,
        }
    }

    /// True if this handle refers to no submission
    pub const fn is_empty(&self) -> bool {
        self.submit_id == 0
    }

    /// Pack into a `u64` (slot index in the low half)
    pub const fn as_u64(&self) -> u64 {
        ((self.submit_id as u64) << 32) | self.buffer_index as u64
    }

    /// Unpack a value produced by [`SubmitHandle::as_u64`]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            buffer_index: (value & 0xffff_ffff) as u32,
            submit_id: (value >> 32) as u32,
        }
    }
}

/// Next value of the submit counter; 0 is skipped on wraparound
pub const fn next_submit_id(id: u32) -> u32 {
    match id.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Read access to submission completion
///
/// The staging ring and the deferred task queue only need these three
/// queries, which keeps them testable without a device.
pub trait SubmissionTimeline {
    /// Whether the submission has retired
    ///
    /// With `fast_check` no fence is polled: only slot recycling counts.
    fn is_ready(&self, handle: SubmitHandle, fast_check: bool) -> bool;

    /// Block until the submission retires
    fn wait(&mut self, handle: SubmitHandle) -> VulkanResult<()>;

    /// Handle of the most recent submission
    fn last_submit_handle(&self) -> SubmitHandle;
}

struct CommandBufferWrapper {
    cmd_buf: vk::CommandBuffer,
    in_use: bool,
    is_encoding: bool,
    handle: SubmitHandle,
    fence: Fence,
    semaphore: Semaphore,
}

/// A command buffer in the Encoding state
///
/// Must be handed back to [`ImmediateCommands::submit`].
#[derive(Debug)]
#[must_use = "an acquired command buffer must be submitted"]
pub struct AcquiredCommandBuffer {
    cmd_buf: vk::CommandBuffer,
    handle: SubmitHandle,
}

impl AcquiredCommandBuffer {
    /// Native command buffer to record into
    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd_buf
    }

    /// Handle this buffer will have once submitted
    pub fn handle(&self) -> SubmitHandle {
        self.handle
    }
}

/// Fixed pool of command buffers with fence-based retirement
pub struct ImmediateCommands {
    device: Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    buffers: Vec<CommandBufferWrapper>,
    last_submit_semaphore: vk::Semaphore,
    wait_semaphore: vk::Semaphore,
    num_available: u32,
    last_submit_handle: SubmitHandle,
    submit_counter: u32,
}

impl ImmediateCommands {
    /// Create the command pool and all slots
    pub fn new(device: Device, queue: vk::Queue, queue_family: u32) -> VulkanResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            )
            .queue_family_index(queue_family);

        let command_pool = unsafe {
            device.create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        // From here on Drop cleans up whatever was created
        let mut commands = Self {
            device,
            queue,
            command_pool,
            buffers: Vec::with_capacity(MAX_COMMAND_BUFFERS as usize),
            last_submit_semaphore: vk::Semaphore::null(),
            wait_semaphore: vk::Semaphore::null(),
            num_available: 0,
            last_submit_handle: SubmitHandle::default(),
            submit_counter: 1,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_COMMAND_BUFFERS);
        let cmd_bufs = unsafe {
            commands.device.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        for (index, cmd_buf) in cmd_bufs.into_iter().enumerate() {
            commands.buffers.push(CommandBufferWrapper {
                cmd_buf,
                in_use: false,
                is_encoding: false,
                handle: SubmitHandle::new(index as u32, 0),
                fence: Fence::new(commands.device.clone(), false)?,
                semaphore: Semaphore::new(commands.device.clone())?,
            });
            commands.num_available += 1;
        }

        log::debug!("Created {} immediate command buffers", MAX_COMMAND_BUFFERS);
        Ok(commands)
    }

    /// Queue all submissions go to
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Number of idle slots
    pub fn num_available(&self) -> u32 {
        self.num_available
    }

    /// Take an idle slot and begin recording
    ///
    /// Blocks on in-flight work when no slot is idle.
    pub fn acquire(&mut self) -> VulkanResult<AcquiredCommandBuffer> {
        if self.num_available == 0 {
            self.purge()?;
        }

        while self.num_available == 0 {
            log::trace!("Waiting for command buffers...");
            let in_flight: Vec<vk::Fence> = self
                .buffers
                .iter()
                .filter(|buf| buf.in_use && !buf.is_encoding)
                .map(|buf| buf.fence.handle())
                .collect();
            if in_flight.is_empty() {
                return Err(VulkanError::InvalidOperation {
                    reason: "All command buffers are being encoded".to_string(),
                });
            }
            unsafe {
                self.device.wait_for_fences(&in_flight, false, u64::MAX)
                    .map_err(VulkanError::Api)?;
            }
            self.purge()?;
        }

        let index = self
            .buffers
            .iter()
            .position(|buf| !buf.in_use)
            .ok_or_else(|| VulkanError::RuntimeError("No available command buffers".to_string()))?;

        let submit_id = self.submit_counter;
        let buf = &mut self.buffers[index];
        buf.handle = SubmitHandle::new(index as u32, submit_id);

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.begin_command_buffer(buf.cmd_buf, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        buf.in_use = true;
        buf.is_encoding = true;
        self.num_available -= 1;

        Ok(AcquiredCommandBuffer {
            cmd_buf: buf.cmd_buf,
            handle: buf.handle,
        })
    }

    /// End recording and submit to the queue
    pub fn submit(&mut self, acquired: AcquiredCommandBuffer) -> VulkanResult<SubmitHandle> {
        let index = acquired.handle.buffer_index as usize;
        {
            let buf = &self.buffers[index];
            assert!(
                buf.is_encoding && buf.handle == acquired.handle,
                "Submitting a command buffer that is not being encoded"
            );
        }

        if let Err(e) = self.end_and_queue(index) {
            self.recycle(index);
            return Err(e);
        }

        let buf = &mut self.buffers[index];
        buf.is_encoding = false;
        self.last_submit_semaphore = buf.semaphore.handle();
        self.last_submit_handle = buf.handle;
        self.wait_semaphore = vk::Semaphore::null();
        self.submit_counter = next_submit_id(self.submit_counter);

        log::trace!("Submitted {:?}", self.last_submit_handle);
        Ok(self.last_submit_handle)
    }

    fn end_and_queue(&self, index: usize) -> VulkanResult<()> {
        let buf = &self.buffers[index];
        unsafe {
            self.device.end_command_buffer(buf.cmd_buf)
                .map_err(VulkanError::Api)?;
        }

        let mut wait_semaphores = Vec::with_capacity(2);
        if self.wait_semaphore != vk::Semaphore::null() {
            wait_semaphores.push(self.wait_semaphore);
        }
        if self.last_submit_semaphore != vk::Semaphore::null() {
            wait_semaphores.push(self.last_submit_semaphore);
        }
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let cmd_bufs = [buf.cmd_buf];
        let signal_semaphores = [buf.semaphore.handle()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmd_bufs)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.queue_submit(self.queue, &[submit_info], buf.fence.handle())
                .map_err(VulkanError::Api)
        }
    }

    /// Give back a slot that was acquired but will never be submitted
    pub fn abandon(&mut self, handle: SubmitHandle) {
        let index = handle.buffer_index as usize;
        let encoding = self
            .buffers
            .get(index)
            .map_or(false, |buf| buf.is_encoding && buf.handle == handle);
        if encoding {
            log::warn!("Abandoning command buffer {:?}", handle);
            self.recycle(index);
        }
    }

    // Return a slot whose submission never reached the queue
    fn recycle(&mut self, index: usize) {
        let buf = &mut self.buffers[index];
        unsafe {
            let _ =
                self.device.reset_command_buffer(buf.cmd_buf, vk::CommandBufferResetFlags::empty());
        }
        buf.in_use = false;
        buf.is_encoding = false;
        self.num_available += 1;
    }

    /// Block until `handle` retires; empty and retired handles return at once
    ///
    /// # Panics
    ///
    /// Waiting on a slot that is still being encoded is a logic error.
    pub fn wait(&mut self, handle: SubmitHandle) -> VulkanResult<()> {
        if self.is_ready(handle, false) {
            return Ok(());
        }

        let buf = &self.buffers[handle.buffer_index as usize];
        assert!(!buf.is_encoding, "Waiting on a command buffer that has not been submitted");

        buf.fence.wait(u64::MAX)?;
        self.purge()
    }

    /// Block until every submitted slot retires
    pub fn wait_all(&mut self) -> VulkanResult<()> {
        let fences: Vec<vk::Fence> = self
            .buffers
            .iter()
            .filter(|buf| buf.in_use && !buf.is_encoding)
            .map(|buf| buf.fence.handle())
            .collect();

        if !fences.is_empty() {
            unsafe {
                self.device.wait_for_fences(&fences, true, u64::MAX)
                    .map_err(VulkanError::Api)?;
            }
        }

        self.purge()
    }

    /// Recycle every submitted slot whose fence has signaled
    pub fn purge(&mut self) -> VulkanResult<()> {
        for buf in &mut self.buffers {
            if !buf.in_use || buf.is_encoding {
                continue;
            }

            if buf.fence.is_signaled()? {
                unsafe {
                    self.device.reset_command_buffer(
                        buf.cmd_buf,
                        vk::CommandBufferResetFlags::empty(),
                    )
                        .map_err(VulkanError::Api)?;
                }
                buf.fence.reset()?;
                buf.in_use = false;
                self.num_available += 1;
            }
        }
        Ok(())
    }

    /// Make the next submission wait on an external semaphore
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        assert!(
            self.wait_semaphore == vk::Semaphore::null(),
            "A wait semaphore is already pending"
        );
        self.wait_semaphore = semaphore;
    }

    /// Take the semaphore signaled by the last submission out of the chain
    ///
    /// The next submission will not wait on it; the caller (usually
    /// presentation) becomes responsible for waiting.
    pub fn acquire_last_submit_semaphore(&mut self) -> vk::Semaphore {
        std::mem::replace(&mut self.last_submit_semaphore, vk::Semaphore::null())
    }
}

impl SubmissionTimeline for ImmediateCommands {
    fn is_ready(&self, handle: SubmitHandle, fast_check: bool) -> bool {
        if handle.is_empty() {
            return true;
        }

        let Some(buf) = self.buffers.get(handle.buffer_index as usize) else {
            return true;
        };

        // recycled, or recycled and reused by a later submission
        if !buf.in_use || buf.handle.submit_id != handle.submit_id {
            return true;
        }

        if fast_check {
            return false;
        }

        buf.fence.is_signaled().unwrap_or(false)
    }

    fn wait(&mut self, handle: SubmitHandle) -> VulkanResult<()> {
        ImmediateCommands::wait(self, handle)
    }

    fn last_submit_handle(&self) -> SubmitHandle {
        self.last_submit_handle
    }
}

impl Drop for ImmediateCommands {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all() {
            log::error!("Failed to wait for command buffers during shutdown: {}", e);
        }
        // Fences and semaphores are destroyed with `buffers`
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_handle_is_empty() {
        assert!(SubmitHandle::default().is_empty());
        assert!(SubmitHandle::new(5, 0).is_empty());
        assert!(!SubmitHandle::new(0, 1).is_empty());
    }

    #[test]
    fn test_submit_id_skips_zero() {
        assert_eq!(next_submit_id(1), 2);
        assert_eq!(next_submit_id(u32::MAX - 1), u32::MAX);
        assert_eq!(next_submit_id(u32::MAX), 1);
    }

    #[test]
    fn test_handle_packing() {
        let handle = SubmitHandle::new(63, 0xdead_beef);
        let packed = handle.as_u64();
        assert_eq!(packed, (0xdead_beef_u64 << 32) | 63);
        assert_eq!(SubmitHandle::from_u64(packed), handle);
        assert_eq!(SubmitHandle::from_u64(0), SubmitHandle::default());
    }
}
