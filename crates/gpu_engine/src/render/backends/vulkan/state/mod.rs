// Vulkan state management: synchronization, submission tracking, deferred cleanup

pub mod deferred;
pub mod immediate;
pub mod sync;

pub use deferred::DeferredTaskQueue;
pub use immediate::{
    next_submit_id, AcquiredCommandBuffer, ImmediateCommands, SubmissionTimeline, SubmitHandle,
    MAX_COMMAND_BUFFERS,
};
pub use sync::{
    buffer_barrier_masks, image_memory_barrier, transfer_write_buffer_barrier, Fence,
    ImageTransition, Semaphore,
};
