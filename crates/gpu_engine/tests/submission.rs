//! Command buffer submission and presentation

mod common;

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use ash::vk;
use gpu_engine::core::ContextConfig;
use gpu_engine::render::ColorTarget;
use gpu_engine::{Presenter, ResultCode, SubmitHandle, VulkanError, VulkanResult};

#[test]
fn test_second_acquire_panics() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let first = ctx.acquire_command_buffer().unwrap();
    let second = panic::catch_unwind(AssertUnwindSafe(|| ctx.acquire_command_buffer().map(drop)));
    assert!(second.is_err());

    // The context is still usable
    let handle = ctx.submit(first, None).unwrap();
    ctx.wait(handle).unwrap();
    let cmd = ctx.acquire_command_buffer().unwrap();
    ctx.submit(cmd, None).unwrap();
    ctx.wait_all().unwrap();
}

#[test]
fn test_submit_handles_are_ordered() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let mut last = SubmitHandle::default();
    for _ in 0..100 {
        let cmd = ctx.acquire_command_buffer().unwrap();
        let handle = ctx.submit(cmd, None).unwrap();
        assert!(!handle.is_empty());
        assert!(handle.submit_id > last.submit_id);
        last = handle;
    }
    ctx.wait(last).unwrap();
    ctx.wait(SubmitHandle::default()).unwrap();
}

#[test]
fn test_deferred_task_runs_after_wait() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let ran = Rc::new(Cell::new(false));
    let cmd = ctx.acquire_command_buffer().unwrap();
    let flag = Rc::clone(&ran);
    ctx.deferred_task(move || flag.set(true), SubmitHandle::default());
    assert!(!ran.get());

    let handle = ctx.submit(cmd, None).unwrap();
    ctx.wait(handle).unwrap();
    assert!(ran.get());
}

struct RecordingPresenter {
    device: ash::Device,
    presented: Rc<Cell<u32>>,
}

impl Presenter for RecordingPresenter {
    fn present(&mut self, queue: vk::Queue, wait_semaphore: vk::Semaphore) -> VulkanResult<()> {
        assert_ne!(wait_semaphore, vk::Semaphore::null());

        // Consume the semaphore the way a present would
        let semaphores = [wait_semaphore];
        let stages = [vk::PipelineStageFlags::BOTTOM_OF_PIPE];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .build();
        unsafe {
            self.device
                .queue_submit(queue, &[submit], vk::Fence::null())
                .map_err(VulkanError::Api)?;
        }
        self.presented.set(self.presented.get() + 1);
        Ok(())
    }
}

#[test]
fn test_present_calls_presenter() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };
    let device = ctx.device().clone();

    // Stand-in for a swapchain image, owned by the test
    let extent = vk::Extent2D { width: 64, height: 64 };
    let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
    let info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::B8G8R8A8_UNORM)
        .extent(vk::Extent3D { width: 64, height: 64, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let (image, memory) = unsafe {
        let image = device.create_image(&info, None).unwrap();
        let requirements = device.get_image_memory_requirements(image);
        let alloc = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(requirements.memory_type_bits.trailing_zeros());
        let memory = device.allocate_memory(&alloc, None).unwrap();
        device.bind_image_memory(image, memory, 0).unwrap();
        (image, memory)
    };

    let presented = Rc::new(Cell::new(0));
    ctx.set_presenter(Box::new(RecordingPresenter {
        device: device.clone(),
        presented: Rc::clone(&presented),
    }));

    let target = ctx
        .register_swapchain_image(image, vk::Format::B8G8R8A8_UNORM, extent, usage, "swapchain 0")
        .unwrap();
    let err = ctx
        .register_swapchain_image(
            image,
            vk::Format::B8G8R8A8_UNORM,
            extent,
            usage,
            "swapchain 0 again",
        )
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidOperation);

    for frame in 1..=3 {
        let cmd = ctx.acquire_command_buffer().unwrap();
        ctx.cmd_begin_rendering(
            &cmd,
            &[ColorTarget::cleared(target.handle(), [0.1, 0.2, 0.3, 1.0])],
            None,
        );
        ctx.cmd_end_rendering(&cmd);
        ctx.submit(cmd, Some(target.handle())).unwrap();
        assert_eq!(presented.get(), frame);
    }

    // No present target, no presenter call
    let cmd = ctx.acquire_command_buffer().unwrap();
    ctx.submit(cmd, None).unwrap();
    assert_eq!(presented.get(), 3);

    drop(target);
    ctx.wait_all().unwrap();
    unsafe {
        device.device_wait_idle().unwrap();
        device.destroy_image(image, None);
        device.free_memory(memory, None);
    }
}
