//! Shared helpers for the device-backed tests
//!
//! Every test creates its own context and returns early when the machine has
//! no Vulkan 1.3 device.

#![allow(dead_code)]

use ash::vk;
use gpu_engine::core::ContextConfig;
use gpu_engine::render::api::{BufferDesc, BufferHandle, BufferUsage, StorageType};
use gpu_engine::{Context, Holder};
use gpu_engine::render::api::BufferTag;

/// Create a context, or log why the test is skipped
pub fn context(config: ContextConfig) -> Option<Context> {
    try_context(config.with_validation(false))
}

/// Context that aborts on validation errors when the layer is installed
pub fn validated_context() -> Option<Context> {
    try_context(
        ContextConfig::new()
            .with_validation(true)
            .with_terminate_on_validation_error(true),
    )
}

fn try_context(config: ContextConfig) -> Option<Context> {
    gpu_engine::foundation::logging::try_init();
    match Context::new(config) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            log::warn!("Skipping: no usable Vulkan 1.3 device ({e})");
            None
        }
    }
}

/// Context with the smallest staging ring the config accepts
pub fn small_context() -> Option<Context> {
    context(ContextConfig::new().with_staging_buffer_size(64 * 1024))
}

/// Deterministic non-repeating-looking test bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Host-visible buffer to copy results into
pub fn readback_buffer(ctx: &mut Context, size: usize) -> Holder<BufferTag> {
    let desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::HostVisible, size)
        .with_debug_name("readback");
    ctx.create_buffer(&desc).expect("readback buffer")
}

/// Copy `src` into a fresh host-visible buffer and return its bytes
pub fn read_buffer(ctx: &mut Context, src: BufferHandle, size: usize) -> Vec<u8> {
    let readback = readback_buffer(ctx, size);
    let cmd = ctx.acquire_command_buffer().expect("acquire");
    ctx.cmd_copy_buffer(&cmd, src, 0, readback.handle(), 0, size as u64);
    ctx.cmd_buffer_barrier(
        &cmd,
        readback.handle(),
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::HOST,
    );
    let handle = ctx.submit(cmd, None).expect("submit");
    ctx.wait(handle).expect("wait");
    ctx.invalidate_mapped_memory(readback.handle(), 0, size).expect("invalidate");
    ctx.mapped_slice(readback.handle()).expect("mapped").to_vec()
}

/// SPIR-V of an empty compute shader with a 1x1x1 work group
pub fn noop_compute_spirv() -> Vec<u8> {
    let words: [u32; 35] = [
        0x0723_0203, 0x0001_0000, 0, 5, 0,
        // OpCapability Shader
        0x0002_0011, 1,
        // OpMemoryModel Logical GLSL450
        0x0003_000E, 0, 1,
        // OpEntryPoint GLCompute %3 "main"
        0x0005_000F, 5, 3, 0x6E69_616D, 0,
        // OpExecutionMode %3 LocalSize 1 1 1
        0x0006_0010, 3, 17, 1, 1, 1,
        // %1 = OpTypeVoid
        0x0002_0013, 1,
        // %2 = OpTypeFunction %1
        0x0003_0021, 2, 1,
        // %3 = OpFunction %1 None %2
        0x0005_0036, 1, 3, 0, 2,
        // %4 = OpLabel
        0x0002_00F8, 4,
        // OpReturn
        0x0001_00FD,
        // OpFunctionEnd
        0x0001_0038,
    ];
    bytemuck::cast_slice(&words).to_vec()
}
