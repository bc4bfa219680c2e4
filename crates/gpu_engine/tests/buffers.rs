//! Buffer uploads through the staging ring, and deferred buffer destruction

mod common;

use gpu_engine::render::api::{BufferDesc, BufferUsage, StorageType};
use gpu_engine::ResultCode;

#[test]
fn test_small_upload_round_trip() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let data = common::pattern(64, 7);
    let desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, 64)
        .with_data(&data)
        .with_debug_name("round trip");
    let buffer = ctx.create_buffer(&desc).unwrap();

    assert_eq!(common::read_buffer(&mut ctx, buffer.handle(), 64), data);
}

#[test]
fn test_host_visible_upload_is_direct() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let desc = BufferDesc::new(BufferUsage::UNIFORM, StorageType::HostVisible, 256);
    let buffer = ctx.create_buffer(&desc).unwrap();
    let in_flight_before = ctx.staging_ring().in_flight();

    let data = common::pattern(32, 1);
    ctx.upload_buffer(buffer.handle(), &data, 64).unwrap();

    assert_eq!(ctx.staging_ring().in_flight(), in_flight_before);
    assert_eq!(&ctx.mapped_slice(buffer.handle()).unwrap()[64..96], data.as_slice());
    assert!(!ctx.mapped_ptr(buffer.handle()).is_null());
}

#[test]
fn test_upload_larger_than_ring_wraps() {
    let Some(mut ctx) = common::small_context() else { return };

    let ring_size = ctx.staging_ring().size() as usize;
    let size = ring_size * 4;
    let data = common::pattern(size, 3);
    let desc =
        BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, size).with_debug_name("large");
    let buffer = ctx.create_buffer(&desc).unwrap();

    ctx.upload_buffer(buffer.handle(), &data, 0).unwrap();
    assert!(ctx.staging_ring().in_flight() >= 1);

    assert_eq!(common::read_buffer(&mut ctx, buffer.handle(), size), data);
}

#[test]
fn test_out_of_range_upload_writes_nothing() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let zeros = vec![0u8; 64];
    let desc =
        BufferDesc::new(BufferUsage::STORAGE, StorageType::HostVisible, 64).with_data(&zeros);
    let buffer = ctx.create_buffer(&desc).unwrap();

    let err = ctx.upload_buffer(buffer.handle(), &[0xAB; 16], 56).unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentOutOfRange);

    let err = ctx.upload_buffer(buffer.handle(), &[0xAB; 1], usize::MAX).unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentOutOfRange);

    assert_eq!(ctx.mapped_slice(buffer.handle()).unwrap(), zeros.as_slice());
}

#[test]
fn test_buffer_creation_validation() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let err = ctx
        .create_buffer(&BufferDesc::new(BufferUsage::empty(), StorageType::Device, 16))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentOutOfRange);

    let err = ctx
        .create_buffer(&BufferDesc::new(BufferUsage::UNIFORM, StorageType::Device, usize::MAX / 2))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::RuntimeError);
}

#[test]
fn test_dropped_buffer_is_destroyed_after_its_submission() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let data = common::pattern(128, 9);
    let desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, 128).with_data(&data);
    let src = ctx.create_buffer(&desc).unwrap();
    let dst = common::readback_buffer(&mut ctx, 128);
    let src_handle = src.handle();
    let (buffers_before, _, _) = ctx.num_objects();

    let cmd = ctx.acquire_command_buffer().unwrap();
    ctx.cmd_copy_buffer(&cmd, src_handle, 0, dst.handle(), 0, 128);
    drop(src);
    let tasks_before = ctx.num_deferred_tasks();
    ctx.process_releases();

    // The pool slot is freed at once, the native buffer waits for the GPU
    assert_eq!(ctx.num_objects().0, buffers_before - 1);
    assert_eq!(ctx.num_deferred_tasks(), tasks_before + 1);
    assert!(ctx.mapped_slice(src_handle).is_none());

    let handle = ctx.submit(cmd, None).unwrap();
    ctx.wait(handle).unwrap();
    assert_eq!(ctx.num_deferred_tasks(), 0);
    assert_eq!(ctx.mapped_slice(dst.handle()).unwrap(), data.as_slice());

    // Stale handles are ignored
    ctx.destroy_buffer(src_handle);
    assert_eq!(ctx.num_deferred_tasks(), 0);
}

#[test]
fn test_gpu_address_is_offset() {
    let Some(mut ctx) = common::context(Default::default()) else { return };

    let buffer = ctx
        .create_buffer(&BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, 256))
        .unwrap();
    let base = ctx.gpu_address(buffer.handle(), 0);
    assert_ne!(base, 0);
    assert_eq!(ctx.gpu_address(buffer.handle(), 64), base + 64);

    let vertices = ctx
        .create_buffer(&BufferDesc::new(BufferUsage::VERTEX, StorageType::Device, 256))
        .unwrap();
    assert_eq!(ctx.gpu_address(vertices.handle(), 0), 0);
}
