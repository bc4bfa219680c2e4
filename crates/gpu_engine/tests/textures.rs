//! Texture transfers and bindless table growth

mod common;

use ash::vk;
use gpu_engine::core::ContextConfig;
use gpu_engine::render::api::{
    ComputePipelineDesc, ComputePipelineHandle, Dimensions, Format, SamplerDesc, ShaderModuleDesc,
    StorageType, TextureDesc, TextureRangeDesc, TextureUsage,
};
use gpu_engine::{Context, ResultCode};

#[test]
fn test_texture_upload_download_round_trip() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let pixels = common::pattern(16 * 16 * 4, 5);
    let desc = TextureDesc::new_2d(Format::Rgba8Unorm, 16, 16, TextureUsage::SAMPLED)
        .with_data(&pixels, 1)
        .with_debug_name("round trip");
    let texture = ctx.create_texture(&desc).unwrap();

    let mut out = vec![0u8; pixels.len()];
    let range = TextureRangeDesc::new(Dimensions::new_2d(16, 16));
    ctx.download_texture(texture.handle(), &range, &mut out).unwrap();
    assert_eq!(out, pixels);

    // Overwrite a 4x4 block and check the texels around it survive
    let block = [0xFFu8; 4 * 4 * 4];
    let region = TextureRangeDesc::new(Dimensions::new_2d(4, 4)).with_offset(4, 8, 0);
    ctx.upload_texture(texture.handle(), &region, &block).unwrap();
    ctx.download_texture(texture.handle(), &range, &mut out).unwrap();

    for y in 0..16usize {
        for x in 0..16usize {
            let at = (y * 16 + x) * 4;
            let inside = (4..8).contains(&x) && (8..12).contains(&y);
            let expected = if inside { &block[..4] } else { &pixels[at..at + 4] };
            assert_eq!(&out[at..at + 4], expected, "texel ({x}, {y})");
        }
    }
}

#[test]
fn test_mip_chain_upload() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    // Mip i of a 16x16 texture is filled with i + 1
    let mut data = Vec::new();
    for mip in 0..5u32 {
        let side = (16 >> mip) as usize;
        data.extend(std::iter::repeat(mip as u8 + 1).take(side * side * 4));
    }
    let desc = TextureDesc::new_2d(Format::Rgba8Unorm, 16, 16, TextureUsage::SAMPLED)
        .with_mip_levels(5)
        .with_data(&data, 5);
    let texture = ctx.create_texture(&desc).unwrap();

    let mut out = vec![0u8; 4 * 4 * 4];
    let range = TextureRangeDesc::new(Dimensions::new_2d(4, 4)).with_mip_levels(2, 1);
    ctx.download_texture(texture.handle(), &range, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 3));
}

#[test]
fn test_texture_argument_errors() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let desc =
        TextureDesc::new_2d(Format::Rgba8Unorm, 8, 8, TextureUsage::SAMPLED).with_mip_levels(5);
    assert_eq!(ctx.create_texture(&desc).unwrap_err().code(), ResultCode::ArgumentOutOfRange);

    let desc = TextureDesc::new_2d(Format::Rgba8Unorm, 8, 8, TextureUsage::SAMPLED)
        .with_storage(StorageType::Memoryless);
    assert_eq!(ctx.create_texture(&desc).unwrap_err().code(), ResultCode::ArgumentInvalid);

    let texture = ctx
        .create_texture(&TextureDesc::new_2d(Format::Rgba8Unorm, 8, 8, TextureUsage::SAMPLED))
        .unwrap();

    // Region past the edge of mip 0
    let range = TextureRangeDesc::new(Dimensions::new_2d(8, 8)).with_offset(4, 0, 0);
    let err = ctx.upload_texture(texture.handle(), &range, &[0; 256]).unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentOutOfRange);

    // Too little data for the region
    let range = TextureRangeDesc::new(Dimensions::new_2d(8, 8));
    let err = ctx.upload_texture(texture.handle(), &range, &[0; 16]).unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentOutOfRange);
}

#[test]
fn test_depth_format_falls_back() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let desc = TextureDesc::new_2d(Format::Z24UnormS8Uint, 32, 32, TextureUsage::ATTACHMENT);
    let depth = ctx.create_texture(&desc).unwrap();
    let format = ctx.format(depth.handle()).unwrap();
    assert!(format.is_depth_or_stencil());
    assert_eq!(ctx.dimensions(depth.handle()), Some(Dimensions::new_2d(32, 32)));
}

fn dispatch(ctx: &mut Context, pipeline: ComputePipelineHandle) {
    let cmd = ctx.acquire_command_buffer().unwrap();
    ctx.cmd_bind_compute_pipeline(&cmd, pipeline).unwrap();
    ctx.cmd_push_constants(&cmd, 0, &[1u32, 2, 3, 4]);
    ctx.cmd_dispatch(&cmd, 1, 1, 1);
    let handle = ctx.submit(cmd, None).unwrap();
    ctx.wait(handle).unwrap();
}

#[test]
fn test_descriptor_growth_keeps_handles_valid() {
    let config = ContextConfig::new().with_initial_bindless_capacity(16, 16);
    let Some(mut ctx) = common::context(config) else { return };

    let spirv = common::noop_compute_spirv();
    let shader_desc =
        ShaderModuleDesc::new(vk::ShaderStageFlags::COMPUTE, &spirv).with_debug_name("noop");
    let shader = ctx.create_shader_module(&shader_desc).unwrap();
    let pipeline = ctx
        .create_compute_pipeline(&ComputePipelineDesc::new(shader.handle()).with_debug_name("noop"))
        .unwrap();
    let sampler = ctx.create_sampler(&SamplerDesc::default()).unwrap();

    dispatch(&mut ctx, pipeline.handle());
    assert_eq!(ctx.num_descriptor_grows(), 0);
    assert_eq!(ctx.bindless_capacity(), (16, 16));

    let desc = TextureDesc::new_2d(
        Format::Rgba8Unorm,
        4,
        4,
        TextureUsage::SAMPLED | TextureUsage::STORAGE,
    );
    let mut textures: Vec<_> = (0..20).map(|_| ctx.create_texture(&desc).unwrap()).collect();
    dispatch(&mut ctx, pipeline.handle());
    assert_eq!(ctx.num_descriptor_grows(), 1);
    assert_eq!(ctx.bindless_capacity(), (32, 16));

    textures.extend((0..20).map(|_| ctx.create_texture(&desc).unwrap()));
    dispatch(&mut ctx, pipeline.handle());
    assert_eq!(ctx.num_descriptor_grows(), 2);
    assert_eq!(ctx.bindless_capacity(), (64, 16));

    for texture in &textures {
        assert_eq!(ctx.dimensions(texture.handle()), Some(Dimensions::new_2d(4, 4)));
        assert_eq!(ctx.bindless_index(texture.handle()), texture.handle().index());
    }
    assert_ne!(ctx.sampler_index(sampler.handle()), 0);

    // Freed slots are reused, so the table does not grow again
    let stale = textures[39].handle();
    textures.truncate(30);
    ctx.process_releases();
    assert_eq!(ctx.bindless_index(stale), 0);
    textures.extend((0..10).map(|_| ctx.create_texture(&desc).unwrap()));
    dispatch(&mut ctx, pipeline.handle());
    assert_eq!(ctx.num_descriptor_grows(), 2);
}

#[test]
fn test_dropped_texture_slot_reused_without_submit() {
    let Some(mut ctx) = common::context(ContextConfig::default()) else { return };

    let pixels = common::pattern(4 * 4 * 4, 2);
    let desc =
        TextureDesc::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED).with_data(&pixels, 1);
    let first = ctx.create_texture(&desc).unwrap().handle();
    let (_, textures_before, _) = ctx.num_objects();

    // Each holder is dropped right away and nothing goes through `submit`
    for _ in 0..8 {
        let texture = ctx.create_texture(&desc).unwrap();
        assert_eq!(texture.handle().index(), first.index());
        assert_ne!(texture.handle(), first);
    }
    ctx.process_releases();

    assert_eq!(ctx.num_objects().1, textures_before - 1);
    assert_eq!(ctx.num_descriptor_grows(), 0);
}

#[test]
fn test_mips_without_data_are_initialized() {
    let Some(mut ctx) = common::validated_context() else { return };

    let pixels = common::pattern(8 * 8 * 4, 4);
    let desc = TextureDesc::new_2d(Format::Rgba8Unorm, 8, 8, TextureUsage::SAMPLED)
        .with_mip_levels(4)
        .with_data(&pixels, 1)
        .with_debug_name("mip 0 only");
    let texture = ctx.create_texture(&desc).unwrap();

    let mut out = vec![0u8; pixels.len()];
    ctx.download_texture(
        texture.handle(),
        &TextureRangeDesc::new(Dimensions::new_2d(8, 8)),
        &mut out,
    )
        .unwrap();
    assert_eq!(out, pixels);

    // Contents are undefined, but the layout the barrier leaves from must match
    let mut mip = vec![0u8; 2 * 2 * 4];
    let range = TextureRangeDesc::new(Dimensions::new_2d(2, 2)).with_mip_levels(2, 1);
    ctx.download_texture(texture.handle(), &range, &mut mip).unwrap();
    ctx.wait_all().unwrap();
}
