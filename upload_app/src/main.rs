//! Upload demo application
//!
//! Headless walk through the engine: streams buffers and a mipmapped texture
//! through the staging ring, reads them back, times a copy with timestamp
//! queries and saves the pipeline cache for the next run.
//!
//! Usage: `upload_demo [config.toml|config.ron]`

use std::path::PathBuf;

use bytemuck::{Pod, Zeroable};
use gpu_engine::config::{Config, ConfigError};
use gpu_engine::prelude::*;
use gpu_engine::render::api::TextureTag;
use gpu_engine::Holder;
use thiserror::Error;

const CACHE_PATH: &str = "upload_demo.pipeline_cache";

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Gpu(#[from] VulkanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Readback mismatch: {0}")]
    Mismatch(String),
}

struct UploadApp {
    ctx: Context,
}

impl UploadApp {
    fn new(config_path: Option<PathBuf>) -> Result<Self, DemoError> {
        let mut config = match config_path {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                ContextConfig::load_from_file(path)?
            }
            None => ContextConfig::new().with_application_name("upload_demo"),
        };
        if let Ok(blob) = std::fs::read(CACHE_PATH) {
            log::info!("Seeding pipeline cache with {} bytes", blob.len());
            config = config.with_pipeline_cache_data(blob);
        }

        let ctx = Context::new(config)?;
        log::info!("Running on {}", ctx.device_name());
        Ok(Self { ctx })
    }

    fn upload_vertices(&mut self) -> Result<(), DemoError> {
        let vertices = [
            Vertex { position: [-1.0, -1.0, 0.0], uv: [0.0, 0.0] },
            Vertex { position: [1.0, -1.0, 0.0], uv: [1.0, 0.0] },
            Vertex { position: [0.0, 1.0, 0.0], uv: [0.5, 1.0] },
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let desc = BufferDesc::new(BufferUsage::VERTEX, StorageType::HostVisible, bytes.len())
            .with_data(bytes)
            .with_debug_name("triangle");
        let buffer = self.ctx.create_buffer(&desc)?;

        let mapped = self
            .ctx
            .mapped_slice(buffer.handle())
            .ok_or_else(|| DemoError::Mismatch("vertex buffer is not mapped".to_string()))?;
        let readback: &[Vertex] = bytemuck::cast_slice(mapped);
        if readback != vertices {
            return Err(DemoError::Mismatch("vertex data".to_string()));
        }
        log::info!("Uploaded {} vertices through a mapped buffer", vertices.len());
        Ok(())
    }

    fn stream_large_buffer(&mut self) -> Result<(), DemoError> {
        let size = self.ctx.staging_ring().size() as usize * 3 + 123;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::Device, size)
            .with_debug_name("stream");
        let buffer = self.ctx.create_buffer(&desc)?;
        self.ctx.upload_buffer(buffer.handle(), &data, 0)?;

        let readback_desc = BufferDesc::new(BufferUsage::STORAGE, StorageType::HostVisible, size)
            .with_debug_name("stream readback");
        let readback = self.ctx.create_buffer(&readback_desc)?;
        let queries = self.ctx.create_query_pool(2, "copy timing").ok();

        let cmd = self.ctx.acquire_command_buffer()?;
        if let Some(pool) = &queries {
            self.ctx.cmd_reset_query_pool(&cmd, pool.handle(), 0, 2);
            self.ctx.cmd_write_timestamp(&cmd, pool.handle(), 0);
        }
        self.ctx
            .cmd_copy_buffer(&cmd, buffer.handle(), 0, readback.handle(), 0, size as u64);
        self.ctx.cmd_buffer_barrier(
            &cmd,
            readback.handle(),
            ash::vk::PipelineStageFlags::TRANSFER,
            ash::vk::PipelineStageFlags::HOST,
        );
        if let Some(pool) = &queries {
            self.ctx.cmd_write_timestamp(&cmd, pool.handle(), 1);
        }
        let handle = self.ctx.submit(cmd, None)?;
        self.ctx.wait(handle)?;

        self.ctx.invalidate_mapped_memory(readback.handle(), 0, size)?;
        if self.ctx.mapped_slice(readback.handle()) != Some(data.as_slice()) {
            return Err(DemoError::Mismatch("streamed buffer".to_string()));
        }

        match queries {
            Some(pool) => {
                let ticks = self.ctx.query_pool_results(pool.handle(), 0, 2)?;
                let elapsed = ticks[1].saturating_sub(ticks[0]) as f64;
                let micros = elapsed * f64::from(self.ctx.timestamp_period()) / 1000.0;
                log::info!(
                    "Streamed {} KiB in {} chunks, copy took {:.1} us",
                    size / 1024,
                    size.div_ceil(self.ctx.staging_ring().size() as usize),
                    micros
                );
            }
            None => log::info!("Streamed {} KiB (timestamps unsupported)", size / 1024),
        }
        Ok(())
    }

    fn upload_texture(&mut self) -> Result<Holder<TextureTag>, DemoError> {
        const SIDE: u32 = 64;
        let pixels: Vec<u8> = (0..SIDE * SIDE)
            .flat_map(|i| {
                let (x, y) = (i % SIDE, i / SIDE);
                let checker = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 32 };
                [checker, (x * 4) as u8, (y * 4) as u8, 255]
            })
            .collect();

        let desc = TextureDesc::new_2d(Format::Rgba8Unorm, SIDE, SIDE, TextureUsage::SAMPLED)
            .with_mip_levels(7)
            .with_data(&pixels, 1)
            .with_generated_mipmaps()
            .with_debug_name("checkerboard");
        let texture = match self.ctx.create_texture(&desc) {
            Err(VulkanError::Unsupported(reason)) => {
                log::warn!("{reason}; uploading without mips");
                let desc =
                    TextureDesc::new_2d(Format::Rgba8Unorm, SIDE, SIDE, TextureUsage::SAMPLED)
                        .with_data(&pixels, 1)
                        .with_debug_name("checkerboard");
                self.ctx.create_texture(&desc)?
            }
            other => other?,
        };

        let mut out = vec![0u8; pixels.len()];
        let range = TextureRangeDesc::new(Dimensions::new_2d(SIDE, SIDE));
        self.ctx.download_texture(texture.handle(), &range, &mut out)?;
        if out != pixels {
            return Err(DemoError::Mismatch("texture mip 0".to_string()));
        }
        log::info!(
            "Texture {:?} at bindless index {}",
            self.ctx.dimensions(texture.handle()),
            self.ctx.bindless_index(texture.handle())
        );
        Ok(texture)
    }

    fn run(&mut self) -> Result<(), DemoError> {
        self.upload_vertices()?;
        self.stream_large_buffer()?;
        let texture = self.upload_texture()?;

        // Dropped mid-frame; destroyed once the frame retires
        let cmd = self.ctx.acquire_command_buffer()?;
        drop(texture);
        let handle = self.ctx.submit(cmd, None)?;
        log::info!("{} deferred tasks pending after submit", self.ctx.num_deferred_tasks());
        self.ctx.wait(handle)?;

        let blob = self.ctx.pipeline_cache_data()?;
        if let Err(e) = std::fs::write(CACHE_PATH, &blob) {
            log::warn!("Could not save pipeline cache: {e}");
        }
        self.ctx.wait_all()?;
        Ok(())
    }
}

fn main() {
    gpu_engine::foundation::logging::init();
    log::info!("Starting upload demo");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let result = UploadApp::new(config_path).and_then(|mut app| app.run());

    match result {
        Ok(()) => log::info!("Upload demo finished"),
        Err(e) => {
            log::error!("Upload demo failed: {e}");
            std::process::exit(1);
        }
    }
}
