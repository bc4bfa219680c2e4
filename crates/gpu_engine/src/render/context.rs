//! GPU context
//!
//! [`Context`] owns the device and every resource created through it. Resources
//! live in generation-indexed pools and are handed out as [`Holder`]s. Native
//! objects are never freed while the GPU may still use them: destruction is
//! queued on the deferred task queue, tagged with the submission that last
//! could have referenced the object.
//!
//! Textures and samplers are exposed to shaders through one bindless
//! descriptor table indexed by pool slot. The table is rewritten lazily when
//! a pipeline is bound after textures or samplers changed, and it doubles in
//! size when the pools outgrow it.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;
use bytemuck::Pod;

use crate::config::ConfigError;
use crate::core::config::MAX_STAGING_BUFFER_SIZE;
use crate::core::ContextConfig;
use crate::foundation::{Handle, Pool};
use crate::render::api::descriptors::sample_count_flags;
use crate::render::api::handles::{
    BufferTag, ComputePipelineTag, QueryPoolTag, RenderPipelineTag, ResourceTag, SamplerTag,
    ShaderModuleTag, TextureTag,
};
use crate::render::api::{
    closest_depth_stencil_format, BufferDesc, BufferHandle, BufferUsage, ComputePipelineDesc,
    ComputePipelineHandle, Dimensions, Format, QueryPoolHandle, ReleasedHandle, RenderPipelineDesc,
    RenderPipelineHandle, SamplerDesc, SamplerHandle, ShaderModuleDesc, ShaderModuleHandle,
    StorageType, TextureDesc, TextureHandle, TextureRangeDesc, TextureType, TextureUsage,
};
use crate::render::backends::vulkan::initialization::{
    LogicalDevice, PhysicalDeviceInfo, VulkanInstance,
};
use crate::render::backends::vulkan::resources::pipeline;
use crate::render::backends::vulkan::resources::staging::src_stage_for;
use crate::render::backends::vulkan::resources::{
    calc_num_mip_levels, validate_image_limits, validate_range, BindlessDescriptors,
    ComputePipelineState, ImageCreateInfo, PipelineCache, QueryPool, RenderPipelineState,
    ShaderModule, StagingDevice, StagingRing, VulkanBuffer, VulkanImage, VulkanSampler,
    VulkanTexture, PUSH_CONSTANTS_SIZE, STAGING_ALIGNMENT,
};
use crate::render::backends::vulkan::state::{
    DeferredTaskQueue, ImmediateCommands, SubmissionTimeline, SubmitHandle,
};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::command_buffer::{ColorTarget, CommandBuffer, DepthTarget};
use crate::render::holder::{Holder, ReleaseQueue};

/// Hands finished frames to the window system
///
/// Installed with [`Context::set_presenter`] by hosts that own a swapchain.
pub trait Presenter {
    /// Queue a present that waits on `wait_semaphore`
    fn present(&mut self, queue: vk::Queue, wait_semaphore: vk::Semaphore) -> VulkanResult<()>;
}

/// The GPU context
///
/// Fields drop in declaration order, which is the teardown order.
pub struct Context {
    release_queue: ReleaseQueue,
    presenter: Option<Box<dyn Presenter>>,

    buffers: Pool<BufferTag, VulkanBuffer>,
    textures: Pool<TextureTag, VulkanTexture>,
    samplers: Pool<SamplerTag, VulkanSampler>,
    shader_modules: Pool<ShaderModuleTag, ShaderModule>,
    compute_pipelines: Pool<ComputePipelineTag, ComputePipelineState>,
    render_pipelines: Pool<RenderPipelineTag, RenderPipelineState>,
    query_pools: Pool<QueryPoolTag, QueryPool>,
    dummy_texture: TextureHandle,
    dummy_sampler: SamplerHandle,

    deferred: DeferredTaskQueue,
    outstanding: Option<SubmitHandle>,
    staging: StagingDevice,
    immediate: ImmediateCommands,
    bindless: BindlessDescriptors,
    pipeline_cache: PipelineCache,

    depth_formats: Vec<Format>,
    config: ContextConfig,
    physical_device: PhysicalDeviceInfo,
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl Context {
    /// Create the instance, pick a GPU and build the engine around it
    pub fn new(mut config: ContextConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|reason| VulkanError::Config(ConfigError::Invalid(reason)))?;

        let instance = VulkanInstance::new(&config)?;
        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(
                &instance.instance,
                config.prefer_discrete_gpu,
            )?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;
        let immediate =
            ImmediateCommands::new(device.device.clone(), device.queue, device.queue_family)?;

        let limits = *physical_device.limits();
        let staging_size =
            staging_ring_size(config.staging_buffer_size, limits.max_storage_buffer_range);
        let staging = StagingDevice::new(
            device.device.clone(),
            &physical_device.memory_properties,
            &limits,
            staging_size,
        )?;

        let cache_data = std::mem::take(&mut config.pipeline_cache_data);
        let pipeline_cache = PipelineCache::new(
            device.device.clone(),
            (!cache_data.is_empty()).then_some(cache_data.as_slice()),
        )?;

        let bindless = BindlessDescriptors::new(
            device.device.clone(),
            physical_device.update_after_bind_limits,
            limits.max_push_constants_size,
            config.initial_max_textures,
            config.initial_max_samplers,
        )?;

        let depth_formats = Format::ALL
            .iter()
            .copied()
            .filter(|format| {
                format.is_depth_or_stencil()
                    && physical_device.supports_format(
                        &instance.instance,
                        format.to_vk(),
                        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    )
            })
            .collect();

        let mut context = Self {
            release_queue: Rc::new(RefCell::new(Vec::new())),
            presenter: None,
            buffers: Pool::new(),
            textures: Pool::new(),
            samplers: Pool::new(),
            shader_modules: Pool::new(),
            compute_pipelines: Pool::new(),
            render_pipelines: Pool::new(),
            query_pools: Pool::new(),
            dummy_texture: Handle::empty(),
            dummy_sampler: Handle::empty(),
            deferred: DeferredTaskQueue::new(),
            outstanding: None,
            staging,
            immediate,
            bindless,
            pipeline_cache,
            depth_formats,
            config,
            physical_device,
            device,
            instance,
        };
        context.create_guards()?;

        log::info!(
            "Context ready on {} (staging {} KiB, bindless {}/{})",
            context.physical_device.name,
            staging_size / 1024,
            context.bindless.max_textures(),
            context.bindless.max_samplers()
        );
        Ok(context)
    }

    // Slot 0 of the texture and sampler pools; stands in for empty bindless entries
    fn create_guards(&mut self) -> VulkanResult<()> {
        const BLACK: [u8; 4] = [0, 0, 0, 255];
        let desc = TextureDesc::new_2d(
            Format::Rgba8Unorm,
            1,
            1,
            TextureUsage::SAMPLED | TextureUsage::STORAGE,
        )
            .with_data(&BLACK, 1)
            .with_debug_name("Dummy texture");
        self.dummy_texture = self.create_texture_handle(&desc)?;

        let desc = SamplerDesc {
            debug_name: "Dummy sampler",
            ..SamplerDesc::default()
        };
        self.dummy_sampler = self.create_sampler_handle(&desc)?;

        debug_assert_eq!(self.dummy_texture.index(), 0);
        debug_assert_eq!(self.dummy_sampler.index(), 0);
        Ok(())
    }

    fn hold<T: ResourceTag>(&self, handle: Handle<T>) -> Holder<T> {
        Holder::new(handle, &self.release_queue)
    }

    // Submission a resource destroyed now may still be used by
    fn in_flight_handle(&self) -> SubmitHandle {
        self.outstanding
            .unwrap_or_else(|| self.immediate.last_submit_handle())
    }

    fn defer_drop<T: 'static>(&mut self, object: T) {
        let handle = self.in_flight_handle();
        self.deferred.push(move || drop(object), handle);
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Begin recording a command buffer
    ///
    /// # Panics
    ///
    /// Only one command buffer may be acquired at a time.
    pub fn acquire_command_buffer(&mut self) -> VulkanResult<CommandBuffer> {
        assert!(
            self.outstanding.is_none(),
            "Cannot acquire more than one command buffer simultaneously"
        );
        let acquired = self.immediate.acquire()?;
        self.outstanding = Some(acquired.handle());
        Ok(CommandBuffer::new(acquired))
    }

    /// Submit `cmd`, optionally presenting the swapchain texture `present`
    ///
    /// # Panics
    ///
    /// `cmd` must be the outstanding command buffer and `present` must be a
    /// registered swapchain image.
    pub fn submit(
        &mut self,
        cmd: CommandBuffer,
        present: Option<TextureHandle>,
    ) -> VulkanResult<SubmitHandle> {
        assert_eq!(
            self.outstanding,
            Some(cmd.handle()),
            "Submitting a command buffer that is not the outstanding one"
        );

        if let Some(target) = present {
            let image = live_mut(&mut self.textures, target).image_mut();
            assert!(image.is_swapchain_image(), "Only swapchain images can be presented");
            let src_stage = if image.layout() == vk::ImageLayout::GENERAL {
                vk::PipelineStageFlags::COMPUTE_SHADER
            } else {
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            };
            let range = image.full_range();
            image.transition_layout(
                cmd.raw(),
                vk::ImageLayout::PRESENT_SRC_KHR,
                src_stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                range,
            );
        }

        self.outstanding = None;
        let handle = self.immediate.submit(cmd.into_inner())?;
        self.bindless.on_submit(handle);

        if present.is_some() {
            if let Some(presenter) = self.presenter.as_mut() {
                let semaphore = self.immediate.acquire_last_submit_semaphore();
                presenter.present(self.immediate.queue(), semaphore)?;
            }
        }

        self.deferred.process(&self.immediate);
        self.process_releases();
        Ok(handle)
    }

    /// Block until `handle` retires; the empty handle waits for the whole device
    pub fn wait(&mut self, handle: SubmitHandle) -> VulkanResult<()> {
        if handle.is_empty() {
            unsafe {
                self.device.device.device_wait_idle()
                    .map_err(VulkanError::Api)?;
            }
            self.immediate.purge()?;
        } else {
            self.immediate.wait(handle)?;
        }
        self.process_releases();
        self.deferred.process(&self.immediate);
        Ok(())
    }

    /// Block until every submission retires, then run what became runnable
    pub fn wait_all(&mut self) -> VulkanResult<()> {
        self.immediate.wait_all()?;
        self.process_releases();
        self.deferred.process(&self.immediate);
        Ok(())
    }

    /// Make the next submission wait on `semaphore`, e.g. a swapchain acquire
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.immediate.wait_semaphore(semaphore);
    }

    /// Install the presenter used by [`Context::submit`]
    pub fn set_presenter(&mut self, presenter: Box<dyn Presenter>) {
        self.presenter = Some(presenter);
    }

    /// Wrap an image owned by a swapchain so it can be rendered to and presented
    pub fn register_swapchain_image(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        debug_name: &str,
    ) -> VulkanResult<Holder<TextureTag>> {
        self.process_releases();
        if let Some(existing) = self.textures.find(|texture| texture.image().handle() == image) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Swapchain image {image:?} is already registered as {existing:?}"),
            });
        }
        let raw = image;
        let image =
            VulkanImage::from_swapchain(self.device.device.clone(), image, format, extent, usage);
        let view = image.create_image_view(
            vk::ImageViewType::TYPE_2D,
            image.copy_aspect_flags(),
            0,
            1,
            0,
            1,
        )?;
        self.instance.set_debug_name(&self.device.device, view, debug_name);

        let handle = self.textures.create(VulkanTexture::new(image, view));
        self.bindless.mark_dirty();
        log::debug!("Registered swapchain image {:?} as {:?}", raw, handle);
        Ok(self.hold(handle))
    }

    /// Run `task` once `handle` retires; the empty handle means the latest submission
    pub fn deferred_task(&mut self, task: impl FnOnce() + 'static, handle: SubmitHandle) {
        let handle = if handle.is_empty() { self.in_flight_handle() } else { handle };
        self.deferred.push(task, handle);
    }

    /// Destroy every resource whose last [`Holder`] was dropped
    pub fn process_releases(&mut self) {
        let released = std::mem::take(&mut *self.release_queue.borrow_mut());
        for handle in released {
            match handle {
                ReleasedHandle::Buffer(h) => self.destroy_buffer(h),
                ReleasedHandle::Texture(h) => self.destroy_texture(h),
                ReleasedHandle::Sampler(h) => self.destroy_sampler(h),
                ReleasedHandle::ShaderModule(h) => self.destroy_shader_module(h),
                ReleasedHandle::ComputePipeline(h) => self.destroy_compute_pipeline(h),
                ReleasedHandle::RenderPipeline(h) => self.destroy_render_pipeline(h),
                ReleasedHandle::QueryPool(h) => self.destroy_query_pool(h),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    /// Create a buffer, uploading `desc.data` when present
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> VulkanResult<Holder<BufferTag>> {
        self.process_releases();
        if desc.usage.is_empty() {
            return Err(VulkanError::ArgumentOutOfRange("Invalid buffer usage".to_string()));
        }
        if desc.size == 0 {
            return Err(VulkanError::ArgumentOutOfRange("Buffer size must be non-zero".to_string()));
        }

        let limits = self.physical_device.limits();
        if desc.usage.contains(BufferUsage::UNIFORM)
            && desc.size > limits.max_uniform_buffer_range as usize
        {
            return Err(VulkanError::RuntimeError(format!(
                "Uniform buffer of {} bytes exceeds maxUniformBufferRange ({})",
                desc.size, limits.max_uniform_buffer_range
            )));
        }
        if desc.usage.contains(BufferUsage::STORAGE)
            && desc.size > limits.max_storage_buffer_range as usize
        {
            return Err(VulkanError::RuntimeError(format!(
                "Storage buffer of {} bytes exceeds maxStorageBufferRange ({})",
                desc.size, limits.max_storage_buffer_range
            )));
        }

        let buffer = VulkanBuffer::new(
            self.device.device.clone(),
            &self.physical_device.memory_properties,
            limits,
            desc.size as vk::DeviceSize,
            buffer_usage_flags(desc.usage),
            desc.storage.memory_flags(),
        )?;
        self.instance.set_debug_name(&self.device.device, buffer.handle(), desc.debug_name);
        log::debug!("Created buffer '{}' ({} bytes, {:?})", desc.debug_name, desc.size, desc.usage);

        let handle = self.buffers.create(buffer);
        if let Some(data) = desc.data {
            if let Err(e) = self.upload_buffer(handle, data, 0) {
                self.destroy_buffer(handle);
                return Err(e);
            }
        }
        Ok(self.hold(handle))
    }

    /// Create a texture, uploading `desc.data` and building mips as requested
    pub fn create_texture(&mut self, desc: &TextureDesc<'_>) -> VulkanResult<Holder<TextureTag>> {
        self.process_releases();
        let handle = self.create_texture_handle(desc)?;
        Ok(self.hold(handle))
    }

    fn create_texture_handle(&mut self, desc: &TextureDesc<'_>) -> VulkanResult<TextureHandle> {
        let format = if desc.format.is_depth_or_stencil() {
            closest_depth_stencil_format(desc.format, &self.depth_formats).ok_or_else(|| {
                VulkanError::Unsupported(format!(
                    "No depth format close to {:?} is supported",
                    desc.format
                ))
            })?
        } else {
            desc.format
        };
        if format != desc.format {
            log::debug!("Depth format {:?} replaced by {:?}", desc.format, format);
        }

        let dims = desc.dimensions;
        if dims.width == 0 || dims.height == 0 || dims.depth == 0 {
            return Err(VulkanError::ArgumentOutOfRange(
                "Texture dimensions must be non-zero".to_string(),
            ));
        }
        if desc.num_layers == 0 {
            return Err(VulkanError::ArgumentOutOfRange(
                "Texture needs at least one layer".to_string(),
            ));
        }
        if desc.texture_type == TextureType::Tex3D && desc.num_layers != 1 {
            return Err(VulkanError::ArgumentOutOfRange(
                "3D textures cannot have layers".to_string(),
            ));
        }
        if desc.num_mip_levels == 0 {
            return Err(VulkanError::ArgumentOutOfRange(
                "The number of mip levels must be greater than 0".to_string(),
            ));
        }
        if desc.num_samples > 1 && desc.num_mip_levels != 1 {
            return Err(VulkanError::ArgumentOutOfRange(
                "The number of mip levels for multisampled images must be 1".to_string(),
            ));
        }
        if desc.num_samples > 1 && desc.usage.contains(TextureUsage::STORAGE) {
            return Err(VulkanError::ArgumentOutOfRange(
                "Storage images cannot be multisampled".to_string(),
            ));
        }
        if desc.num_mip_levels > calc_num_mip_levels(dims.width, dims.height) {
            return Err(VulkanError::ArgumentOutOfRange(
                "The number of mip levels is greater than the maximum possible".to_string(),
            ));
        }
        if desc.storage == StorageType::Memoryless {
            if !desc.usage.contains(TextureUsage::ATTACHMENT) {
                return Err(VulkanError::ArgumentInvalid(
                    "Memoryless textures must be attachments".to_string(),
                ));
            }
            if desc.data.is_some() || desc.generate_mipmaps {
                return Err(VulkanError::ArgumentInvalid(
                    "Memoryless textures cannot hold data".to_string(),
                ));
            }
        }

        let usage = if desc.usage.is_empty() {
            log::warn!("Texture '{}' has no usage flags, assuming SAMPLED", desc.debug_name);
            TextureUsage::SAMPLED
        } else {
            desc.usage
        };

        let samples = sample_count_flags(desc.num_samples);
        validate_image_limits(desc.texture_type, samples, dims, self.physical_device.limits())?;

        let (image_type, view_type, num_layers, flags) = match desc.texture_type {
            TextureType::Tex2D => (
                vk::ImageType::TYPE_2D,
                if desc.num_layers > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                },
                desc.num_layers,
                vk::ImageCreateFlags::empty(),
            ),
            TextureType::Tex3D => (
                vk::ImageType::TYPE_3D,
                vk::ImageViewType::TYPE_3D,
                1,
                vk::ImageCreateFlags::empty(),
            ),
            TextureType::Cube => (
                vk::ImageType::TYPE_2D,
                if desc.num_layers > 1 {
                    vk::ImageViewType::CUBE_ARRAY
                } else {
                    vk::ImageViewType::CUBE
                },
                desc.num_layers * 6,
                vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ),
        };

        let info = ImageCreateInfo {
            image_type,
            format: format.to_vk(),
            extent: dims.to_extent(),
            num_levels: desc.num_mip_levels,
            num_layers,
            samples,
            usage: image_usage_flags(usage, format, desc.storage),
            flags,
            memory_flags: desc.storage.memory_flags(),
        };

        let image = VulkanImage::new(
            self.device.device.clone(),
            &self.physical_device.memory_properties,
            &info,
        )?;
        self.instance.set_debug_name(&self.device.device, image.handle(), desc.debug_name);
        let view = image.create_image_view(
            view_type,
            image.copy_aspect_flags(),
            0,
            desc.num_mip_levels,
            0,
            num_layers,
        )?;
        self.instance.set_debug_name(&self.device.device, view, desc.debug_name);
        log::debug!(
            "Created texture '{}' {:?} {}x{}x{} {:?}",
            desc.debug_name,
            desc.texture_type,
            dims.width,
            dims.height,
            dims.depth,
            format
        );

        let handle = self.textures.create(VulkanTexture::new(image, view));
        self.bindless.mark_dirty();

        if let Err(e) = self.initialize_texture(handle, desc, num_layers) {
            self.destroy_texture(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn initialize_texture(
        &mut self,
        handle: TextureHandle,
        desc: &TextureDesc<'_>,
        num_layers: u32,
    ) -> VulkanResult<()> {
        // Every mip and layer starts in the layout the descriptors claim, uploaded or not
        let image = live_mut(&mut self.textures, handle).image_mut();
        if image.layout() == vk::ImageLayout::UNDEFINED
            && (image.is_sampled() || image.is_storage())
        {
            let cmd = self.immediate.acquire()?;
            image.initialize_layout(cmd.raw());
            self.immediate.submit(cmd)?;
        }

        if let Some(data) = desc.data {
            let range = match desc.texture_type {
                TextureType::Tex3D => TextureRangeDesc::new(desc.dimensions),
                TextureType::Tex2D | TextureType::Cube => TextureRangeDesc::new(desc.dimensions)
                    .with_layers(0, num_layers)
                    .with_mip_levels(0, desc.data_num_mip_levels),
            };
            self.upload_texture(handle, &range, data)?;
        }

        let num_levels = live(&self.textures, handle).image().num_levels();
        if desc.generate_mipmaps && num_levels > 1 {
            self.generate_mipmap(handle)?;
        }

        Ok(())
    }

    /// Create a sampler
    pub fn create_sampler(&mut self, desc: &SamplerDesc<'_>) -> VulkanResult<Holder<SamplerTag>> {
        self.process_releases();
        let handle = self.create_sampler_handle(desc)?;
        Ok(self.hold(handle))
    }

    fn create_sampler_handle(&mut self, desc: &SamplerDesc<'_>) -> VulkanResult<SamplerHandle> {
        let anisotropy_limit = self
            .physical_device
            .supports_anisotropy
            .then_some(self.physical_device.limits().max_sampler_anisotropy);
        let sampler = VulkanSampler::new(self.device.device.clone(), desc, anisotropy_limit)?;
        self.instance.set_debug_name(&self.device.device, sampler.handle(), desc.debug_name);

        let handle = self.samplers.create(sampler);
        self.bindless.mark_dirty();
        Ok(handle)
    }

    /// Create a shader module from SPIR-V
    pub fn create_shader_module(
        &mut self,
        desc: &ShaderModuleDesc<'_>,
    ) -> VulkanResult<Holder<ShaderModuleTag>> {
        self.process_releases();
        let module = ShaderModule::from_bytes(self.device.device.clone(), desc.stage, desc.spirv)?;
        self.instance.set_debug_name(&self.device.device, module.handle(), desc.debug_name);
        log::debug!("[SHADER] Created {:?} module '{}'", desc.stage, desc.debug_name);

        let handle = self.shader_modules.create(module);
        Ok(self.hold(handle))
    }

    /// Create and build a compute pipeline
    pub fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc,
    ) -> VulkanResult<Holder<ComputePipelineTag>> {
        self.process_releases();
        let shader = self
            .shader_modules
            .get(desc.shader)
            .ok_or_else(|| {
                VulkanError::ArgumentNull("Compute pipeline needs a shader module".to_string())
            })?;

        let built = pipeline::create_compute_pipeline(
            &self.device.device,
            self.pipeline_cache.handle(),
            self.bindless.pipeline_layout(),
            shader,
            desc,
        )?;
        self.instance.set_debug_name(&self.device.device, built.handle(), &desc.debug_name);

        let handle = self.compute_pipelines.create(ComputePipelineState {
            desc: desc.clone(),
            pipeline: Some(built),
        });
        Ok(self.hold(handle))
    }

    /// Create and build a render pipeline
    pub fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc,
    ) -> VulkanResult<Holder<RenderPipelineTag>> {
        self.process_releases();
        let vertex_shader = self
            .shader_modules
            .get(desc.vertex_shader)
            .ok_or_else(|| VulkanError::ArgumentNull("Missing vertex shader".to_string()))?;
        let fragment_shader = self
            .shader_modules
            .get(desc.fragment_shader)
            .ok_or_else(|| VulkanError::ArgumentNull("Missing fragment shader".to_string()))?;

        let built = pipeline::create_render_pipeline(
            &self.device.device,
            self.pipeline_cache.handle(),
            self.bindless.pipeline_layout(),
            vertex_shader,
            fragment_shader,
            desc,
        )?;
        self.instance.set_debug_name(&self.device.device, built.handle(), &desc.debug_name);

        let handle = self.render_pipelines.create(RenderPipelineState {
            desc: desc.clone(),
            pipeline: Some(built),
        });
        Ok(self.hold(handle))
    }

    /// Create a pool of `count` timestamp queries
    pub fn create_query_pool(
        &mut self,
        count: u32,
        debug_name: &str,
    ) -> VulkanResult<Holder<QueryPoolTag>> {
        self.process_releases();
        if self.physical_device.timestamp_valid_bits == 0 {
            return Err(VulkanError::Unsupported(
                "The queue does not support timestamps".to_string(),
            ));
        }
        let pool = QueryPool::new(self.device.device.clone(), count)?;
        self.instance.set_debug_name(&self.device.device, pool.handle(), debug_name);

        let handle = self.query_pools.create(pool);
        Ok(self.hold(handle))
    }

    // ---------------------------------------------------------------------
    // Destruction
    // ---------------------------------------------------------------------

    /// Destroy a buffer once the GPU is done with it
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.destroy(handle) {
            self.defer_drop(buffer);
        }
    }

    /// Destroy a texture once the GPU is done with it
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        if handle == self.dummy_texture {
            log::warn!("The dummy texture is owned by the context");
            return;
        }
        if let Some(texture) = self.textures.destroy(handle) {
            self.defer_drop(texture);
            self.bindless.mark_dirty();
        }
    }

    /// Destroy a sampler once the GPU is done with it
    pub fn destroy_sampler(&mut self, handle: SamplerHandle) {
        if handle == self.dummy_sampler {
            log::warn!("The dummy sampler is owned by the context");
            return;
        }
        if let Some(sampler) = self.samplers.destroy(handle) {
            self.defer_drop(sampler);
            self.bindless.mark_dirty();
        }
    }

    /// Destroy a shader module right away; built pipelines do not need it
    pub fn destroy_shader_module(&mut self, handle: ShaderModuleHandle) {
        if let Some(module) = self.shader_modules.destroy(handle) {
            log::debug!("[SHADER] Destroying module {:?}", module.handle());
        }
    }

    /// Destroy a compute pipeline once the GPU is done with it
    pub fn destroy_compute_pipeline(&mut self, handle: ComputePipelineHandle) {
        if let Some(state) = self.compute_pipelines.destroy(handle) {
            self.defer_drop(state.pipeline);
        }
    }

    /// Destroy a render pipeline once the GPU is done with it
    pub fn destroy_render_pipeline(&mut self, handle: RenderPipelineHandle) {
        if let Some(state) = self.render_pipelines.destroy(handle) {
            self.defer_drop(state.pipeline);
        }
    }

    /// Destroy a query pool once the GPU is done with it
    pub fn destroy_query_pool(&mut self, handle: QueryPoolHandle) {
        if let Some(pool) = self.query_pools.destroy(handle) {
            self.defer_drop(pool);
        }
    }

    // ---------------------------------------------------------------------
    // Data transfer
    // ---------------------------------------------------------------------

    /// Copy `data` into a buffer at `offset`
    ///
    /// Fails without writing anything when the range does not fit.
    pub fn upload_buffer(
        &mut self,
        handle: BufferHandle,
        data: &[u8],
        offset: usize,
    ) -> VulkanResult<()> {
        let buffer = live(&self.buffers, handle);
        let fits = offset
            .checked_add(data.len())
            .map_or(false, |end| end as vk::DeviceSize <= buffer.size());
        if !fits {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Upload of {} bytes at offset {offset} overflows a buffer of {} bytes",
                data.len(),
                buffer.size()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        self.staging
            .buffer_sub_data(&mut self.immediate, buffer, offset as vk::DeviceSize, data)
    }

    /// Copy `data` into the texels addressed by `range`
    ///
    /// `data` holds the mip levels in order, each with its layers back to back.
    pub fn upload_texture(
        &mut self,
        handle: TextureHandle,
        range: &TextureRangeDesc,
        data: &[u8],
    ) -> VulkanResult<()> {
        let image = live_mut(&mut self.textures, handle).image_mut();
        validate_range(image.dimensions(), image.num_levels(), image.num_layers(), range)?;
        if !image.usage().contains(vk::ImageUsageFlags::TRANSFER_DST) {
            return Err(VulkanError::InvalidOperation {
                reason: "Texture cannot be a transfer destination".to_string(),
            });
        }
        let format = native_format(image)?;

        if image.image_type() == vk::ImageType::TYPE_3D {
            if range.mip_level != 0 || range.num_mip_levels != 1 {
                return Err(VulkanError::Unsupported(
                    "3D uploads write mip level 0 only".to_string(),
                ));
            }
            self.staging.image_data_3d(
                &mut self.immediate,
                image,
                range.offset,
                range.dimensions.to_extent(),
                format,
                data,
            )
        } else {
            let region = vk::Rect2D {
                offset: vk::Offset2D {
                    x: range.offset.x,
                    y: range.offset.y,
                },
                extent: vk::Extent2D {
                    width: range.dimensions.width,
                    height: range.dimensions.height,
                },
            };
            self.staging.image_data_2d(
                &mut self.immediate,
                image,
                region,
                range.mip_level,
                range.num_mip_levels,
                range.layer,
                range.num_layers,
                format,
                data,
            )
        }
    }

    /// Read the texels addressed by `range` into `out`; blocks until the copy finishes
    ///
    /// The range must cover one mip level of one layer.
    pub fn download_texture(
        &mut self,
        handle: TextureHandle,
        range: &TextureRangeDesc,
        out: &mut [u8],
    ) -> VulkanResult<()> {
        let image = live_mut(&mut self.textures, handle).image_mut();
        validate_range(image.dimensions(), image.num_levels(), image.num_layers(), range)?;
        if range.num_layers != 1 || range.num_mip_levels != 1 {
            return Err(VulkanError::ArgumentOutOfRange(
                "Downloads read one mip level of one layer".to_string(),
            ));
        }
        if !image.usage().contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            return Err(VulkanError::InvalidOperation {
                reason: "Texture cannot be a transfer source".to_string(),
            });
        }
        let format = native_format(image)?;

        self.staging.image_data_download(
            &mut self.immediate,
            image,
            range.offset,
            range.dimensions.to_extent(),
            range.mip_level,
            range.layer,
            format,
            out,
        )
    }

    /// Rebuild mips 1.. of every layer from mip 0
    pub fn generate_mipmap(&mut self, handle: TextureHandle) -> VulkanResult<()> {
        let image = live(&self.textures, handle).image();
        if image.num_levels() <= 1 {
            return Ok(());
        }

        let mut features = vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST;
        if !image.is_depth_or_stencil() {
            features |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        }
        if !self
            .physical_device
            .supports_format(&self.instance.instance, image.format(), features)
        {
            return Err(VulkanError::Unsupported(format!(
                "Format {:?} cannot be blitted for mip generation",
                image.format()
            )));
        }

        let cmd = self.immediate.acquire()?;
        live_mut(&mut self.textures, handle).image_mut().generate_mipmap(cmd.raw());
        self.immediate.submit(cmd)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Persistent mapping of a host-visible buffer
    pub fn mapped_slice(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(handle).and_then(VulkanBuffer::mapped_slice)
    }

    /// Start of the mapping, null for device-local or stale buffers
    pub fn mapped_ptr(&self, handle: BufferHandle) -> *mut u8 {
        self.buffers
            .get(handle)
            .map_or(std::ptr::null_mut(), VulkanBuffer::mapped_ptr)
    }

    /// Make host writes to a mapped range visible to the device
    pub fn flush_mapped_memory(
        &self,
        handle: BufferHandle,
        offset: usize,
        size: usize,
    ) -> VulkanResult<()> {
        let buffer = self
            .buffers
            .get(handle)
            .ok_or_else(|| VulkanError::ArgumentNull(format!("Stale buffer handle {handle:?}")))?;
        buffer.flush_mapped_memory(offset as vk::DeviceSize, size as vk::DeviceSize)
    }

    /// Make device writes to a mapped range visible to the host
    pub fn invalidate_mapped_memory(
        &self,
        handle: BufferHandle,
        offset: usize,
        size: usize,
    ) -> VulkanResult<()> {
        let buffer = self
            .buffers
            .get(handle)
            .ok_or_else(|| VulkanError::ArgumentNull(format!("Stale buffer handle {handle:?}")))?;
        buffer.invalidate_mapped_memory(offset as vk::DeviceSize, size as vk::DeviceSize)
    }

    /// GPU address of `offset` bytes into a buffer, 0 without a device address
    ///
    /// # Panics
    ///
    /// `offset` must be 8-byte aligned.
    pub fn gpu_address(&self, handle: BufferHandle, offset: u64) -> u64 {
        assert!(
            offset & 7 == 0,
            "Buffer offset must be 8 bytes aligned as per GLSL_EXT_buffer_reference spec"
        );
        match self.buffers.get(handle) {
            Some(buffer) if buffer.device_address() != 0 => buffer.device_address() + offset,
            _ => 0,
        }
    }

    /// Size of mip 0
    pub fn dimensions(&self, handle: TextureHandle) -> Option<Dimensions> {
        self.textures.get(handle).map(|texture| texture.image().dimensions())
    }

    /// Format the texture was created with, after depth format substitution
    pub fn format(&self, handle: TextureHandle) -> Option<Format> {
        self.textures
            .get(handle)
            .and_then(|texture| Format::from_vk(texture.image().format()))
    }

    /// Index shaders use to find the texture in the bindless arrays; 0 (the dummy) when stale
    pub fn bindless_index(&self, handle: TextureHandle) -> u32 {
        if self.textures.get(handle).is_some() { handle.index() } else { 0 }
    }

    /// Index of the sampler in the bindless sampler array; 0 (the dummy) when stale
    pub fn sampler_index(&self, handle: SamplerHandle) -> u32 {
        if self.samplers.get(handle).is_some() { handle.index() } else { 0 }
    }

    /// Native compute pipeline, rebuilt if the bindless layout changed since it was built
    pub fn compute_pipeline(
        &mut self,
        handle: ComputePipelineHandle,
    ) -> VulkanResult<vk::Pipeline> {
        let layout = self.bindless.pipeline_layout();
        let in_flight = self.in_flight_handle();
        let state = self
            .compute_pipelines
            .get_mut(handle)
            .ok_or_else(|| {
                VulkanError::ArgumentNull(format!("Stale compute pipeline handle {handle:?}"))
            })?;

        if let Some(built) = state.pipeline.as_ref().filter(|built| built.layout() == layout) {
            return Ok(built.handle());
        }
        if let Some(stale) = state.pipeline.take() {
            self.deferred.push(move || drop(stale), in_flight);
        }

        let shader = self.shader_modules.get(state.desc.shader).ok_or_else(|| {
            VulkanError::ArgumentNull(
                "Shader module destroyed before the pipeline was rebuilt".to_string(),
            )
        })?;
        let built = pipeline::create_compute_pipeline(
            &self.device.device,
            self.pipeline_cache.handle(),
            layout,
            shader,
            &state.desc,
        )?;
        self.instance.set_debug_name(&self.device.device, built.handle(), &state.desc.debug_name);

        let raw = built.handle();
        state.pipeline = Some(built);
        Ok(raw)
    }

    /// Native render pipeline, rebuilt if the bindless layout changed since it was built
    pub fn render_pipeline(&mut self, handle: RenderPipelineHandle) -> VulkanResult<vk::Pipeline> {
        let layout = self.bindless.pipeline_layout();
        let in_flight = self.in_flight_handle();
        let state = self
            .render_pipelines
            .get_mut(handle)
            .ok_or_else(|| {
                VulkanError::ArgumentNull(format!("Stale render pipeline handle {handle:?}"))
            })?;

        if let Some(built) = state.pipeline.as_ref().filter(|built| built.layout() == layout) {
            return Ok(built.handle());
        }
        if let Some(stale) = state.pipeline.take() {
            self.deferred.push(move || drop(stale), in_flight);
        }

        let missing = || {
            VulkanError::ArgumentNull(
                "Shader module destroyed before the pipeline was rebuilt".to_string(),
            )
        };
        let vertex_shader = self.shader_modules.get(state.desc.vertex_shader).ok_or_else(missing)?;
        let fragment_shader =
            self.shader_modules.get(state.desc.fragment_shader).ok_or_else(missing)?;
        let built = pipeline::create_render_pipeline(
            &self.device.device,
            self.pipeline_cache.handle(),
            layout,
            vertex_shader,
            fragment_shader,
            &state.desc,
        )?;
        self.instance.set_debug_name(&self.device.device, built.handle(), &state.desc.debug_name);

        let raw = built.handle();
        state.pipeline = Some(built);
        Ok(raw)
    }

    /// Serialized pipeline cache, to seed the next run through `ContextConfig`
    pub fn pipeline_cache_data(&self) -> VulkanResult<Vec<u8>> {
        self.pipeline_cache.data()
    }

    /// Raw timestamps of `count` queries starting at `first`; blocks until available
    pub fn query_pool_results(
        &self,
        handle: QueryPoolHandle,
        first: u32,
        count: u32,
    ) -> VulkanResult<Vec<u64>> {
        self.query_pools
            .get(handle)
            .ok_or_else(|| {
                VulkanError::ArgumentNull(format!("Stale query pool handle {handle:?}"))
            })?
            .results(first, count)
    }

    /// Nanoseconds per timestamp tick
    pub fn timestamp_period(&self) -> f32 {
        self.physical_device.limits().timestamp_period
    }

    /// Name of the GPU in use
    pub fn device_name(&self) -> &str {
        &self.physical_device.name
    }

    /// Native device, for hosts that record their own commands
    pub fn device(&self) -> &ash::Device {
        &self.device.device
    }

    /// Configuration the context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Staging ring bookkeeping
    pub fn staging_ring(&self) -> &StagingRing {
        self.staging.ring()
    }

    /// Deferred tasks not yet run
    pub fn num_deferred_tasks(&self) -> usize {
        self.deferred.len()
    }

    /// Idle command buffer slots
    pub fn num_available_command_buffers(&self) -> u32 {
        self.immediate.num_available()
    }

    /// Current bindless capacities as (textures, samplers)
    pub fn bindless_capacity(&self) -> (u32, u32) {
        (self.bindless.max_textures(), self.bindless.max_samplers())
    }

    /// How many times the bindless table has grown
    pub fn num_descriptor_grows(&self) -> u32 {
        self.bindless.num_grows()
    }

    /// Live objects per pool as (buffers, textures, samplers), guards included
    pub fn num_objects(&self) -> (u32, u32, u32) {
        (
            self.buffers.num_objects(),
            self.textures.num_objects(),
            self.samplers.num_objects(),
        )
    }

    // ---------------------------------------------------------------------
    // Bindless table
    // ---------------------------------------------------------------------

    fn check_and_update_descriptor_sets(&mut self) -> VulkanResult<()> {
        if !self.bindless.is_dirty() {
            return Ok(());
        }

        let num_textures = self.textures.slot_count() as u32;
        let num_samplers = self.samplers.slot_count() as u32;
        let (max_textures, max_samplers) =
            self.bindless.required_capacity(num_textures, num_samplers);
        if max_textures != self.bindless.max_textures()
            || max_samplers != self.bindless.max_samplers()
        {
            let in_flight = self.in_flight_handle();
            self.bindless
                .grow_descriptor_pool(&mut self.deferred, in_flight, max_textures, max_samplers)?;
        }

        let dummy = self
            .textures
            .get(self.dummy_texture)
            .ok_or_else(|| VulkanError::RuntimeError("Dummy texture is missing".to_string()))?;
        let dummy_sampled = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: dummy.view(),
            image_layout: dummy.image().resting_layout(),
        };
        let dummy_storage = vk::DescriptorImageInfo {
            image_layout: vk::ImageLayout::GENERAL,
            ..dummy_sampled
        };

        let mut sampled = Vec::with_capacity(num_textures as usize);
        let mut storage = Vec::with_capacity(num_textures as usize);
        for slot in self.textures.slots() {
            let Some(texture) = slot else {
                sampled.push(dummy_sampled);
                storage.push(dummy_storage);
                continue;
            };
            let image = texture.image();
            let single_sample = image.samples() == vk::SampleCountFlags::TYPE_1;

            sampled.push(if image.is_sampled() && single_sample {
                vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.view(),
                    image_layout: image.resting_layout(),
                }
            } else {
                dummy_sampled
            });
            storage.push(if image.is_storage() && single_sample {
                vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.view(),
                    image_layout: vk::ImageLayout::GENERAL,
                }
            } else {
                dummy_storage
            });
        }

        let dummy_sampler = self
            .samplers
            .get(self.dummy_sampler)
            .map(VulkanSampler::handle)
            .ok_or_else(|| VulkanError::RuntimeError("Dummy sampler is missing".to_string()))?;
        let samplers: Vec<vk::DescriptorImageInfo> = self
            .samplers
            .slots()
            .map(|slot| vk::DescriptorImageInfo {
                sampler: slot.map_or(dummy_sampler, VulkanSampler::handle),
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            })
            .collect();

        self.bindless
            .write_descriptor_sets(&mut self.immediate, &sampled, &samplers, &storage)
    }

    // ---------------------------------------------------------------------
    // Encoding
    // ---------------------------------------------------------------------

    /// Native command buffer, for commands the context does not wrap
    pub fn cmd_raw(&self, cmd: &CommandBuffer) -> vk::CommandBuffer {
        cmd.raw()
    }

    /// Copy `size` bytes between buffers
    pub fn cmd_copy_buffer(
        &self,
        cmd: &CommandBuffer,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        let src = live(&self.buffers, src).handle();
        let dst = live(&self.buffers, dst).handle();
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device.device.cmd_copy_buffer(cmd.raw(), src, dst, &[region]);
        }
    }

    /// Make writes to a buffer by `src_stage` visible to `dst_stage`
    pub fn cmd_buffer_barrier(
        &self,
        cmd: &CommandBuffer,
        handle: BufferHandle,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let buffer = live(&self.buffers, handle).handle();
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd.raw(),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    /// Bind a compute pipeline and the bindless table
    pub fn cmd_bind_compute_pipeline(
        &mut self,
        cmd: &CommandBuffer,
        handle: ComputePipelineHandle,
    ) -> VulkanResult<()> {
        assert!(!cmd.is_rendering(), "Compute pipelines cannot be bound inside a rendering pass");
        assert!(
            self.compute_pipelines.get(handle).is_some(),
            "ComputePipeline handle {handle:?} is empty or stale"
        );

        self.check_and_update_descriptor_sets()?;
        let pipeline = self.compute_pipeline(handle)?;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd.raw(), vk::PipelineBindPoint::COMPUTE, pipeline);
        }
        self.bindless.bind(cmd.raw(), vk::PipelineBindPoint::COMPUTE);
        Ok(())
    }

    /// Bind a render pipeline and the bindless table
    pub fn cmd_bind_render_pipeline(
        &mut self,
        cmd: &CommandBuffer,
        handle: RenderPipelineHandle,
    ) -> VulkanResult<()> {
        assert!(
            self.render_pipelines.get(handle).is_some(),
            "RenderPipeline handle {handle:?} is empty or stale"
        );

        self.check_and_update_descriptor_sets()?;
        let pipeline = self.render_pipeline(handle)?;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd.raw(), vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        self.bindless.bind(cmd.raw(), vk::PipelineBindPoint::GRAPHICS);
        Ok(())
    }

    /// Write `value` into the push constants at `offset`
    ///
    /// # Panics
    ///
    /// Offset and size must be multiples of 4 and fit in the push constant range.
    pub fn cmd_push_constants<T: Pod>(&self, cmd: &CommandBuffer, offset: u32, value: &T) {
        let data = bytemuck::bytes_of(value);
        assert!(offset % 4 == 0 && data.len() % 4 == 0, "Push constants must be 4 bytes aligned");
        assert!(
            offset as usize + data.len() <= PUSH_CONSTANTS_SIZE as usize,
            "Push constants exceed {PUSH_CONSTANTS_SIZE} bytes"
        );
        unsafe {
            self.device.device.cmd_push_constants(
                cmd.raw(),
                self.bindless.pipeline_layout(),
                vk::ShaderStageFlags::ALL,
                offset,
                data,
            );
        }
    }

    /// Dispatch compute work groups
    pub fn cmd_dispatch(&self, cmd: &CommandBuffer, x: u32, y: u32, z: u32) {
        assert!(!cmd.is_rendering(), "Dispatch inside a rendering pass");
        unsafe {
            self.device.device.cmd_dispatch(cmd.raw(), x, y, z);
        }
    }

    /// Begin a dynamic rendering pass over `colors` and `depth`
    ///
    /// Transitions the attachments and sets a full-target viewport and scissor.
    pub fn cmd_begin_rendering(
        &mut self,
        cmd: &CommandBuffer,
        colors: &[ColorTarget],
        depth: Option<DepthTarget>,
    ) {
        assert!(
            !colors.is_empty() || depth.is_some(),
            "A rendering pass needs at least one attachment"
        );

        let mut extent: Option<vk::Extent2D> = None;
        let mut targets = Vec::with_capacity(colors.len() + 1);
        let mut color_infos = Vec::with_capacity(colors.len());

        for target in colors {
            let texture = live_mut(&mut self.textures, target.texture);
            let view = texture.view();
            let image = texture.image_mut();
            check_extent(&mut extent, image);
            if target.clear.is_some() {
                image.set_layout(vk::ImageLayout::UNDEFINED);
            }
            let range = image.full_range();
            let src_stage = src_stage_for(image.layout());
            image.transition_layout(
                cmd.raw(),
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                src_stage,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                range,
            );
            color_infos.push(
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(target.load_op())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(target.clear_value())
                    .build(),
            );
            targets.push(target.texture);
        }

        let depth_info = depth.map(|target| {
            let texture = live_mut(&mut self.textures, target.texture);
            let view = texture.view();
            let image = texture.image_mut();
            check_extent(&mut extent, image);
            if target.clear.is_some() {
                image.set_layout(vk::ImageLayout::UNDEFINED);
            }
            let range = image.full_range();
            let src_stage = src_stage_for(image.layout());
            image.transition_layout(
                cmd.raw(),
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                src_stage,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                range,
            );
            targets.push(target.texture);
            vk::RenderingAttachmentInfo::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(target.load_op())
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(target.clear_value())
                .build()
        });

        let extent = extent.unwrap_or_default();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            let device = &self.device.device;
            device.cmd_begin_rendering(cmd.raw(), &rendering_info);
            device.cmd_set_viewport(cmd.raw(), 0, &[viewport]);
            device.cmd_set_scissor(cmd.raw(), 0, &[render_area]);
        }
        cmd.begin_pass(targets);
    }

    /// End the rendering pass; sampled attachments go back to their resting layout
    pub fn cmd_end_rendering(&mut self, cmd: &CommandBuffer) {
        let targets = cmd.end_pass();
        unsafe {
            self.device.device.cmd_end_rendering(cmd.raw());
        }

        for handle in targets {
            let Some(texture) = self.textures.get_mut(handle) else {
                continue;
            };
            let image = texture.image_mut();
            // presentation picks swapchain images up from the attachment layout
            if image.is_swapchain_image() || !(image.is_sampled() || image.is_storage()) {
                continue;
            }
            let layout = image.resting_layout();
            let range = image.full_range();
            image.transition_layout(
                cmd.raw(),
                layout,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                range,
            );
        }
    }

    /// Draw non-indexed primitives
    pub fn cmd_draw(
        &self,
        cmd: &CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        base_instance: u32,
    ) {
        assert!(cmd.is_rendering(), "Draw outside of a rendering pass");
        if vertex_count == 0 {
            return;
        }
        unsafe {
            self.device
                .device
                .cmd_draw(cmd.raw(), vertex_count, instance_count, first_vertex, base_instance);
        }
    }

    /// Reset `count` queries starting at `first`
    pub fn cmd_reset_query_pool(
        &self,
        cmd: &CommandBuffer,
        handle: QueryPoolHandle,
        first: u32,
        count: u32,
    ) {
        let pool = live(&self.query_pools, handle).handle();
        unsafe {
            self.device.device.cmd_reset_query_pool(cmd.raw(), pool, first, count);
        }
    }

    /// Write a timestamp into `query` once all prior commands complete
    pub fn cmd_write_timestamp(&self, cmd: &CommandBuffer, handle: QueryPoolHandle, query: u32) {
        let pool = live(&self.query_pools, handle).handle();
        unsafe {
            self.device.device.cmd_write_timestamp(
                cmd.raw(),
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                pool,
                query,
            );
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(handle) = self.outstanding.take() {
            self.immediate.abandon(handle);
        }
        if let Err(e) = unsafe { self.device.device.device_wait_idle() } {
            log::error!("device_wait_idle failed during teardown: {:?}", e);
        }

        self.process_releases();

        let guard_textures = u32::from(self.textures.get(self.dummy_texture).is_some());
        let guard_samplers = u32::from(self.samplers.get(self.dummy_sampler).is_some());
        warn_leaks("buffers", self.buffers.num_objects());
        warn_leaks("textures", self.textures.num_objects() - guard_textures);
        warn_leaks("samplers", self.samplers.num_objects() - guard_samplers);
        warn_leaks("shader modules", self.shader_modules.num_objects());
        warn_leaks("compute pipelines", self.compute_pipelines.num_objects());
        warn_leaks("render pipelines", self.render_pipelines.num_objects());
        warn_leaks("query pools", self.query_pools.num_objects());

        let last = self.immediate.last_submit_handle();
        let buffers = self.buffers.drain();
        let textures = self.textures.drain();
        let samplers = self.samplers.drain();
        let compute_pipelines = self.compute_pipelines.drain();
        let render_pipelines = self.render_pipelines.drain();
        let query_pools = self.query_pools.drain();
        let resources =
            (compute_pipelines, render_pipelines, query_pools, samplers, textures, buffers);
        self.deferred.push(move || drop(resources), last);
        self.shader_modules.clear();

        if let Err(e) = self.deferred.wait_all(&mut self.immediate) {
            log::error!("Deferred tasks failed during teardown: {}", e);
        }
        log::debug!("Context destroyed");
    }
}

fn warn_leaks(kind: &str, count: u32) {
    if count > 0 {
        log::warn!("Leaked {count} {kind}");
    }
}

fn live<Tag: ResourceTag, T>(pool: &Pool<Tag, T>, handle: Handle<Tag>) -> &T {
    match pool.get(handle) {
        Some(object) => object,
        None => panic!("{} handle {:?} is empty or stale", Tag::KIND, handle),
    }
}

fn live_mut<Tag: ResourceTag, T>(pool: &mut Pool<Tag, T>, handle: Handle<Tag>) -> &mut T {
    match pool.get_mut(handle) {
        Some(object) => object,
        None => panic!("{} handle {:?} is empty or stale", Tag::KIND, handle),
    }
}

fn native_format(image: &VulkanImage) -> VulkanResult<Format> {
    Format::from_vk(image.format())
        .ok_or_else(|| {
            VulkanError::Unsupported(format!("No transfer size known for {:?}", image.format()))
        })
}

fn check_extent(extent: &mut Option<vk::Extent2D>, image: &VulkanImage) {
    let size = vk::Extent2D {
        width: image.extent().width,
        height: image.extent().height,
    };
    match extent {
        Some(expected) => assert!(
            *expected == size,
            "Attachments differ in size: {}x{} vs {}x{}",
            expected.width,
            expected.height,
            size.width,
            size.height
        ),
        None => *extent = Some(size),
    }
}

/// Staging ring size for a requested size and the device's storage buffer limit
fn staging_ring_size(requested: u32, max_storage_buffer_range: u32) -> u32 {
    let size = requested
        .min(max_storage_buffer_range)
        .min(MAX_STAGING_BUFFER_SIZE);
    size & !(STAGING_ALIGNMENT - 1)
}

/// Native usage of a buffer; every buffer can be copied from and to
fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |=
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

/// Native usage of an image
fn image_usage_flags(
    usage: TextureUsage,
    format: Format,
    storage: StorageType,
) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::ATTACHMENT) {
        flags |= if format.is_depth_or_stencil() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    if storage == StorageType::Memoryless {
        return flags | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
    }

    flags |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_ring_size_is_clamped_and_aligned() {
        assert_eq!(staging_ring_size(1024 * 1024, u32::MAX), 1024 * 1024);
        assert_eq!(staging_ring_size(u32::MAX, u32::MAX), MAX_STAGING_BUFFER_SIZE);
        assert_eq!(staging_ring_size(1024 * 1024, 100_007), 100_000);
        assert_eq!(staging_ring_size(1024 * 1024, 100_007) % STAGING_ALIGNMENT, 0);
    }

    #[test]
    fn test_buffer_usage_translation() {
        let flags = buffer_usage_flags(BufferUsage::VERTEX);
        assert!(
            flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(!flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));

        let flags = buffer_usage_flags(BufferUsage::STORAGE | BufferUsage::INDIRECT);
        assert!(flags.contains(
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        ));
    }

    #[test]
    fn test_image_usage_translation() {
        let flags = image_usage_flags(
            TextureUsage::SAMPLED | TextureUsage::ATTACHMENT,
            Format::Z32Float,
            StorageType::Device,
        );
        let expected = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
        assert!(flags.contains(expected));
        assert!(!flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let flags = image_usage_flags(
            TextureUsage::ATTACHMENT,
            Format::Rgba8Unorm,
            StorageType::Memoryless,
        );
        assert_eq!(
            flags,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
        );
    }
}
