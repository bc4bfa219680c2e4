//! Bindless descriptor table
//!
//! Every texture and sampler in the context is visible to every shader
//! through three large update-after-bind arrays:
//!
//! | binding | type            | contents                |
//! |---------|-----------------|-------------------------|
//! | 0       | `SAMPLED_IMAGE` | all textures            |
//! | 1       | `SAMPLER`       | all samplers            |
//! | 2       | `STORAGE_IMAGE` | all storage textures    |
//!
//! The table is rewritten lazily when resources come and go, and grows by
//! doubling when a pool outgrows it. Writes rotate through three buffered
//! descriptor sets so an update never touches a set the GPU may still read.

use ash::{vk, Device};

use crate::render::backends::vulkan::initialization::context::UpdateAfterBindLimits;
use crate::render::backends::vulkan::state::{DeferredTaskQueue, SubmissionTimeline, SubmitHandle};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Binding of the sampled image array
pub const BINDING_TEXTURES: u32 = 0;
/// Binding of the sampler array
pub const BINDING_SAMPLERS: u32 = 1;
/// Binding of the storage image array
pub const BINDING_STORAGE_IMAGES: u32 = 2;

/// Descriptor sets written round robin
pub const NUM_BUFFERED_SETS: usize = 3;
/// Set slots in the pipeline layout that all use the bindless layout
pub const NUM_BINDLESS_SET_SLOTS: u32 = 4;
/// Push constant bytes available to every stage
pub const PUSH_CONSTANTS_SIZE: u32 = 128;

/// Smallest power-of-two multiple of `current` that holds `required`
pub fn grown_capacity(current: u32, required: u32) -> u32 {
    let mut capacity = current.max(1);
    while capacity < required {
        capacity *= 2;
    }
    capacity
}

/// Descriptor set layout builder for update-after-bind arrays
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add an array binding visible to all stages
    pub fn add_array(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        );
        self
    }

    /// Build the layout; every binding is update-after-bind and partially bound
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let binding_flags = vec![
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
            self.bindings.len()
        ];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&self.bindings)
            .push_next(&mut flags_info);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool; dropping it frees every set allocated from it
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create an update-after-bind pool holding `max_sets` bindless sets
    pub fn new(
        device: Device,
        max_sets: u32,
        max_textures: u32,
        max_samplers: u32,
    ) -> VulkanResult<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: max_textures * max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: max_samplers * max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_textures * max_sets,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set per layout
    pub fn allocate_sets(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::Api)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Pipeline layout wrapper with automatic cleanup
pub struct PipelineLayout {
    layout: vk::PipelineLayout,
    device: Device,
}

impl PipelineLayout {
    /// Layout with `set_layout` in every bindless slot and one push constant range
    pub fn new(device: Device, set_layout: vk::DescriptorSetLayout) -> VulkanResult<Self> {
        let set_layouts = [set_layout; NUM_BINDLESS_SET_SLOTS as usize];
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: PUSH_CONSTANTS_SIZE,
        }];

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(Self { layout, device })
    }

    /// Get the pipeline layout handle
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BufferedSet {
    set: vk::DescriptorSet,
    last_use: SubmitHandle,
}

type BindlessObjects =
    (DescriptorSetLayout, DescriptorPool, PipelineLayout, [BufferedSet; NUM_BUFFERED_SETS]);

/// The bindless table and the objects sized to its capacity
pub struct BindlessDescriptors {
    device: Device,
    limits: UpdateAfterBindLimits,
    pipeline_layout: PipelineLayout,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
    sets: [BufferedSet; NUM_BUFFERED_SETS],
    current: usize,
    pending_binds: [bool; NUM_BUFFERED_SETS],
    max_textures: u32,
    max_samplers: u32,
    awaiting_creation: bool,
    num_grows: u32,
}

impl BindlessDescriptors {
    /// Create the table with room for `max_textures` textures and `max_samplers` samplers
    pub fn new(
        device: Device,
        limits: UpdateAfterBindLimits,
        max_push_constants_size: u32,
        max_textures: u32,
        max_samplers: u32,
    ) -> VulkanResult<Self> {
        if PUSH_CONSTANTS_SIZE > max_push_constants_size {
            log::warn!(
                "Push constants size {} exceeds the device limit {}",
                PUSH_CONSTANTS_SIZE,
                max_push_constants_size
            );
        }

        let (layout, pool, pipeline_layout, sets) =
            Self::create_objects(&device, &limits, max_textures, max_samplers)?;

        Ok(Self {
            device,
            limits,
            pipeline_layout,
            pool,
            layout,
            sets,
            current: 0,
            pending_binds: [false; NUM_BUFFERED_SETS],
            max_textures,
            max_samplers,
            awaiting_creation: true,
            num_grows: 0,
        })
    }

    fn create_objects(
        device: &Device,
        limits: &UpdateAfterBindLimits,
        max_textures: u32,
        max_samplers: u32,
    ) -> VulkanResult<BindlessObjects> {
        if max_textures > limits.max_sampled_images {
            log::warn!(
                "Bindless texture capacity {} exceeds maxDescriptorSetUpdateAfterBindSampledImages ({})",
                max_textures,
                limits.max_sampled_images
            );
        }
        if max_textures > limits.max_storage_images {
            log::warn!(
                "Bindless storage capacity {} exceeds maxDescriptorSetUpdateAfterBindStorageImages ({})",
                max_textures,
                limits.max_storage_images
            );
        }
        if max_samplers > limits.max_samplers {
            log::warn!(
                "Bindless sampler capacity {} exceeds maxDescriptorSetUpdateAfterBindSamplers ({})",
                max_samplers,
                limits.max_samplers
            );
        }

        let layout = DescriptorSetLayoutBuilder::new()
            .add_array(BINDING_TEXTURES, vk::DescriptorType::SAMPLED_IMAGE, max_textures)
            .add_array(BINDING_SAMPLERS, vk::DescriptorType::SAMPLER, max_samplers)
            .add_array(BINDING_STORAGE_IMAGES, vk::DescriptorType::STORAGE_IMAGE, max_textures)
            .build(device)?;

        let pool = DescriptorPool::new(
            device.clone(),
            NUM_BUFFERED_SETS as u32,
            max_textures,
            max_samplers,
        )?;
        let allocated = pool.allocate_sets(&[layout.handle(); NUM_BUFFERED_SETS])?;
        let mut sets = [BufferedSet::default(); NUM_BUFFERED_SETS];
        for (buffered, set) in sets.iter_mut().zip(allocated) {
            buffered.set = set;
        }

        let pipeline_layout = PipelineLayout::new(device.clone(), layout.handle())?;

        Ok((layout, pool, pipeline_layout, sets))
    }

    /// Recreate the table at a new capacity
    ///
    /// The old layout, pool and pipeline layout stay alive until `handle`
    /// retires. Pipelines built against the old layout are rebuilt on use.
    pub fn grow_descriptor_pool(
        &mut self,
        deferred: &mut DeferredTaskQueue,
        handle: SubmitHandle,
        max_textures: u32,
        max_samplers: u32,
    ) -> VulkanResult<()> {
        log::debug!(
            "Growing bindless table: {} -> {} textures, {} -> {} samplers",
            self.max_textures,
            max_textures,
            self.max_samplers,
            max_samplers
        );

        let (layout, pool, pipeline_layout, sets) =
            Self::create_objects(&self.device, &self.limits, max_textures, max_samplers)?;

        let old_layout = std::mem::replace(&mut self.layout, layout);
        let old_pool = std::mem::replace(&mut self.pool, pool);
        let old_pipeline_layout = std::mem::replace(&mut self.pipeline_layout, pipeline_layout);
        deferred.push(
            move || drop((old_pipeline_layout, old_pool, old_layout)),
            handle,
        );

        self.sets = sets;
        self.current = 0;
        self.pending_binds = [false; NUM_BUFFERED_SETS];
        self.max_textures = max_textures;
        self.max_samplers = max_samplers;
        self.awaiting_creation = true;
        self.num_grows += 1;
        Ok(())
    }

    /// Request a rewrite before the next bind
    pub fn mark_dirty(&mut self) {
        self.awaiting_creation = true;
    }

    /// A rewrite is pending
    pub fn is_dirty(&self) -> bool {
        self.awaiting_creation
    }

    /// Capacities that hold `num_textures` and `num_samplers`, by doubling
    pub fn required_capacity(&self, num_textures: u32, num_samplers: u32) -> (u32, u32) {
        (
            grown_capacity(self.max_textures, num_textures),
            grown_capacity(self.max_samplers, num_samplers),
        )
    }

    /// Texture capacity
    pub fn max_textures(&self) -> u32 {
        self.max_textures
    }

    /// Sampler capacity
    pub fn max_samplers(&self) -> u32 {
        self.max_samplers
    }

    /// How many times the table has been recreated
    pub fn num_grows(&self) -> u32 {
        self.num_grows
    }

    /// Pipeline layout every pipeline is built against
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout.handle()
    }

    /// Write the three arrays into the next buffered set
    ///
    /// Waits for the last submission that bound that set. The slices must
    /// be no longer than the current capacities.
    pub fn write_descriptor_sets<T: SubmissionTimeline + ?Sized>(
        &mut self,
        timeline: &mut T,
        sampled_images: &[vk::DescriptorImageInfo],
        samplers: &[vk::DescriptorImageInfo],
        storage_images: &[vk::DescriptorImageInfo],
    ) -> VulkanResult<()> {
        debug_assert!(sampled_images.len() <= self.max_textures as usize);
        debug_assert!(storage_images.len() <= self.max_textures as usize);
        debug_assert!(samplers.len() <= self.max_samplers as usize);

        self.current = (self.current + 1) % NUM_BUFFERED_SETS;
        let target = self.sets[self.current];
        timeline.wait(target.last_use)?;

        let mut writes = Vec::with_capacity(3);
        for (binding, descriptor_type, infos) in [
            (BINDING_TEXTURES, vk::DescriptorType::SAMPLED_IMAGE, sampled_images),
            (BINDING_SAMPLERS, vk::DescriptorType::SAMPLER, samplers),
            (BINDING_STORAGE_IMAGES, vk::DescriptorType::STORAGE_IMAGE, storage_images),
        ] {
            if infos.is_empty() {
                continue;
            }
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(target.set)
                    .dst_binding(binding)
                    .dst_array_element(0)
                    .descriptor_type(descriptor_type)
                    .image_info(infos)
                    .build(),
            );
        }

        if !writes.is_empty() {
            unsafe {
                self.device.update_descriptor_sets(&writes, &[]);
            }
        }

        self.awaiting_creation = false;
        Ok(())
    }

    /// Bind the current set to every bindless slot of `bind_point`
    pub fn bind(&mut self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint) {
        let set = self.sets[self.current].set;
        let sets = [set; NUM_BINDLESS_SET_SLOTS as usize];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                self.pipeline_layout.handle(),
                0,
                &sets,
                &[],
            );
        }
        self.pending_binds[self.current] = true;
    }

    /// Record that the sets bound since the last submit are read by `handle`
    pub fn on_submit(&mut self, handle: SubmitHandle) {
        for (set, pending) in self.sets.iter_mut().zip(self.pending_binds.iter_mut()) {
            if std::mem::take(pending) {
                set.last_use = handle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_doubles_until_it_fits() {
        assert_eq!(grown_capacity(16, 3), 16);
        assert_eq!(grown_capacity(16, 16), 16);
        assert_eq!(grown_capacity(16, 17), 32);
        assert_eq!(grown_capacity(16, 100), 128);
        assert_eq!(grown_capacity(0, 5), 8);
    }

    #[test]
    fn test_one_doubling_per_threshold() {
        let mut capacity = 16;
        let mut grows = 0;
        for count in 1..=64 {
            let next = grown_capacity(capacity, count);
            if next != capacity {
                grows += 1;
                capacity = next;
            }
        }
        assert_eq!(capacity, 64);
        assert_eq!(grows, 2);
    }
}
