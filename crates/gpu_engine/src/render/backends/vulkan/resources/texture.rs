//! Vulkan images, image views and samplers
//!
//! `VulkanImage` remembers the layout it was last transitioned to so that
//! staging, mip generation and presentation can emit correct barriers
//! without the caller tracking state.

use ash::{vk, Device};

use crate::render::api::descriptors::{Dimensions, SamplerDesc, TextureRangeDesc, TextureType};
use crate::render::api::format::Format;
use crate::render::backends::vulkan::resources::buffer::find_memory_type;
use crate::render::backends::vulkan::state::{image_memory_barrier, ImageTransition};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Parameters for [`VulkanImage::new`]
#[derive(Debug, Clone, Copy)]
pub struct ImageCreateInfo {
    /// 2D or 3D
    pub image_type: vk::ImageType,
    /// Native format
    pub format: vk::Format,
    /// Size of mip 0
    pub extent: vk::Extent3D,
    /// Mip levels
    pub num_levels: u32,
    /// Array layers (six per cube)
    pub num_layers: u32,
    /// MSAA samples
    pub samples: vk::SampleCountFlags,
    /// Native usage
    pub usage: vk::ImageUsageFlags,
    /// Extra creation flags, e.g. `CUBE_COMPATIBLE`
    pub flags: vk::ImageCreateFlags,
    /// Requested memory properties
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// A native image with its memory and tracked layout
pub struct VulkanImage {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    usage: vk::ImageUsageFlags,
    extent: vk::Extent3D,
    image_type: vk::ImageType,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    num_levels: u32,
    num_layers: u32,
    samples: vk::SampleCountFlags,
    layout: vk::ImageLayout,
    is_swapchain_image: bool,
}

impl VulkanImage {
    /// Create an image and bind freshly allocated memory to it
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        info: &ImageCreateInfo,
    ) -> VulkanResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .flags(info.flags)
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.num_levels)
            .array_layers(info.num_layers)
            .samples(info.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device.create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut result = Self {
            device,
            image,
            memory: vk::DeviceMemory::null(),
            usage: info.usage,
            extent: info.extent,
            image_type: info.image_type,
            format: info.format,
            aspect: aspect_for_format(info.format),
            num_levels: info.num_levels,
            num_layers: info.num_layers,
            samples: info.samples,
            layout: vk::ImageLayout::UNDEFINED,
            is_swapchain_image: false,
        };

        let mem_requirements = unsafe { result.device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            memory_properties,
            mem_requirements.memory_type_bits,
            info.memory_flags,
        )
            .or_else(|_| {
                find_memory_type(
                    memory_properties,
                    mem_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )
            })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        result.memory = unsafe {
            result.device.allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            result.device.bind_image_memory(image, result.memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(result)
    }

    /// Wrap an image owned by a swapchain; dropping it leaves the image alone
    pub fn from_swapchain(
        device: Device,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            device,
            image,
            memory: vk::DeviceMemory::null(),
            usage,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            image_type: vk::ImageType::TYPE_2D,
            format,
            aspect: aspect_for_format(format),
            num_levels: 1,
            num_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            layout: vk::ImageLayout::UNDEFINED,
            is_swapchain_image: true,
        }
    }

    /// Native image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Device this image was created on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Size of mip 0
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Size of mip 0 as engine dimensions
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.extent.width, self.extent.height, self.extent.depth)
    }

    /// 2D or 3D
    pub fn image_type(&self) -> vk::ImageType {
        self.image_type
    }

    /// Native format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Mip levels
    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    /// Array layers
    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    /// MSAA samples
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Native usage flags
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Layout after the last recorded transition
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Override the tracked layout after an external transition (e.g. a render pass)
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Owned by a swapchain
    pub fn is_swapchain_image(&self) -> bool {
        self.is_swapchain_image
    }

    /// Usable as a sampled image
    pub fn is_sampled(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::SAMPLED)
    }

    /// Usable as a storage image
    pub fn is_storage(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::STORAGE)
    }

    /// Has a depth or stencil aspect
    pub fn is_depth_or_stencil(&self) -> bool {
        self.aspect.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }

    /// All aspects of the format
    pub fn aspect_flags(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    /// Aspect used for buffer copies, which may only name one
    pub fn copy_aspect_flags(&self) -> vk::ImageAspectFlags {
        if self.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else if self.aspect.contains(vk::ImageAspectFlags::STENCIL) {
            vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// Layout images settle in after transfers and that shaders see them in
    ///
    /// Storage images stay in `GENERAL` so their sampled and storage
    /// descriptors agree.
    pub fn resting_layout(&self) -> vk::ImageLayout {
        if self.is_sampled() && !self.is_storage() {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::GENERAL
        }
    }

    /// Every mip and layer
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.num_levels,
            base_array_layer: 0,
            layer_count: self.num_layers,
        }
    }

    /// Record a transition from the tracked layout to `new_layout`
    pub fn transition_layout(
        &mut self,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        range: vk::ImageSubresourceRange,
    ) {
        let transition = ImageTransition {
            src_access: layout_access_mask(self.layout),
            dst_access: layout_access_mask(new_layout),
            old_layout: self.layout,
            new_layout,
            src_stage,
            dst_stage,
        };
        image_memory_barrier(&self.device, cmd, self.image, transition, range);
        self.layout = new_layout;
    }

    /// Move every mip and layer out of `UNDEFINED` into the resting layout
    pub fn initialize_layout(&mut self, cmd: vk::CommandBuffer) {
        if self.layout != vk::ImageLayout::UNDEFINED {
            return;
        }
        let layout = self.resting_layout();
        let range = self.full_range();
        self.transition_layout(
            cmd,
            layout,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            range,
        );
    }

    /// Fill mips 1.. of every layer by successive blits from mip 0
    ///
    /// Leaves the image in its resting layout. The format must support
    /// linear blits; the caller checks that.
    pub fn generate_mipmap(&mut self, cmd: vk::CommandBuffer) {
        if self.num_levels <= 1 {
            return;
        }

        let filter = if self.is_depth_or_stencil() {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let level_range = |level: u32| vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.num_layers,
        };

        // Mip 0 keeps its contents
        image_memory_barrier(
            &self.device,
            cmd,
            self.image,
            ImageTransition {
                src_access: layout_access_mask(self.layout),
                dst_access: vk::AccessFlags::TRANSFER_READ,
                old_layout: self.layout,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            },
            level_range(0),
        );

        for level in 1..self.num_levels {
            image_memory_barrier(
                &self.device,
                cmd,
                self.image,
                ImageTransition {
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                },
                level_range(level),
            );

            let src = mip_extent_offset(self.extent, level - 1);
            let dst = mip_extent_offset(self.extent, level);
            let blit = vk::ImageBlit::builder()
                .src_offsets([vk::Offset3D::default(), src])
                .src_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: self.num_layers,
                })
                .dst_offsets([vk::Offset3D::default(), dst])
                .dst_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.num_layers,
                });

            unsafe {
                self.device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit.build()],
                    filter,
                );
            }

            // This level becomes the source of the next blit
            image_memory_barrier(
                &self.device,
                cmd,
                self.image,
                ImageTransition {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::TRANSFER_READ,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                },
                level_range(level),
            );
        }

        let final_layout = self.resting_layout();
        image_memory_barrier(
            &self.device,
            cmd,
            self.image,
            ImageTransition {
                src_access: vk::AccessFlags::TRANSFER_READ,
                dst_access: layout_access_mask(final_layout),
                old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                new_layout: final_layout,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            },
            self.full_range(),
        );
        self.layout = final_layout;
    }

    /// Create a view over a subset of the image
    pub fn create_image_view(
        &self,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
        base_level: u32,
        num_levels: u32,
        base_layer: u32,
        num_layers: u32,
    ) -> VulkanResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(self.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: base_level,
                level_count: num_levels,
                base_array_layer: base_layer,
                layer_count: num_layers,
            });

        unsafe {
            self.device.create_image_view(&view_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        if self.is_swapchain_image {
            return;
        }
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// An image plus the default view shaders see
pub struct VulkanTexture {
    image: VulkanImage,
    view: vk::ImageView,
}

impl VulkanTexture {
    /// Take ownership of `image` and `view`
    pub fn new(image: VulkanImage, view: vk::ImageView) -> Self {
        Self { image, view }
    }

    /// Underlying image
    pub fn image(&self) -> &VulkanImage {
        &self.image
    }

    /// Underlying image, for layout transitions
    pub fn image_mut(&mut self) -> &mut VulkanImage {
        &mut self.image
    }

    /// Default view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.image.device().destroy_image_view(self.view, None);
        }
    }
}

/// Sampler with RAII cleanup
pub struct VulkanSampler {
    device: Device,
    sampler: vk::Sampler,
}

impl VulkanSampler {
    /// Create a sampler; anisotropy is dropped when `max_anisotropy_limit` is `None`
    pub fn new(
        device: Device,
        desc: &SamplerDesc<'_>,
        max_anisotropy_limit: Option<f32>,
    ) -> VulkanResult<Self> {
        let info = sampler_create_info(desc, max_anisotropy_limit);
        let sampler = unsafe {
            device.create_sampler(&info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, sampler })
    }

    /// Native handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

/// Translate a sampler descriptor, clamping anisotropy to the device limit
pub fn sampler_create_info(
    desc: &SamplerDesc<'_>,
    max_anisotropy_limit: Option<f32>,
) -> vk::SamplerCreateInfo {
    let anisotropy = match (desc.max_anisotropy, max_anisotropy_limit) {
        (Some(requested), Some(limit)) if requested > 1.0 => Some(requested.min(limit)),
        _ => None,
    };

    vk::SamplerCreateInfo::builder()
        .mag_filter(desc.mag_filter)
        .min_filter(desc.min_filter)
        .mipmap_mode(desc.mipmap_mode)
        .address_mode_u(desc.wrap_u)
        .address_mode_v(desc.wrap_v)
        .address_mode_w(desc.wrap_w)
        .mip_lod_bias(0.0)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .compare_enable(desc.compare_op.is_some())
        .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .build()
}

/// Access mask that goes with an image layout on either side of a barrier
pub fn layout_access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        _ => vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
    }
}

fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    Format::from_vk(format).map_or(vk::ImageAspectFlags::COLOR, Format::aspect_flags)
}

/// Far corner of mip `level` as a blit offset
fn mip_extent_offset(extent: vk::Extent3D, level: u32) -> vk::Offset3D {
    vk::Offset3D {
        x: (extent.width >> level).max(1) as i32,
        y: (extent.height >> level).max(1) as i32,
        z: (extent.depth >> level).max(1) as i32,
    }
}

/// Number of mips in a full chain for a `width` x `height` image
pub fn calc_num_mip_levels(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Check a texture against the device's dimension and multisampling limits
pub fn validate_image_limits(
    texture_type: TextureType,
    samples: vk::SampleCountFlags,
    dimensions: Dimensions,
    limits: &vk::PhysicalDeviceLimits,
) -> VulkanResult<()> {
    if samples != vk::SampleCountFlags::TYPE_1 && texture_type != TextureType::Tex2D {
        return Err(VulkanError::ArgumentOutOfRange(
            "Multisampling is supported only for 2D textures".to_string(),
        ));
    }

    let (max_dim, dims): (u32, &[u32]) = match texture_type {
        TextureType::Tex2D => {
            (limits.max_image_dimension2_d, &[dimensions.width, dimensions.height])
        }
        TextureType::Cube => {
            (limits.max_image_dimension_cube, &[dimensions.width, dimensions.height])
        }
        TextureType::Tex3D => (
            limits.max_image_dimension3_d,
            &[dimensions.width, dimensions.height, dimensions.depth],
        ),
    };

    if dims.iter().any(|&d| d > max_dim) {
        return Err(VulkanError::ArgumentOutOfRange(format!(
            "{texture_type:?} texture {}x{}x{} exceeds the device limit of {max_dim}",
            dimensions.width, dimensions.height, dimensions.depth
        )));
    }

    Ok(())
}

/// Check that `range` addresses texels that exist in a texture of `dimensions`
pub fn validate_range(
    dimensions: Dimensions,
    num_levels: u32,
    num_layers: u32,
    range: &TextureRangeDesc,
) -> VulkanResult<()> {
    let dims = range.dimensions;
    if dims.width == 0
        || dims.height == 0
        || dims.depth == 0
        || range.num_layers == 0
        || range.num_mip_levels == 0
    {
        return Err(VulkanError::ArgumentOutOfRange(
            "Texture range has an empty dimension, layer count or mip count".to_string(),
        ));
    }
    let mips_end = range.mip_level.checked_add(range.num_mip_levels);
    if range.mip_level >= num_levels || mips_end.map_or(true, |end| end > num_levels) {
        return Err(VulkanError::ArgumentOutOfRange(format!(
            "Mip range of {} levels from {} outside of {num_levels} levels",
            range.num_mip_levels, range.mip_level
        )));
    }
    let layers_end = range.layer.checked_add(range.num_layers);
    if layers_end.map_or(true, |end| end > num_layers) {
        return Err(VulkanError::ArgumentOutOfRange(format!(
            "Layer range of {} layers from {} outside of {num_layers} layers",
            range.num_layers, range.layer
        )));
    }

    let mip = dimensions.mip(range.mip_level);
    if dims.width > mip.width || dims.height > mip.height || dims.depth > mip.depth {
        return Err(VulkanError::ArgumentOutOfRange(
            "Texture range is larger than the mip level".to_string(),
        ));
    }

    let offset = range.offset;
    if offset.x < 0 || offset.y < 0 || offset.z < 0 {
        return Err(VulkanError::ArgumentOutOfRange("Negative texture range offset".to_string()));
    }
    if offset.x as u32 > mip.width - dims.width
        || offset.y as u32 > mip.height - dims.height
        || offset.z as u32 > mip.depth - dims.depth
    {
        return Err(VulkanError::ArgumentOutOfRange(
            "Texture range extends past the mip level".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_2d(width: u32, height: u32) -> TextureRangeDesc {
        TextureRangeDesc::new(Dimensions::new_2d(width, height))
    }

    #[test]
    fn test_mip_level_count() {
        assert_eq!(calc_num_mip_levels(1, 1), 1);
        assert_eq!(calc_num_mip_levels(256, 256), 9);
        assert_eq!(calc_num_mip_levels(256, 17), 9);
        assert_eq!(calc_num_mip_levels(3, 5), 3);
        assert_eq!(calc_num_mip_levels(0, 0), 1);
    }

    #[test]
    fn test_validate_full_and_offset_ranges() {
        let dims = Dimensions::new_2d(64, 32);
        assert!(validate_range(dims, 7, 1, &range_2d(64, 32)).is_ok());
        assert!(validate_range(dims, 7, 1, &range_2d(16, 16).with_offset(48, 16, 0)).is_ok());
        // mip 2 is 16x8
        assert!(validate_range(dims, 7, 1, &range_2d(16, 8).with_mip_levels(2, 1)).is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let dims = Dimensions::new_2d(64, 32);
        let too_wide = range_2d(65, 32);
        let past_edge = range_2d(16, 16).with_offset(49, 0, 0);
        let negative = range_2d(1, 1).with_offset(-1, 0, 0);
        let bad_mip = range_2d(1, 1).with_mip_levels(7, 1);
        let bad_mip_count = range_2d(1, 1).with_mip_levels(6, 2);
        let bad_layer = range_2d(1, 1).with_layers(1, 1);
        let too_big_for_mip = range_2d(64, 32).with_mip_levels(1, 1);
        let empty = range_2d(0, 1);

        let rejected = [
            too_wide,
            past_edge,
            negative,
            bad_mip,
            bad_mip_count,
            bad_layer,
            too_big_for_mip,
            empty,
        ];
        for range in rejected {
            assert!(
                matches!(
                    validate_range(dims, 7, 1, &range),
                    Err(VulkanError::ArgumentOutOfRange(_))
                ),
                "{range:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_wrapping_ranges() {
        let dims = Dimensions::new_2d(4, 4);
        let huge_layer = range_2d(1, 1).with_layers(u32::MAX, 1);
        let huge_mip_count = range_2d(1, 1).with_mip_levels(1, u32::MAX);

        assert!(matches!(
            validate_range(dims, 1, 1, &huge_layer),
            Err(VulkanError::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            validate_range(dims, 3, 1, &huge_mip_count),
            Err(VulkanError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_image_limits() {
        let limits = vk::PhysicalDeviceLimits {
            max_image_dimension2_d: 4096,
            max_image_dimension3_d: 256,
            max_image_dimension_cube: 2048,
            ..Default::default()
        };
        let check = |texture_type, samples, dimensions| {
            validate_image_limits(texture_type, samples, dimensions, &limits)
        };
        let (one, four) = (vk::SampleCountFlags::TYPE_1, vk::SampleCountFlags::TYPE_4);

        assert!(check(TextureType::Tex2D, one, Dimensions::new_2d(4096, 4096)).is_ok());
        assert!(check(TextureType::Tex2D, four, Dimensions::new_2d(128, 128)).is_ok());
        assert!(check(TextureType::Tex2D, one, Dimensions::new_2d(4097, 1)).is_err());
        assert!(check(TextureType::Cube, one, Dimensions::new_2d(4096, 4096)).is_err());
        assert!(check(TextureType::Tex3D, one, Dimensions::new(64, 64, 257)).is_err());
        assert!(check(TextureType::Tex3D, four, Dimensions::new(4, 4, 4)).is_err());
    }

    #[test]
    fn test_layout_access_masks() {
        assert!(layout_access_mask(vk::ImageLayout::UNDEFINED).is_empty());
        assert_eq!(
            layout_access_mask(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            layout_access_mask(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );
    }

    #[test]
    fn test_sampler_anisotropy_clamped() {
        let desc = SamplerDesc {
            max_anisotropy: Some(16.0),
            ..Default::default()
        };
        let info = sampler_create_info(&desc, Some(8.0));
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert!((info.max_anisotropy - 8.0).abs() < f32::EPSILON);

        let info = sampler_create_info(&desc, None);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn test_blit_offsets_clamp_to_one() {
        let extent = vk::Extent3D { width: 8, height: 2, depth: 1 };
        assert_eq!(mip_extent_offset(extent, 2), vk::Offset3D { x: 2, y: 1, z: 1 });
    }
}
