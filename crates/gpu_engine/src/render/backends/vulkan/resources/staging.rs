//! Staging ring for host to device transfers
//!
//! A single persistently mapped host-visible buffer is carved into regions
//! front to back. Each region is tagged with the submission that reads it
//! and becomes reusable once that submission retires. When the ring runs
//! dry the allocator stalls on the GPU instead of overwriting bytes that
//! are still in flight.

use std::collections::VecDeque;

use ash::{vk, Device};

use crate::render::api::format::Format;
use crate::render::backends::vulkan::resources::buffer::VulkanBuffer;
use crate::render::backends::vulkan::resources::texture::VulkanImage;
use crate::render::backends::vulkan::state::{
    transfer_write_buffer_barrier, ImmediateCommands, SubmissionTimeline, SubmitHandle,
};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Every region offset and size is a multiple of this
pub const STAGING_ALIGNMENT: u32 = 16;

/// A byte range of the ring and the submission reading it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionDesc {
    /// Byte offset into the ring
    pub offset: u32,
    /// Aligned size in bytes
    pub size: u32,
    /// Submission that must retire before the range is reused
    pub handle: SubmitHandle,
}

const fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Narrow a transfer size to what a ring region can address
fn staging_size(bytes: Option<u64>) -> VulkanResult<u32> {
    bytes
        .and_then(|bytes| u32::try_from(bytes).ok())
        .ok_or_else(|| VulkanError::ArgumentOutOfRange("Transfer is larger than 4 GiB".to_string()))
}

/// Stages to wait on before leaving `layout`
pub(crate) fn src_stage_for(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    if layout == vk::ImageLayout::UNDEFINED {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        vk::PipelineStageFlags::ALL_COMMANDS
    }
}

/// Region bookkeeping of the staging buffer, independent of the GPU
#[derive(Debug)]
pub struct StagingRing {
    size: u32,
    front: u32,
    free: u32,
    regions: VecDeque<MemoryRegionDesc>,
}

impl StagingRing {
    /// Empty ring of `size` bytes
    pub fn new(size: u32) -> Self {
        Self {
            size,
            front: 0,
            free: size,
            regions: VecDeque::new(),
        }
    }

    /// Total capacity
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes left between the front and the end of the ring
    pub fn free_capacity(&self) -> u32 {
        self.free
    }

    /// Next offset to carve from
    pub fn front(&self) -> u32 {
        self.front
    }

    /// Regions handed out and not yet reclaimed
    pub fn in_flight(&self) -> usize {
        self.regions.len()
    }

    /// Hand out a region for up to `size` bytes
    ///
    /// A retired region that is large enough is reused as is. Otherwise
    /// the region is carved at the front and may be smaller than asked
    /// for; callers that need the full size use [`Self::region_of_at_least`].
    pub fn next_free_offset<T: SubmissionTimeline + ?Sized>(
        &mut self,
        timeline: &mut T,
        size: u32,
    ) -> VulkanResult<MemoryRegionDesc> {
        let aligned = align_up(size, STAGING_ALIGNMENT);

        let reusable = self
            .regions
            .iter()
            .position(|region| region.size >= aligned && timeline.is_ready(region.handle, false));
        if let Some(index) = reusable {
            if let Some(region) = self.regions.remove(index) {
                return Ok(MemoryRegionDesc {
                    handle: SubmitHandle::default(),
                    ..region
                });
            }
        }

        if self.free == 0 {
            self.wait_and_reset(timeline)?;
        }

        let carved = aligned.min(self.free);
        let region = MemoryRegionDesc {
            offset: self.front,
            size: carved,
            handle: SubmitHandle::default(),
        };
        self.front = (self.front + carved) % self.size;
        self.free -= carved;

        Ok(region)
    }

    /// Hand out a region of at least `size` bytes, stalling if needed
    pub fn region_of_at_least<T: SubmissionTimeline + ?Sized>(
        &mut self,
        timeline: &mut T,
        size: u32,
    ) -> VulkanResult<MemoryRegionDesc> {
        if size > self.size {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Transfer of {size} bytes exceeds the staging buffer size {}",
                self.size
            )));
        }

        if size > self.free {
            self.wait_and_reset(timeline)?;
        }

        let region = self.next_free_offset(timeline, size)?;
        if region.size >= size {
            return Ok(region);
        }

        self.wait_and_reset(timeline)?;
        self.next_free_offset(timeline, size)
    }

    /// Remember that `region` is read by the submission `handle`
    pub fn track(&mut self, region: MemoryRegionDesc, handle: SubmitHandle) {
        self.regions.push_back(MemoryRegionDesc { handle, ..region });
    }

    /// Wait for every tracked region and start over from offset 0
    pub fn wait_and_reset<T: SubmissionTimeline + ?Sized>(
        &mut self,
        timeline: &mut T,
    ) -> VulkanResult<()> {
        for region in self.regions.drain(..) {
            timeline.wait(region.handle)?;
        }
        self.front = 0;
        self.free = self.size;
        Ok(())
    }
}

/// Staging buffer plus the ring that carves it
pub struct StagingDevice {
    device: Device,
    buffer: VulkanBuffer,
    ring: StagingRing,
}

impl StagingDevice {
    /// Allocate a persistently mapped staging buffer of `size` bytes
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        limits: &vk::PhysicalDeviceLimits,
        size: u32,
    ) -> VulkanResult<Self> {
        let buffer = VulkanBuffer::new(
            device.clone(),
            memory_properties,
            limits,
            vk::DeviceSize::from(size),
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        log::debug!("Created staging ring of {} KiB", size / 1024);

        Ok(Self {
            device,
            buffer,
            ring: StagingRing::new(size),
        })
    }

    /// Ring bookkeeping
    pub fn ring(&self) -> &StagingRing {
        &self.ring
    }

    /// Native staging buffer
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Copy `data` into `dst` at `dst_offset`
    ///
    /// Mapped destinations are written directly. Device-local ones receive
    /// the bytes in ring-sized chunks, one submission per chunk.
    pub fn buffer_sub_data(
        &mut self,
        immediate: &mut ImmediateCommands,
        dst: &VulkanBuffer,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) -> VulkanResult<()> {
        if dst.is_mapped() {
            return dst.buffer_sub_data(dst_offset, data);
        }

        let mut remaining = data;
        let mut offset = dst_offset;

        while !remaining.is_empty() {
            let request = remaining.len().min(self.ring.size() as usize) as u32;
            let region = self.ring.next_free_offset(immediate, request)?;
            let chunk_len = (region.size as usize).min(remaining.len());
            let (chunk, rest) = remaining.split_at(chunk_len);

            self.buffer.buffer_sub_data(vk::DeviceSize::from(region.offset), chunk)?;

            let cmd = immediate.acquire()?;
            let copy = vk::BufferCopy {
                src_offset: vk::DeviceSize::from(region.offset),
                dst_offset: offset,
                size: chunk_len as vk::DeviceSize,
            };
            unsafe {
                self.device.cmd_copy_buffer(cmd.raw(), self.buffer.handle(), dst.handle(), &[copy]);
            }
            transfer_write_buffer_barrier(
                &self.device,
                cmd.raw(),
                dst.handle(),
                dst.usage(),
                offset,
                chunk_len as vk::DeviceSize,
            );

            let handle = immediate.submit(cmd)?;
            self.ring.track(region, handle);

            remaining = rest;
            offset += chunk_len as vk::DeviceSize;
        }

        Ok(())
    }

    /// Upload a 2D region of `num_mips` mips and `num_layers` layers
    ///
    /// `data` holds the mips in order, each with its layers back to back.
    /// Leaves the image in its resting layout.
    pub fn image_data_2d(
        &mut self,
        immediate: &mut ImmediateCommands,
        image: &mut VulkanImage,
        region: vk::Rect2D,
        base_mip: u32,
        num_mips: u32,
        base_layer: u32,
        num_layers: u32,
        format: Format,
        data: &[u8],
    ) -> VulkanResult<()> {
        let layer_sizes = (0..num_mips)
            .map(|mip| {
                let size = format.bytes_per_layer(region.extent.width, region.extent.height, mip);
                staging_size(Some(size))
            })
            .collect::<VulkanResult<Vec<u32>>>()?;
        let storage_size = staging_size(layer_sizes.iter().try_fold(0u64, |total, &size| {
            u64::from(size)
                .checked_mul(u64::from(num_layers))
                .and_then(|bytes| total.checked_add(bytes))
        }))?;
        if data.len() < storage_size as usize {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Texture data is {} bytes, the region needs {storage_size}",
                data.len()
            )));
        }

        let staging = self.ring.region_of_at_least(immediate, storage_size)?;
        self.buffer.buffer_sub_data(
            vk::DeviceSize::from(staging.offset),
            &data[..storage_size as usize],
        )?;

        let mip0 = image.extent();
        let resting_layout = image.resting_layout();
        let aspect = image.aspect_flags();
        let copy_aspect = image.copy_aspect_flags();

        let cmd = immediate.acquire()?;
        // Mips and layers outside the region must not stay undefined
        image.initialize_layout(cmd.raw());
        let initial_layout = image.layout();
        let mut buffer_offset = staging.offset;

        for (mip, layer_size) in (0..num_mips).zip(layer_sizes) {
            let level = base_mip + mip;
            let level_width = (mip0.width >> level).max(1);
            let level_height = (mip0.height >> level).max(1);
            let copy_offset = vk::Offset3D {
                x: region.offset.x >> mip,
                y: region.offset.y >> mip,
                z: 0,
            };
            let copy_extent = vk::Extent3D {
                width: (region.extent.width >> mip).max(1),
                height: (region.extent.height >> mip).max(1),
                depth: 1,
            };
            let covers_level = copy_offset.x == 0
                && copy_offset.y == 0
                && copy_extent.width == level_width
                && copy_extent.height == level_height;
            // Partial updates must keep the texels around the region
            let old_layout = if covers_level {
                vk::ImageLayout::UNDEFINED
            } else {
                initial_layout
            };

            for layer in base_layer..base_layer + num_layers {
                let range = vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: layer,
                    layer_count: 1,
                };

                image.set_layout(old_layout);
                image.transition_layout(
                    cmd.raw(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_stage_for(old_layout),
                    vk::PipelineStageFlags::TRANSFER,
                    range,
                );

                let copy = vk::BufferImageCopy {
                    buffer_offset: vk::DeviceSize::from(buffer_offset),
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: copy_aspect,
                        mip_level: level,
                        base_array_layer: layer,
                        layer_count: 1,
                    },
                    image_offset: copy_offset,
                    image_extent: copy_extent,
                };
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cmd.raw(),
                        self.buffer.handle(),
                        image.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    );
                }

                image.transition_layout(
                    cmd.raw(),
                    resting_layout,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    range,
                );

                buffer_offset += layer_size;
            }
        }

        image.set_layout(resting_layout);
        let handle = immediate.submit(cmd)?;
        self.ring.track(staging, handle);

        Ok(())
    }

    /// Upload a box of a volume texture (mip 0)
    pub fn image_data_3d(
        &mut self,
        immediate: &mut ImmediateCommands,
        image: &mut VulkanImage,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        format: Format,
        data: &[u8],
    ) -> VulkanResult<()> {
        let storage_size = staging_size(
            format
                .bytes_per_layer(extent.width, extent.height, 0)
                .checked_mul(u64::from(extent.depth)),
        )?;
        if data.len() < storage_size as usize {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Volume data is {} bytes, the region needs {storage_size}",
                data.len()
            )));
        }

        let staging = self.ring.region_of_at_least(immediate, storage_size)?;
        self.buffer.buffer_sub_data(
            vk::DeviceSize::from(staging.offset),
            &data[..storage_size as usize],
        )?;

        let cmd = immediate.acquire()?;
        image.initialize_layout(cmd.raw());

        let covers_level = offset == vk::Offset3D::default() && extent == image.extent();
        if covers_level {
            image.set_layout(vk::ImageLayout::UNDEFINED);
        }
        let resting_layout = image.resting_layout();
        let range = vk::ImageSubresourceRange {
            aspect_mask: image.aspect_flags(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        image.transition_layout(
            cmd.raw(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage_for(image.layout()),
            vk::PipelineStageFlags::TRANSFER,
            range,
        );

        let copy = vk::BufferImageCopy {
            buffer_offset: vk::DeviceSize::from(staging.offset),
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: image.copy_aspect_flags(),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: offset,
            image_extent: extent,
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd.raw(),
                self.buffer.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        image.transition_layout(
            cmd.raw(),
            resting_layout,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_COMMANDS,
            range,
        );

        let handle = immediate.submit(cmd)?;
        self.ring.track(staging, handle);

        Ok(())
    }

    /// Read a box of one mip and layer back into `out`
    ///
    /// Blocks until the copy has finished, then restores the image layout.
    pub fn image_data_download(
        &mut self,
        immediate: &mut ImmediateCommands,
        image: &mut VulkanImage,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        mip_level: u32,
        layer: u32,
        format: Format,
        out: &mut [u8],
    ) -> VulkanResult<()> {
        let storage_size = staging_size(
            format
                .bytes_per_layer(extent.width, extent.height, 0)
                .checked_mul(u64::from(extent.depth)),
        )?;
        if out.len() < storage_size as usize {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Output is {} bytes, the region needs {storage_size}",
                out.len()
            )));
        }

        let staging = self.ring.region_of_at_least(immediate, storage_size)?;
        let original_layout = image.layout();
        let range = vk::ImageSubresourceRange {
            aspect_mask: image.aspect_flags(),
            base_mip_level: mip_level,
            level_count: 1,
            base_array_layer: layer,
            layer_count: 1,
        };

        let cmd = immediate.acquire()?;
        image.transition_layout(
            cmd.raw(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::TRANSFER,
            range,
        );

        let copy = vk::BufferImageCopy {
            buffer_offset: vk::DeviceSize::from(staging.offset),
            buffer_row_length: 0,
            buffer_image_height: extent.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: image.copy_aspect_flags(),
                mip_level,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: offset,
            image_extent: extent,
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                cmd.raw(),
                image.handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.buffer.handle(),
                &[copy],
            );
        }

        let handle = immediate.submit(cmd)?;
        self.ring.track(staging, handle);
        self.ring.wait_and_reset(immediate)?;

        self.buffer.get_buffer_sub_data(
            vk::DeviceSize::from(staging.offset),
            &mut out[..storage_size as usize],
        )?;

        // UNDEFINED is not a valid target, settle in the resting layout instead
        let restore_layout = if original_layout == vk::ImageLayout::UNDEFINED {
            image.resting_layout()
        } else {
            original_layout
        };
        let cmd = immediate.acquire()?;
        image.transition_layout(
            cmd.raw(),
            restore_layout,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_COMMANDS,
            range,
        );
        let handle = immediate.submit(cmd)?;
        immediate.wait(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::vulkan::state::deferred::tests::ScriptedTimeline;

    fn overlaps(a: &MemoryRegionDesc, b: &MemoryRegionDesc) -> bool {
        a.offset < b.offset + b.size && b.offset < a.offset + a.size
    }

    #[test]
    fn test_regions_are_aligned_and_disjoint() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(1024);

        let a = ring.next_free_offset(&mut timeline, 10).unwrap();
        let b = ring.next_free_offset(&mut timeline, 100).unwrap();
        let c = ring.next_free_offset(&mut timeline, 16).unwrap();

        assert_eq!((a.offset, a.size), (0, 16));
        assert_eq!((b.offset, b.size), (16, 112));
        assert_eq!((c.offset, c.size), (128, 16));
        assert!(!overlaps(&a, &b) && !overlaps(&b, &c) && !overlaps(&a, &c));
        assert_eq!(ring.front() + ring.free_capacity(), ring.size());
    }

    #[test]
    fn test_request_clamped_to_remaining_space() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(256);

        let first = ring.next_free_offset(&mut timeline, 200).unwrap();
        let second = ring.next_free_offset(&mut timeline, 200).unwrap();

        assert_eq!(first.size, 208);
        assert_eq!((second.offset, second.size), (208, 48));
        assert_eq!(ring.front(), 0);
        assert_eq!(ring.free_capacity(), 0);
    }

    #[test]
    fn test_retired_region_is_reused_whole() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(1024);

        let region = ring.next_free_offset(&mut timeline, 256).unwrap();
        ring.track(region, SubmitHandle::new(0, 1));
        let pending = ring.next_free_offset(&mut timeline, 64).unwrap();
        ring.track(pending, SubmitHandle::new(1, 2));

        // nothing retired yet: carve fresh space
        let fresh = ring.next_free_offset(&mut timeline, 32).unwrap();
        assert_eq!(fresh.offset, 320);

        timeline.retire(1);
        let reused = ring.next_free_offset(&mut timeline, 32).unwrap();
        assert_eq!(reused.offset, 0);
        assert_eq!(reused.size, 256);
        assert!(reused.handle.is_empty());
        assert_eq!(ring.in_flight(), 1);
    }

    #[test]
    fn test_exhausted_ring_waits_then_restarts() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(64);

        let a = ring.next_free_offset(&mut timeline, 64).unwrap();
        ring.track(a, SubmitHandle::new(0, 7));
        assert_eq!(ring.free_capacity(), 0);

        let b = ring.next_free_offset(&mut timeline, 32).unwrap();
        assert_eq!(timeline.waited, vec![SubmitHandle::new(0, 7)]);
        assert_eq!((b.offset, b.size), (0, 32));
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn test_region_of_at_least_stalls_for_full_size() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(256);

        let a = ring.next_free_offset(&mut timeline, 192).unwrap();
        ring.track(a, SubmitHandle::new(0, 1));

        let b = ring.region_of_at_least(&mut timeline, 128).unwrap();
        assert_eq!(timeline.waited.len(), 1);
        assert_eq!((b.offset, b.size), (0, 128));
    }

    #[test]
    fn test_region_larger_than_ring_fails() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(256);

        assert!(matches!(
            ring.region_of_at_least(&mut timeline, 257),
            Err(VulkanError::ArgumentOutOfRange(_))
        ));
        assert!(timeline.waited.is_empty());
    }

    #[test]
    fn test_wait_and_reset_waits_every_region_in_order() {
        let mut timeline = ScriptedTimeline::default();
        let mut ring = StagingRing::new(1024);

        for id in 1..=3 {
            let region = ring.next_free_offset(&mut timeline, 16).unwrap();
            ring.track(region, SubmitHandle::new(id, id));
        }
        ring.wait_and_reset(&mut timeline).unwrap();

        let ids: Vec<u32> = timeline.waited.iter().map(|h| h.submit_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(ring.front(), 0);
        assert_eq!(ring.free_capacity(), 1024);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn test_staging_size_rejects_sizes_past_u32() {
        assert_eq!(staging_size(Some(4096)).unwrap(), 4096);
        // A full 1024^3 RGBA8 volume
        let volume = Format::Rgba8Unorm.bytes_per_layer(1024, 1024, 0).checked_mul(1024);
        assert!(matches!(staging_size(volume), Err(VulkanError::ArgumentOutOfRange(_))));
        assert!(matches!(staging_size(None), Err(VulkanError::ArgumentOutOfRange(_))));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }
}
