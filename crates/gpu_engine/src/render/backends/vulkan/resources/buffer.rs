//! Vulkan buffer with its own device memory allocation
//!
//! Host-visible buffers stay persistently mapped for their whole lifetime;
//! writes go straight through the mapping and are flushed when the memory
//! type is not coherent. Buffers created with `SHADER_DEVICE_ADDRESS` usage
//! cache their GPU address.

use ash::{vk, Device};
use std::ptr::NonNull;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// A buffer plus the state needed to use it correctly
pub struct VulkanBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    mapped_ptr: Option<NonNull<u8>>,
    device_address: vk::DeviceAddress,
    non_coherent_atom_size: vk::DeviceSize,
}

impl VulkanBuffer {
    /// Create and bind a buffer
    ///
    /// `LAZILY_ALLOCATED` requests fall back to plain device-local memory on
    /// devices without transient memory types.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        limits: &vk::PhysicalDeviceLimits,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        // Drop releases whatever has been created so far
        let mut result = Self {
            device,
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            usage,
            memory_flags,
            mapped_ptr: None,
            device_address: 0,
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
        };

        let mem_requirements = unsafe {
            result.device.get_buffer_memory_requirements(buffer)
        };

        let memory_type_index =
            find_memory_type(memory_properties, mem_requirements.memory_type_bits, memory_flags)
            .or_else(|_| {
                if memory_flags.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED) {
                    find_memory_type(
                        memory_properties,
                        mem_requirements.memory_type_bits,
                        vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    )
                } else {
                    Err(VulkanError::NoSuitableMemoryType)
                }
            })?;
        result.memory_flags =
            memory_properties.memory_types[memory_type_index as usize].property_flags;

        let wants_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        if wants_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        result.memory = unsafe {
            result.device.allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            result.device.bind_buffer_memory(buffer, result.memory, 0)
                .map_err(VulkanError::Api)?;
        }

        if result.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let ptr = unsafe {
                result.device.map_memory(
                    result.memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
                    .map_err(VulkanError::Api)?
            };
            result.mapped_ptr = NonNull::new(ptr.cast::<u8>());
        }

        if wants_address {
            let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            result.device_address =
                unsafe { result.device.get_buffer_device_address(&address_info) };
        }

        Ok(result)
    }

    /// Native buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory type actually chosen
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Persistently mapped
    pub fn is_mapped(&self) -> bool {
        self.mapped_ptr.is_some()
    }

    /// Host writes are visible without a flush
    pub fn is_coherent(&self) -> bool {
        self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Start of the mapping, null when not mapped
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped_ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// The whole mapping as bytes
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.mapped_ptr
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) })
    }

    /// GPU virtual address, 0 without `SHADER_DEVICE_ADDRESS` usage
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Copy `data` into the mapping at `offset`, flushing if needed
    ///
    /// # Panics
    ///
    /// The range must lie inside the buffer.
    pub fn buffer_sub_data(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let ptr = self.mapped_ptr.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Buffer is not host visible".to_string(),
        })?;
        assert!(
            offset + data.len() as vk::DeviceSize <= self.size,
            "Write past the end of the buffer"
        );

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        if !self.is_coherent() {
            self.flush_mapped_memory(offset, data.len() as vk::DeviceSize)?;
        }
        Ok(())
    }

    /// Copy from the mapping at `offset` into `out`, invalidating first if needed
    ///
    /// # Panics
    ///
    /// The range must lie inside the buffer.
    pub fn get_buffer_sub_data(&self, offset: vk::DeviceSize, out: &mut [u8]) -> VulkanResult<()> {
        let ptr = self.mapped_ptr.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Buffer is not host visible".to_string(),
        })?;
        assert!(
            offset + out.len() as vk::DeviceSize <= self.size,
            "Read past the end of the buffer"
        );

        if !self.is_coherent() {
            self.invalidate_mapped_memory(offset, out.len() as vk::DeviceSize)?;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Make host writes in the range visible to the device
    pub fn flush_mapped_memory(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        let range = self.atom_aligned_range(offset, size);
        unsafe {
            self.device.flush_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Make device writes in the range visible to the host
    pub fn invalidate_mapped_memory(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        let range = self.atom_aligned_range(offset, size);
        unsafe {
            self.device.invalidate_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    fn atom_aligned_range(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> vk::MappedMemoryRange {
        let (offset, size) = atom_aligned(offset, size, self.size, self.non_coherent_atom_size);
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build()
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped_ptr.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Expand `[offset, offset + size)` to `atom` boundaries
/// Ranges reaching the end become `WHOLE_SIZE`
fn atom_aligned(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = offset - offset % atom;
    let end = offset.saturating_add(size);
    if size == vk::WHOLE_SIZE || end >= buffer_size {
        return (start, vk::WHOLE_SIZE);
    }
    let end = end.div_ceil(atom) * atom;
    (start, end - start)
}

/// Index of the first memory type allowed by `type_filter` that has all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize].property_flags.contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_find_memory_type() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL).ok(),
            Some(0)
        );
        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE).ok(),
            Some(1)
        );
        // filtered out by the requirements mask
        assert!(find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
        assert!(matches!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_atom_alignment() {
        assert_eq!(atom_aligned(70, 10, 1024, 64), (64, 64));
        assert_eq!(atom_aligned(0, 64, 1024, 64), (0, 64));
        assert_eq!(atom_aligned(1000, 24, 1024, 64), (960, vk::WHOLE_SIZE));
        assert_eq!(atom_aligned(0, vk::WHOLE_SIZE, 1024, 64), (0, vk::WHOLE_SIZE));
    }
}
