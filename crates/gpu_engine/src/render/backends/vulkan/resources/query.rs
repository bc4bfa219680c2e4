//! Timestamp query pools

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Pool of GPU timestamp queries with RAII cleanup
pub struct QueryPool {
    device: Device,
    pool: vk::QueryPool,
    count: u32,
}

impl QueryPool {
    /// Create a pool of `count` timestamp queries
    pub fn new(device: Device, count: u32) -> VulkanResult<Self> {
        if count == 0 {
            return Err(VulkanError::ArgumentOutOfRange(
                "Query pool needs at least one query".to_string(),
            ));
        }

        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);

        let pool = unsafe {
            device.create_query_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, pool, count })
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::QueryPool {
        self.pool
    }

    /// Number of queries
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Read `count` timestamps starting at `first`, blocking until they are available
    pub fn results(&self, first: u32, count: u32) -> VulkanResult<Vec<u64>> {
        if first.checked_add(count).map_or(true, |end| end > self.count) {
            return Err(VulkanError::ArgumentOutOfRange(format!(
                "Queries {first}..{} outside of a pool of {}",
                first.saturating_add(count),
                self.count
            )));
        }

        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                self.pool,
                first,
                count,
                &mut results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
            .map_err(VulkanError::Api)?;
        }
        Ok(results)
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_query_pool(self.pool, None);
        }
    }
}
