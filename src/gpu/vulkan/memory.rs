use ash::vk;
use vk_mem::Alloc;

use crate::gpu::driver::types::{AllocParams, AllocUsage, DeviceAllocation, MapAccess};
use crate::gpu::error::{GpuError, Result};

/// A `vk::Buffer` and the vk-mem allocation backing it.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) alloc: vk_mem::Allocation,
    pub(crate) size: u64,
    pub(crate) usage: AllocUsage,
    pub(crate) host_visible: bool,
    /// Range and access mode of the live mapping.
    pub(crate) mapped: Option<(u64, u64, MapAccess)>,
}

pub(crate) fn buffer_usage(usage: AllocUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(AllocUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(AllocUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(AllocUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(AllocUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    flags
}

/// Every declared slot is a storage buffer descriptor, which the buffer
/// must have been created for.
pub(crate) fn check_storage(alloc: DeviceAllocation, usage: AllocUsage) -> Result<()> {
    if usage.contains(AllocUsage::STORAGE) {
        Ok(())
    } else {
        Err(GpuError::UnsupportedUsage(format!(
            "{alloc} was allocated with {usage:?} and cannot back a storage binding"
        )))
    }
}

/// Create a buffer through vk-mem. Host-visible buffers prefer host memory
/// with random access so they can be mapped in place.
pub(crate) fn make_buffer(allocator: &vk_mem::Allocator, params: &AllocParams) -> Result<Buffer> {
    let mappable = params.is_host_visible();
    let create_info = vk_mem::AllocationCreateInfo {
        usage: if mappable {
            vk_mem::MemoryUsage::AutoPreferHost
        } else {
            vk_mem::MemoryUsage::Auto
        },
        flags: if mappable {
            vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
        } else {
            vk_mem::AllocationCreateFlags::empty()
        },
        ..Default::default()
    };

    let (raw, alloc) = unsafe {
        allocator.create_buffer(
            &vk::BufferCreateInfo::builder()
                .size(params.size)
                .usage(buffer_usage(params.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build(),
            &create_info,
        )?
    };

    Ok(Buffer {
        raw,
        alloc,
        size: params.size,
        usage: params.usage,
        host_visible: mappable,
        mapped: None,
    })
}

pub(crate) fn destroy_buffer(allocator: &vk_mem::Allocator, buf: &mut Buffer) {
    unsafe {
        if buf.mapped.take().is_some() {
            allocator.unmap_memory(&mut buf.alloc);
        }
        allocator.destroy_buffer(buf.raw, &mut buf.alloc);
    }
}
