// VMA backed GPU memory allocator
//
// Thin wrapper over vk-mem that hands out image and buffer
// suballocations by memory hint. One allocator is created per backend
// and shared (Arc) with every resource that needs to free itself.

use ash::vk;
use vk_mem::Alloc;

use crate::backend::Backend;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

/// How a resource's memory will be accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryHint {
    /// GPU only, fastest for sampling and attachments
    DeviceLocal,
    /// CPU writes in order (staging, streaming vertex data)
    HostVisible,
    /// CPU random access reads/writes
    HostCached,
}

impl MemoryHint {
    fn to_vma(&self) -> (vk_mem::MemoryUsage, vk_mem::AllocationCreateFlags) {
        match self {
            MemoryHint::DeviceLocal => (
                vk_mem::MemoryUsage::AutoPreferDevice,
                vk_mem::AllocationCreateFlags::empty(),
            ),
            MemoryHint::HostVisible => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryHint::HostCached => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ),
        }
    }
}

/// The VMA allocator for one device.
///
/// Buffers and textures each hold an Arc to this so the pool outlives
/// every allocation made from it. Shutdown happens when the last Arc
/// drops, after the owning context has idled the device.
pub struct Allocator {
    raw: vk_mem::Allocator,
}

impl Allocator {
    pub fn new(backend: &Backend) -> Result<Arc<Self>> {
        let info =
            vk_mem::AllocatorCreateInfo::new(backend.instance(), backend.device(), backend.physical_device());

        let raw = vk_mem::Allocator::new(info).or_else(|e| {
            log::error!("Failed to create the VMA allocator: {:?}", e);
            Err(StratusError::INIT_FAILED)
        })?;

        Ok(Arc::new(Self { raw: raw }))
    }

    /// Create a buffer backed by memory matching `hint`.
    pub(crate) fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo,
        hint: MemoryHint,
        persistent_map: bool,
    ) -> Result<(vk::Buffer, vk_mem::Allocation)> {
        let (usage, mut flags) = hint.to_vma();
        if persistent_map {
            flags |= vk_mem::AllocationCreateFlags::MAPPED;
        }
        let create_info = vk_mem::AllocationCreateInfo {
            usage: usage,
            flags: flags,
            ..Default::default()
        };

        unsafe {
            self.raw
                .create_buffer(info, &create_info)
                .or(Err(StratusError::OUT_OF_MEMORY))
        }
    }

    /// Create an image backed by memory matching `hint`.
    pub(crate) fn create_image(
        &self,
        info: &vk::ImageCreateInfo,
        hint: MemoryHint,
    ) -> Result<(vk::Image, vk_mem::Allocation)> {
        let (usage, flags) = hint.to_vma();
        let create_info = vk_mem::AllocationCreateInfo {
            usage: usage,
            flags: flags,
            ..Default::default()
        };

        unsafe {
            self.raw
                .create_image(info, &create_info)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))
        }
    }

    pub(crate) fn destroy_buffer(&self, buffer: vk::Buffer, allocation: &mut vk_mem::Allocation) {
        unsafe { self.raw.destroy_buffer(buffer, allocation) };
    }

    pub(crate) fn destroy_image(&self, image: vk::Image, allocation: &mut vk_mem::Allocation) {
        unsafe { self.raw.destroy_image(image, allocation) };
    }

    pub(crate) fn map_memory(&self, allocation: &mut vk_mem::Allocation) -> Result<*mut u8> {
        unsafe {
            self.raw
                .map_memory(allocation)
                .or(Err(StratusError::OUT_OF_MEMORY))
        }
    }

    pub(crate) fn unmap_memory(&self, allocation: &mut vk_mem::Allocation) {
        unsafe { self.raw.unmap_memory(allocation) };
    }

    /// Flush a mapped range so the writes become visible to the GPU.
    /// Always required, the memory may not be host coherent.
    pub(crate) fn flush_allocation(
        &self,
        allocation: &vk_mem::Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        let _ = self.raw.flush_allocation(allocation, offset as _, size as _);
    }
}
