// Typed GPU buffers
//
// Factory constructors cover the handful of buffer roles the backend
// needs: vertex, index, uniform, staging, and the per-frame streaming
// vertex arena. Device-local uploads go through a transient staging
// buffer and a one-shot copy; host-visible buffers are written through
// a persistent mapping and explicitly flushed.

use ash::vk;

use crate::allocator::{Allocator, MemoryHint};
use crate::context::Context;
use crate::deletion::DeletionQueue;
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

/// One interleaved vertex of the streaming format:
/// 16 bytes, position then texcoord, little endian IEEE-754.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vertex2D {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

impl Vertex2D {
    /// The single vertex binding used by every scene pipeline.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex2D>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex2D, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex2D, texcoord) as u32,
            },
        ]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Staging,
    Streaming,
}

/// A typed GPU buffer with VMA backed memory.
pub struct Buffer {
    allocator: Arc<Allocator>,
    deletion: Arc<DeletionQueue>,
    buffer: vk::Buffer,
    allocation: Option<vk_mem::Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    /// Persistent mapping, null when the buffer is device local
    mapped: *mut u8,
    /// Bump cursor for streaming buffers, reset each frame
    offset: vk::DeviceSize,
}

/// Guard that destroys the raw buffer once its frame fence retires.
struct DeferredBuffer {
    allocator: Arc<Allocator>,
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    mapped: bool,
}

impl Drop for DeferredBuffer {
    fn drop(&mut self) {
        if self.mapped {
            self.allocator.unmap_memory(&mut self.allocation);
        }
        self.allocator.destroy_buffer(self.buffer, &mut self.allocation);
    }
}

impl Buffer {
    fn create(
        allocator: Arc<Allocator>,
        deletion: Arc<DeletionQueue>,
        size: vk::DeviceSize,
        vk_usage: vk::BufferUsageFlags,
        hint: MemoryHint,
        usage: BufferUsage,
        persistent_map: bool,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, mut allocation) = allocator.create_buffer(&info, hint, persistent_map)?;

        let mapped = match persistent_map {
            true => allocator.map_memory(&mut allocation)?,
            false => std::ptr::null_mut(),
        };

        Ok(Buffer {
            allocator: allocator,
            deletion: deletion,
            buffer: buffer,
            allocation: Some(allocation),
            size: size,
            usage: usage,
            mapped: mapped,
            offset: 0,
        })
    }

    pub fn new_vertex(ctx: &Context, size: vk::DeviceSize, hint: MemoryHint) -> Result<Buffer> {
        Self::create(
            ctx.allocator(),
            ctx.deletion(),
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            hint,
            BufferUsage::Vertex,
            false,
        )
    }

    pub fn new_index(ctx: &Context, size: vk::DeviceSize, hint: MemoryHint) -> Result<Buffer> {
        Self::create(
            ctx.allocator(),
            ctx.deletion(),
            size,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            hint,
            BufferUsage::Index,
            false,
        )
    }

    /// Host-visible, persistently mapped uniform storage.
    pub fn new_uniform(ctx: &Context, size: vk::DeviceSize) -> Result<Buffer> {
        Self::create(
            ctx.allocator(),
            ctx.deletion(),
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryHint::HostVisible,
            BufferUsage::Uniform,
            true,
        )
    }

    pub fn new_staging(ctx: &Context, size: vk::DeviceSize) -> Result<Buffer> {
        Self::create(
            ctx.allocator(),
            ctx.deletion(),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryHint::HostVisible,
            BufferUsage::Staging,
            false,
        )
    }

    /// The per-frame streaming vertex arena. Persistently mapped and
    /// handed out through `allocate`.
    pub fn new_streaming(ctx: &Context, size: vk::DeviceSize) -> Result<Buffer> {
        Self::create(
            ctx.allocator(),
            ctx.deletion(),
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryHint::HostVisible,
            BufferUsage::Streaming,
            true,
        )
    }

    /// Standalone constructor for contexts that are still being built,
    /// everything else should go through the ctx-taking factories.
    pub(crate) fn new_streaming_raw(
        allocator: Arc<Allocator>,
        deletion: Arc<DeletionQueue>,
        size: vk::DeviceSize,
    ) -> Result<Buffer> {
        Self::create(
            allocator,
            deletion,
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryHint::HostVisible,
            BufferUsage::Streaming,
            true,
        )
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    /// Write `data` into the buffer at `offset`.
    ///
    /// Host-visible buffers are written through the mapping and
    /// flushed. Device-local destinations get a transient staging
    /// buffer and a single-time copy submission.
    pub fn upload(&mut self, ctx: &Context, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        if data.len() as vk::DeviceSize + offset > self.size {
            log::error!("Buffer upload of {} bytes exceeds buffer size", data.len());
            return Err(StratusError::OUT_OF_MEMORY);
        }

        if !self.mapped.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.mapped.add(offset as usize),
                    data.len(),
                );
            }
            self.flush(offset, data.len() as vk::DeviceSize);
            return Ok(());
        }

        // Device local destination: stage and copy
        let mut staging = Buffer::new_staging(ctx, data.len() as vk::DeviceSize)?;
        staging.write_mapped(data, 0)?;

        let cmd = ctx.begin_single_time_commands()?;
        let copy = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(offset)
            .size(data.len() as vk::DeviceSize)
            .build();
        unsafe {
            ctx.dev()
                .cmd_copy_buffer(cmd, staging.buffer, self.buffer, &[copy]);
        }
        ctx.end_single_time_commands(cmd)?;

        Ok(())
    }

    /// Map, write, flush, unmap. For staging buffers that are not
    /// persistently mapped.
    pub fn write_mapped(&mut self, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        if data.len() as vk::DeviceSize + offset > self.size {
            return Err(StratusError::OUT_OF_MEMORY);
        }

        let allocation = self.allocation.as_mut().ok_or(StratusError::INVALID)?;
        let ptr = match self.mapped.is_null() {
            true => self.allocator.map_memory(allocation)?,
            false => self.mapped,
        };

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        let allocation = self.allocation.as_ref().unwrap();
        self.allocator
            .flush_allocation(allocation, offset, data.len() as vk::DeviceSize);

        if self.mapped.is_null() {
            let allocation = self.allocation.as_mut().unwrap();
            self.allocator.unmap_memory(allocation);
        }
        Ok(())
    }

    /// Map the buffer for CPU writes. Persistent mappings are returned
    /// directly; everything else maps through the allocator and must
    /// be paired with `unmap`.
    pub fn map(&mut self) -> Result<*mut u8> {
        if !self.mapped.is_null() {
            return Ok(self.mapped);
        }
        let allocation = self.allocation.as_mut().ok_or(StratusError::INVALID)?;
        self.allocator.map_memory(allocation)
    }

    pub fn unmap(&mut self) {
        if self.mapped.is_null() {
            if let Some(allocation) = self.allocation.as_mut() {
                self.allocator.unmap_memory(allocation);
            }
        }
    }

    /// Flush a written range. Always explicit, the memory may not be
    /// host coherent.
    pub fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        if let Some(allocation) = self.allocation.as_ref() {
            self.allocator.flush_allocation(allocation, offset, size);
        }
    }

    /// Bump-allocate `size` bytes from the streaming arena.
    ///
    /// Returns the byte offset of the reservation and a write pointer,
    /// or None when the arena is exhausted; the caller must then
    /// discard whatever it wanted to draw this frame.
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<(vk::DeviceSize, *mut u8)> {
        if self.mapped.is_null() {
            return None;
        }

        let (start, next) = bump(self.offset, size, alignment, self.size)?;
        self.offset = next;

        Some((start, unsafe { self.mapped.add(start as usize) }))
    }

    /// Rewind the streaming arena. Called at frame start, after the
    /// frame's in-flight fence has been waited on.
    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

/// Aligned bump allocation within a fixed capacity.
fn bump(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    capacity: vk::DeviceSize,
) -> Option<(vk::DeviceSize, vk::DeviceSize)> {
    let aligned = (offset + alignment - 1) & !(alignment - 1);
    if aligned + size > capacity {
        return None;
    }
    Some((aligned, aligned + size))
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.deletion.schedule(Box::new(DeferredBuffer {
                allocator: self.allocator.clone(),
                buffer: self.buffer,
                allocation: allocation,
                mapped: !self.mapped.is_null(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex2d_matches_the_wire_layout() {
        assert_eq!(std::mem::size_of::<Vertex2D>(), 16);
        assert_eq!(Vertex2D::binding_description().stride, 16);

        let attrs = Vertex2D::attribute_descriptions();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 8);
        assert_eq!(attrs[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attrs[1].format, vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn bump_respects_alignment() {
        // cursor at 10, want 16-byte alignment
        let (start, next) = bump(10, 32, 16, 4096).unwrap();
        assert_eq!(start, 16);
        assert_eq!(next, 48);
    }

    #[test]
    fn bump_fails_when_exhausted() {
        assert!(bump(4090, 32, 16, 4096).is_none());
        // exactly at capacity still fits
        let (start, next) = bump(0, 4096, 16, 4096).unwrap();
        assert_eq!(start, 0);
        assert_eq!(next, 4096);
    }
}
