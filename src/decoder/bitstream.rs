//! GPU-visible bitstream buffers.
//!
//! A bitstream buffer holds compressed picture data consumed by the
//! hardware decoder. Buffers are host-visible and persistently mapped so
//! the parser's bytes can be copied straight in before submission, and they
//! only ever grow - a buffer too small for a request is reallocated to the
//! larger size and keeps that capacity for the rest of its pool life.

use crate::decoder::pool::PoolNode;
use crate::decoder::session::with_video_profile;
use crate::decoder::VideoFormat;
use crate::error::{FrameForgeError, Result};
use crate::vulkan::VideoContext;
use ash::vk;
use std::sync::Mutex;
use tracing::debug;

struct BitstreamBufferInner {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    capacity: usize,
}

// The mapped pointer is only dereferenced while the mutex is held, and the
// backing memory is HOST_COHERENT.
unsafe impl Send for BitstreamBufferInner {}

/// A reusable GPU-visible buffer for compressed picture data.
///
/// Obtained from the decoder's bounded pool; shared between the pool and
/// whichever in-flight picture holds it, and recycled once the last
/// reference drops.
pub struct BitstreamBuffer {
    context: VideoContext,
    format: VideoFormat,
    inner: Mutex<BitstreamBufferInner>,
}

impl BitstreamBuffer {
    /// Create a buffer with at least `size` bytes of capacity, usable as a
    /// decode source for `format`'s profile.
    pub fn new(context: VideoContext, format: VideoFormat, size: usize) -> Result<Self> {
        let inner = Self::allocate(&context, &format, size)?;
        Ok(Self {
            context,
            format,
            inner: Mutex::new(inner),
        })
    }

    fn allocate(
        context: &VideoContext,
        format: &VideoFormat,
        size: usize,
    ) -> Result<BitstreamBufferInner> {
        let buffer = with_video_profile(format, |profile_info| -> Result<vk::Buffer> {
            let profiles = [*profile_info];
            let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);

            let mut create_info = vk::BufferCreateInfo::default()
                .size(size as vk::DeviceSize)
                .usage(vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            create_info.p_next = (&mut profile_list as *mut vk::VideoProfileListInfoKHR).cast();

            unsafe { context.device().create_buffer(&create_info, None) }
                .map_err(|e| FrameForgeError::ResourceCreation(format!("buffer creation: {}", e)))
        })?;

        let mem_requirements = unsafe { context.device().get_buffer_memory_requirements(buffer) };

        let memory_type_index = context
            .find_memory_type(
                mem_requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or_else(|| {
                FrameForgeError::MemoryAllocation(
                    "No suitable memory type for bitstream buffer".to_string(),
                )
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { context.device().allocate_memory(&alloc_info, None) }
            .map_err(|e| FrameForgeError::MemoryAllocation(e.to_string()))?;

        unsafe { context.device().bind_buffer_memory(buffer, memory, 0) }
            .map_err(|e| FrameForgeError::MemoryAllocation(e.to_string()))?;

        let mapped = unsafe {
            context.device().map_memory(
                memory,
                0,
                size as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(|e| {
            FrameForgeError::MemoryAllocation(format!("Failed to map bitstream buffer: {}", e))
        })? as *mut u8;

        Ok(BitstreamBufferInner {
            buffer,
            memory,
            mapped,
            capacity: size,
        })
    }

    fn destroy_inner(context: &VideoContext, inner: &mut BitstreamBufferInner) {
        unsafe {
            context.device().unmap_memory(inner.memory);
            context.device().destroy_buffer(inner.buffer, None);
            context.device().free_memory(inner.memory, None);
        }
    }

    /// The Vulkan buffer handle for decode command recording.
    pub fn buffer(&self) -> vk::Buffer {
        self.inner.lock().unwrap().buffer
    }

    /// Copy `data` into the mapped region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if offset + data.len() > inner.capacity {
            return Err(FrameForgeError::InvalidInput(format!(
                "Write of {} bytes at offset {} exceeds buffer capacity {}",
                data.len(),
                offset,
                inner.capacity
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), inner.mapped.add(offset), data.len());
        }
        Ok(())
    }
}

impl PoolNode for BitstreamBuffer {
    fn byte_capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    fn ensure_capacity(&self, min_size: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity >= min_size {
            return Ok(inner.capacity);
        }
        debug!(
            "Growing bitstream buffer from {} to {} bytes",
            inner.capacity, min_size
        );
        let mut new_inner = Self::allocate(&self.context, &self.format, min_size)?;
        std::mem::swap(&mut *inner, &mut new_inner);
        Self::destroy_inner(&self.context, &mut new_inner);
        Ok(inner.capacity)
    }
}

impl Drop for BitstreamBuffer {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        Self::destroy_inner(&self.context, &mut inner);
    }
}
