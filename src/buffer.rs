//! Graphics buffers and their allocator.

use crate::error::{Error, Result};
use crate::format::{PixelFormat, Usage};
use crate::memory::PixelMemory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rows are padded to a multiple of this many pixels, matching common GPU
/// texture alignment requirements.
const STRIDE_ALIGN_PIXELS: u32 = 16;

/// Global counter for process-unique buffer IDs.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A graphics memory allocation: pixels plus the metadata needed to
/// sample or scan them out.
///
/// Buffers are shared as `Arc<GraphicBuffer>`; the process-unique [`id`]
/// lets the queue check whether a slot still refers to the same
/// allocation an old FIFO entry was built from.
///
/// [`id`]: GraphicBuffer::id
#[derive(Debug)]
pub struct GraphicBuffer {
    id: u64,
    width: u32,
    height: u32,
    /// Row pitch in pixels (>= width).
    stride: u32,
    format: PixelFormat,
    usage: Usage,
    memory: PixelMemory,
}

impl GraphicBuffer {
    /// Process-unique identity of this allocation.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row pitch in pixels.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Usage bits the buffer was allocated with.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The backing pixel storage.
    #[inline]
    pub fn memory(&self) -> &PixelMemory {
        &self.memory
    }

    /// Whether this buffer can serve a request for the given geometry.
    ///
    /// Width, height, and format must match exactly; the allocated usage
    /// must be a superset of the requested bits.
    pub fn satisfies(&self, width: u32, height: u32, format: PixelFormat, usage: Usage) -> bool {
        self.width == width
            && self.height == height
            && self.format == format
            && self.usage.contains(usage)
    }
}

/// Source of graphics buffer allocations.
///
/// The queue calls this with its mutex released: allocation can take tens
/// of milliseconds and must not stall the consumer.
pub trait GraphicBufferAllocator: Send + Sync {
    /// Allocate a buffer of the given geometry.
    fn create_graphic_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<Arc<GraphicBuffer>>;
}

/// Default allocator: memfd-backed CPU-visible pixel memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemfdGraphicAllocator;

impl GraphicBufferAllocator for MemfdGraphicAllocator {
    fn create_graphic_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<Arc<GraphicBuffer>> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "buffer dimensions must be nonzero: {}x{}",
                width, height
            )));
        }

        let stride = width.div_ceil(STRIDE_ALIGN_PIXELS) * STRIDE_ALIGN_PIXELS;
        let size = stride as usize * height as usize * format.bytes_per_pixel();
        let memory = PixelMemory::new(&format!("gralloc-{}x{}", width, height), size)?;

        tracing::trace!(width, height, ?format, %usage, stride, size, "allocated graphic buffer");

        Ok(Arc::new(GraphicBuffer {
            id: next_buffer_id(),
            width,
            height,
            stride,
            format,
            usage,
            memory,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_geometry() {
        let alloc = MemfdGraphicAllocator;
        let buffer = alloc
            .create_graphic_buffer(100, 50, PixelFormat::Rgba8888, Usage::GPU_TEXTURE)
            .unwrap();

        assert_eq!(buffer.width(), 100);
        assert_eq!(buffer.height(), 50);
        assert_eq!(buffer.stride(), 112); // 100 rounded up to 16-pixel alignment
        assert_eq!(buffer.memory().len(), 112 * 50 * 4);
    }

    #[test]
    fn test_ids_are_unique() {
        let alloc = MemfdGraphicAllocator;
        let a = alloc
            .create_graphic_buffer(8, 8, PixelFormat::Rgb565, Usage::NONE)
            .unwrap();
        let b = alloc
            .create_graphic_buffer(8, 8, PixelFormat::Rgb565, Usage::NONE)
            .unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_satisfies_usage_superset() {
        let alloc = MemfdGraphicAllocator;
        let buffer = alloc
            .create_graphic_buffer(
                64,
                64,
                PixelFormat::Rgba8888,
                Usage::CPU_WRITE | Usage::GPU_TEXTURE,
            )
            .unwrap();

        assert!(buffer.satisfies(64, 64, PixelFormat::Rgba8888, Usage::GPU_TEXTURE));
        assert!(!buffer.satisfies(64, 64, PixelFormat::Rgba8888, Usage::COMPOSER_OVERLAY));
        assert!(!buffer.satisfies(32, 64, PixelFormat::Rgba8888, Usage::GPU_TEXTURE));
        assert!(!buffer.satisfies(64, 64, PixelFormat::Rgb565, Usage::NONE));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let alloc = MemfdGraphicAllocator;
        assert!(alloc
            .create_graphic_buffer(0, 64, PixelFormat::Rgba8888, Usage::NONE)
            .is_err());
    }
}
