//! Pixel storage backing for graphics buffers.
//!
//! All pixel memory is backed by `memfd_create` and mapped `MAP_SHARED`.
//! A memfd costs nothing over an anonymous mapping for in-process use and
//! keeps the door open for handing the fd to a compositor or GPU driver
//! that imports dma-buf-like memory.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Memory backing one graphics buffer.
///
/// # Safety
///
/// `PixelMemory` is `Send + Sync`: the mapping is valid for the lifetime
/// of the value, the fd is reference-counted by the kernel, and concurrent
/// pixel access is synchronized externally by the queue's ownership
/// protocol (at most one owner touches a buffer's pixels at a time).
pub struct PixelMemory {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    len: usize,
}

impl PixelMemory {
    /// Allocate pixel storage of `size` bytes.
    ///
    /// The `name` is visible in `/proc/self/fd/` which helps attribute
    /// graphics memory while debugging.
    ///
    /// # Errors
    ///
    /// Fails if `size` is 0 or if `memfd_create` / `ftruncate` / `mmap`
    /// fail (kernel resource exhaustion).
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        // MAP_SHARED so an exported fd refers to the same physical pages.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self { fd, ptr, len: size })
    }

    /// Size of the storage in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the storage is empty (never the case for a live buffer).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the start of the pixel data.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable pointer to the pixel data.
    ///
    /// Pixel writes are synchronized by buffer ownership: only the current
    /// owner of the enclosing slot may write.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The pixel data as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The backing fd, for export to a driver or compositor.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for PixelMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd closes when OwnedFd drops
    }
}

// SAFETY: see the type-level comment. The mapping lives as long as the
// value, the fd is kernel-refcounted, and pixel access is externally
// synchronized by slot ownership.
unsafe impl Send for PixelMemory {}
unsafe impl Sync for PixelMemory {}

impl std::fmt::Debug for PixelMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelMemory").field("len", &self.len).finish()
    }
}
