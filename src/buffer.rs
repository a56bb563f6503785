//! DMA buffer allocation.
//!
//! The allocator is responsible for:
//! - Opening the first usable heap from an ordered preference list
//! - Allocating fd-backed regions that capture hardware can write into
//! - Mapping regions for CPU access when the caller needs pixels
//! - Bracketing CPU access with DMA-buf sync so caches stay coherent
//!
//! Every fd and mapping has a single owner and is released on drop, so a
//! failure half-way through allocating a buffer set releases what was
//! already acquired.

use anyhow::{anyhow, bail, Context, Result};
use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;

use crate::sys::{self, dma};

/// Heaps tried in order when nothing else is configured.
pub const DEFAULT_HEAPS: [&str; 2] = ["/dev/dma_heap/vidbuf_cached", "/dev/dma_heap/linux,cma"];

/// Pseudo-heap backed by anonymous memory files. Same fd/mmap semantics as a
/// DMA heap, usable without capture hardware.
pub const MEMFD_HEAP: &str = "memfd://";

/// Allocator bound to one heap.
pub struct BufferAllocator {
    backend: AllocatorBackend,
}

enum AllocatorBackend {
    Heap { path: String, fd: OwnedFd },
    Memfd,
}

impl BufferAllocator {
    /// Open the first heap in `candidates` that can be opened.
    pub fn open<S: AsRef<str>>(candidates: &[S]) -> Result<Self> {
        let mut tried = Vec::new();
        for candidate in candidates {
            let candidate = candidate.as_ref();
            if candidate == MEMFD_HEAP {
                log::info!("BufferAllocator: using memfd pseudo-heap");
                return Ok(Self {
                    backend: AllocatorBackend::Memfd,
                });
            }
            match open_heap(Path::new(candidate)) {
                Ok(fd) => {
                    log::info!("BufferAllocator: using DMA heap {}", candidate);
                    return Ok(Self {
                        backend: AllocatorBackend::Heap {
                            path: candidate.to_string(),
                            fd,
                        },
                    });
                }
                Err(err) => {
                    log::debug!("BufferAllocator: {} unavailable: {}", candidate, err);
                    tried.push(candidate.to_string());
                }
            }
        }
        Err(anyhow!(
            "unable to open any DMA heap (tried: {})",
            tried.join(", ")
        ))
    }

    pub fn name(&self) -> &str {
        match &self.backend {
            AllocatorBackend::Heap { path, .. } => path,
            AllocatorBackend::Memfd => MEMFD_HEAP,
        }
    }

    /// Allocate one region of `len` bytes, mapping it when `mapped` is set.
    pub fn alloc(&self, name: &str, len: usize, mapped: bool) -> Result<DmaBuffer> {
        if len == 0 {
            bail!("cannot allocate an empty buffer ({})", name);
        }
        let (fd, syncable) = match &self.backend {
            AllocatorBackend::Heap { fd, .. } => (heap_alloc(fd.as_fd(), len)?, true),
            AllocatorBackend::Memfd => (memfd_alloc(name, len)?, false),
        };
        let mapping = if mapped {
            Some(Mapping::new(fd.as_fd(), len).with_context(|| format!("map buffer {}", name))?)
        } else {
            None
        };
        Ok(DmaBuffer {
            fd,
            len,
            mapping,
            syncable,
        })
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("heap", &self.name())
            .finish()
    }
}

fn open_heap(path: &Path) -> Result<OwnedFd> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(OwnedFd::from(file))
}

fn heap_alloc(heap: BorrowedFd<'_>, len: usize) -> Result<OwnedFd> {
    let mut data = dma::HeapAllocationData {
        len: len as u64,
        fd: 0,
        fd_flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
        heap_flags: 0,
    };
    // SAFETY: DMA_HEAP_IOCTL_ALLOC takes a dma_heap_allocation_data.
    unsafe { sys::ioctl(heap, dma::DMA_HEAP_IOCTL_ALLOC, &mut data) }
        .with_context(|| format!("DMA heap allocation of {} bytes", len))?;
    // SAFETY: the kernel returned a freshly allocated fd that we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(data.fd as i32) })
}

fn memfd_alloc(name: &str, len: usize) -> Result<OwnedFd> {
    let cname = CString::new(name).map_err(|_| anyhow!("buffer name contains NUL"))?;
    // SAFETY: cname is a valid C string for the duration of the call.
    let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error()).context("memfd_create");
    }
    // SAFETY: memfd_create returned a new fd that we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: fd is valid.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
        return Err(std::io::Error::last_os_error()).context("size memfd buffer");
    }
    Ok(fd)
}

// ----------------------------------------------------------------------------
// Buffers
// ----------------------------------------------------------------------------

/// An fd-backed region, optionally mapped for CPU access.
pub struct DmaBuffer {
    fd: OwnedFd,
    len: usize,
    mapping: Option<Mapping>,
    syncable: bool,
}

impl DmaBuffer {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Mapped contents.
    ///
    /// Only meaningful while the hardware is not writing into the buffer,
    /// i.e. between dequeue and requeue.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(Mapping::as_slice)
    }

    /// Begin CPU access; the matching sync end runs when the guard drops.
    pub fn begin_cpu_access(&self, write: bool) -> Result<CpuAccess<'_>> {
        let flags = if write {
            dma::DMA_BUF_SYNC_RW
        } else {
            dma::DMA_BUF_SYNC_READ
        };
        if self.syncable {
            self.sync(dma::DMA_BUF_SYNC_START | flags)?;
        }
        Ok(CpuAccess {
            buffer: self,
            flags,
        })
    }

    fn sync(&self, flags: u64) -> Result<()> {
        let mut sync = dma::BufSync { flags };
        // SAFETY: DMA_BUF_IOCTL_SYNC takes a dma_buf_sync.
        unsafe { sys::ioctl(self.fd.as_fd(), dma::DMA_BUF_IOCTL_SYNC, &mut sync) }
            .context("DMA_BUF_IOCTL_SYNC")?;
        Ok(())
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("fd", &self.fd.as_raw_fd())
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Scope of CPU access to a mapped buffer.
pub struct CpuAccess<'a> {
    buffer: &'a DmaBuffer,
    flags: u64,
}

impl<'a> CpuAccess<'a> {
    pub fn data(&self) -> Option<&'a [u8]> {
        self.buffer.as_slice()
    }

    /// Writable view, only for access begun with `write`.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        if self.flags & dma::DMA_BUF_SYNC_WRITE == 0 {
            return None;
        }
        let mapping = self.buffer.mapping.as_ref()?;
        // SAFETY: the guard is borrowed mutably for the lifetime of the slice
        // and the buffer is owned by the CPU between dequeue and requeue.
        Some(unsafe { mapping.as_mut_slice() })
    }
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        if self.buffer.syncable {
            if let Err(err) = self.buffer.sync(dma::DMA_BUF_SYNC_END | self.flags) {
                log::warn!("BufferAllocator: sync end failed: {}", err);
            }
        }
    }
}

/// A shared read-write mapping of an fd, unmapped on drop.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; access discipline is enforced by
// the capture request protocol, not by thread affinity.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        Self::map(fd, len, 0)
    }

    /// Map `len` bytes of `fd` starting at `offset`, e.g. a V4L2 MMAP buffer.
    pub(crate) fn map(fd: BorrowedFd<'_>, len: usize, offset: libc::off_t) -> Result<Self> {
        // SAFETY: mapping a valid fd with a length it was sized to.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("mmap");
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| anyhow!("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    ///
    /// No other view of the mapping may be live while the slice is.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Write `data` at `offset` through the fd, bypassing any mapping.
pub(crate) fn write_at(fd: BorrowedFd<'_>, offset: usize, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        // SAFETY: data[written..] is a valid readable region.
        let rc = unsafe {
            libc::pwrite(
                fd.as_raw_fd(),
                data[written..].as_ptr() as *const libc::c_void,
                data.len() - written,
                (offset + written) as libc::off_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("pwrite buffer");
        }
        written += rc as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_through_heap_list_in_order() -> Result<()> {
        let allocator = BufferAllocator::open(&["/nonexistent/dma_heap/a", MEMFD_HEAP])?;
        assert_eq!(allocator.name(), MEMFD_HEAP);
        Ok(())
    }

    #[test]
    fn exhausted_heap_list_is_an_error() {
        let err = BufferAllocator::open(&["/nonexistent/a", "/nonexistent/b"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/nonexistent/a"));
        assert!(msg.contains("/nonexistent/b"));
    }

    #[test]
    fn mapped_buffer_sees_fd_writes() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let buffer = allocator.alloc("test", 4096, true)?;
        write_at(buffer.fd(), 16, &[7, 8, 9])?;
        let access = buffer.begin_cpu_access(false)?;
        let data = access.data().expect("mapped");
        assert_eq!(&data[16..19], &[7, 8, 9]);
        assert_eq!(data.len(), 4096);
        Ok(())
    }

    #[test]
    fn unmapped_buffer_has_no_slice() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let buffer = allocator.alloc("raw", 1024, false)?;
        assert!(!buffer.is_mapped());
        assert!(buffer.as_slice().is_none());
        Ok(())
    }

    #[test]
    fn write_access_is_visible_to_later_readers() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let buffer = allocator.alloc("test", 4096, true)?;
        {
            let mut read_only = buffer.begin_cpu_access(false)?;
            assert!(read_only.data_mut().is_none());
        }
        {
            let mut access = buffer.begin_cpu_access(true)?;
            access.data_mut().expect("writable")[100] = 42;
        }
        let access = buffer.begin_cpu_access(false)?;
        assert_eq!(access.data().expect("mapped")[100], 42);
        Ok(())
    }
}
