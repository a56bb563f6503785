//! DMA-heap allocation and DMA-buf CPU access synchronisation.

use super::{iow, iowr};

#[repr(C)]
#[derive(Debug, Default)]
pub struct HeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct BufSync {
    pub flags: u64,
}

pub const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = iowr::<HeapAllocationData>(b'H', 0);
pub const DMA_BUF_IOCTL_SYNC: libc::c_ulong = iow::<BufSync>(b'b', 0);

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;
