//! Per-allocation header prepended to every traced allocation.

use crate::clock::Secs;
use crate::entry::BacktraceEntry;
use crate::interval::Interval;
use std::ffi::c_void;

/// Magic word of a live, accounted allocation.
pub const MAGIC_LIVE: usize = 0x1234_fdb9_0102_acdc;
/// Magic word of an allocation made by the reporting path. Such
/// allocations get a header but never appear on any list.
pub const MAGIC_META: usize = 0x1212_9a9a_b91f_02a3;
/// Left behind by deregistration of a live header.
pub const MAGIC_FREED: usize = 0x1111_fbee;
/// Left behind by deregistration of a meta header.
pub const MAGIC_META_FREED: usize = 0xf3ee;

/// Metadata in front of the user payload.
///
/// Live headers of one backtrace form a circular doubly-linked list
/// through the entry's sentinel, newest at `sentinel.next`. Walking
/// `next` moves towards older allocations, walking `prev` towards newer
/// ones; `time` is monotone non-increasing along `next`.
#[repr(C)]
pub struct Header {
    /// Next-newer allocation with the same backtrace (or the sentinel).
    pub prev: *mut Header,
    /// Next-older allocation with the same backtrace (or the sentinel).
    pub next: *mut Header,
    /// Payload size in bytes, header excluded.
    pub size: usize,
    /// Allocation time in whole seconds since process start.
    pub time: Secs,
    /// Gap between the underlying pointer and the user pointer for
    /// aligned allocations; zero otherwise.
    pub memalign_offset: usize,
    /// Owning backtrace entry.
    pub entry: *mut BacktraceEntry,
    /// Interval this allocation was recorded into, if any.
    pub interval: *mut Interval,
    /// One of the `MAGIC_*` words.
    pub magic: usize,
}

/// Bytes reserved in front of the user pointer: `Header` rounded up to a
/// whole number of words, so the user pointer keeps word alignment.
pub const HEADER_OFFSET: usize =
    (size_of::<Header>() + size_of::<usize>() - 1) / size_of::<usize>() * size_of::<usize>();

/// Bytes reserved in front of the user pointer of an allocation that
/// must be aligned to `alignment`: the smallest multiple of `alignment`
/// that still fits the header.
pub const fn aligned_offset(alignment: usize) -> usize {
    HEADER_OFFSET.div_ceil(alignment) * alignment
}

impl Header {
    /// The header of a user pointer handed out by the shim.
    pub unsafe fn of_user_ptr(ptr: *mut c_void) -> *mut Header {
        unsafe { (ptr as *mut u8).sub(HEADER_OFFSET) as *mut Header }
    }

    /// The pointer that was obtained from the underlying allocator,
    /// reconstructed from a user pointer and this header's offset.
    pub unsafe fn underlying_ptr(&self, user: *mut c_void) -> *mut c_void {
        let off = if self.memalign_offset != 0 {
            self.memalign_offset
        } else {
            HEADER_OFFSET
        };
        unsafe { (user as *mut u8).sub(off) as *mut c_void }
    }
}
