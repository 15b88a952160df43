//! The interposed C allocator surface.
//!
//! Every successful allocation gets a header prepended and is
//! registered with the engine; every free is deregistered. The
//! underlying provider is phase-dispatched through `bootstrap` so the
//! very first calls of the process work before the real allocator has
//! been located.

use crate::backtrace;
use crate::bootstrap;
use crate::engine;
use crate::entry::BACKTRACE_DEPTH_MAX;
use crate::header::{
    Header, HEADER_OFFSET, MAGIC_LIVE, MAGIC_META, MAGIC_META_FREED, aligned_offset,
};
use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::ptr;

thread_local! {
    /// Guards realloc's deregister/reregister window; the underlying
    /// reallocator must not come back through the public surface.
    static INSIDE_REALLOC: Cell<bool> = const { Cell::new(false) };
}

fn sample() -> ([*mut c_void; BACKTRACE_DEPTH_MAX], usize) {
    let mut buf = [ptr::null_mut(); BACKTRACE_DEPTH_MAX];
    let depth = backtrace::sample(&mut buf);
    (buf, depth)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    debug_assert!(!INSIDE_REALLOC.get());
    let Some(alloc_size) = size.checked_add(HEADER_OFFSET) else {
        return ptr::null_mut();
    };
    let raw = unsafe { bootstrap::raw_malloc(alloc_size) };
    if raw.is_null() {
        return ptr::null_mut();
    }
    let (buf, depth) = sample();
    unsafe {
        engine::add(raw as *mut Header, size, &buf[..depth], 0);
        (raw as *mut u8).add(HEADER_OFFSET) as *mut c_void
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    if nmemb == 0 || size == 0 {
        return ptr::null_mut();
    }
    let Some(total) = nmemb.checked_mul(size) else {
        return ptr::null_mut();
    };
    // Enough extra members to cover the header.
    let Some(alloc_nmemb) = nmemb.checked_add(HEADER_OFFSET.div_ceil(size)) else {
        return ptr::null_mut();
    };
    let raw = unsafe { bootstrap::raw_calloc(alloc_nmemb, size) };
    if raw.is_null() {
        return ptr::null_mut();
    }
    let (buf, depth) = sample();
    unsafe {
        engine::add(raw as *mut Header, total, &buf[..depth], 0);
        (raw as *mut u8).add(HEADER_OFFSET) as *mut c_void
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(old: *mut c_void, size: usize) -> *mut c_void {
    if old.is_null() {
        return unsafe { malloc(size) };
    }
    if size == 0 {
        unsafe { free(old) };
        return ptr::null_mut();
    }
    let old_header = unsafe { Header::of_user_ptr(old) };
    let was_meta = unsafe { (*old_header).magic == MAGIC_META };
    unsafe {
        if was_meta {
            (*old_header).magic = MAGIC_META_FREED;
        } else {
            engine::del(old_header);
        }
    }
    let new_size = size.saturating_add(HEADER_OFFSET);
    INSIDE_REALLOC.set(true);
    let raw = unsafe { bootstrap::raw_realloc(old_header as *mut c_void, new_size) };
    INSIDE_REALLOC.set(false);
    if raw.is_null() {
        // The underlying block is untouched on failure; make it
        // visible again before reporting the failure.
        unsafe {
            if was_meta {
                (*old_header).magic = MAGIC_META;
            } else {
                engine::add_existing(old_header);
            }
        }
        return ptr::null_mut();
    }
    let (buf, depth) = sample();
    unsafe {
        engine::add(raw as *mut Header, size, &buf[..depth], 0);
        (raw as *mut u8).add(HEADER_OFFSET) as *mut c_void
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    debug_assert!(!INSIDE_REALLOC.get());
    if ptr.is_null() {
        return;
    }
    let header = unsafe { Header::of_user_ptr(ptr) };
    unsafe {
        match (*header).magic {
            MAGIC_LIVE => {
                engine::del(header);
                bootstrap::raw_free((*header).underlying_ptr(ptr));
            }
            MAGIC_META => {
                (*header).magic = MAGIC_META_FREED;
                bootstrap::raw_free((*header).underlying_ptr(ptr));
            }
            _ => {
                // Not one of ours (or corrupted). Hand the pointer to
                // the underlying allocator untouched.
                #[cfg(debug_assertions)]
                bootstrap::fatal("memleak: free() of pointer with corrupt header magic\n");
                #[cfg(not(debug_assertions))]
                bootstrap::raw_free(ptr);
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if alignment < size_of::<usize>() || !alignment.is_power_of_two() {
        return libc::EINVAL;
    }
    if size == 0 {
        unsafe { *memptr = ptr::null_mut() };
        return 0;
    }
    let offset = aligned_offset(alignment);
    let Some(alloc_size) = size.checked_add(offset) else {
        return libc::ENOMEM;
    };
    let mut raw: *mut c_void = ptr::null_mut();
    let ret = unsafe { bootstrap::raw_posix_memalign(&mut raw, alignment, alloc_size) };
    if ret != 0 {
        return ret;
    }
    let (buf, depth) = sample();
    unsafe {
        let user = (raw as *mut u8).add(offset) as *mut c_void;
        let header = Header::of_user_ptr(user);
        engine::add(header, size, &buf[..depth], offset);
        *memptr = user;
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(boundary: usize, size: usize) -> *mut c_void {
    let size = if size == 0 { 1 } else { size };
    let boundary = if boundary < size_of::<usize>() {
        debug_assert!(boundary == 0 || boundary.is_power_of_two());
        size_of::<usize>()
    } else {
        boundary
    };
    let mut out: *mut c_void = ptr::null_mut();
    if unsafe { posix_memalign(&mut out, boundary, size) } != 0 {
        return ptr::null_mut();
    }
    out
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        return ptr::null_mut();
    }
    unsafe { memalign(alignment, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    unsafe { memalign(bootstrap::page_size(), size) }
}
