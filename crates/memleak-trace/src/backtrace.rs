//! Stack sampling for allocation attribution.

use crate::entry::BACKTRACE_DEPTH_MAX;
use std::cell::Cell;
use std::ffi::c_void;

thread_local! {
    static INSIDE_BACKTRACE: Cell<bool> = const { Cell::new(false) };
}

/// Capture the calling stack into `buf`, returning the frame count.
///
/// The sampler allocates on first use (glibc loads its unwinder
/// lazily), which re-enters the shim. Re-entered calls return depth 0
/// and such allocations land on the shared empty backtrace instead of
/// recursing.
pub fn sample(buf: &mut [*mut c_void; BACKTRACE_DEPTH_MAX]) -> usize {
    if INSIDE_BACKTRACE.get() {
        return 0;
    }
    INSIDE_BACKTRACE.set(true);
    let depth = unsafe { libc::backtrace(buf.as_mut_ptr(), BACKTRACE_DEPTH_MAX as i32) };
    INSIDE_BACKTRACE.set(false);
    depth.max(0) as usize
}
