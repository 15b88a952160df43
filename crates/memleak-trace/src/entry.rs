//! Canonical record for one distinct call stack.

use crate::bootstrap;
use crate::header::Header;
use crate::interval::Interval;
use std::ffi::c_void;

/// Maximum number of frames kept per backtrace.
pub const BACKTRACE_DEPTH_MAX: usize = 40;

/// One entry per distinct backtrace, created on first sighting and never
/// destroyed. The entry owns the sentinel of its circular live list and
/// the interval list; live headers are only borrowed for the duration of
/// their liveness.
#[repr(C)]
pub struct BacktraceEntry {
    /// Captured instruction pointers; only `depth` of them are valid.
    pub pcs: [*mut c_void; BACKTRACE_DEPTH_MAX],
    pub depth: usize,
    /// Number of currently live allocations with this backtrace.
    pub allocations: usize,
    /// Stable small id, assigned in interning order starting at 1.
    pub id: u32,
    /// Selected by the last report; should reach the dump file.
    pub need_printing: bool,
    /// Already appended to the dump file.
    pub printed: bool,
    /// Next entry in creation order (newest first).
    pub next: *mut BacktraceEntry,
    /// Next entry in the same hash chain.
    pub hash_next: *mut BacktraceEntry,
    /// Next entry in rank order (descending `value_n` after a sort).
    pub next_ranked: *mut BacktraceEntry,
    /// Leak score computed by the last ranking pass.
    pub value_n: f64,
    /// Open interval currently receiving allocations, if any.
    pub recording: *mut Interval,
    /// Newest-first list of intervals.
    pub intervals: *mut Interval,
    /// Sentinel of the circular live list; `head.next` is the newest
    /// live allocation, `head.prev` the oldest.
    pub head: Header,
}

impl BacktraceEntry {
    /// Allocate a zeroed entry with the underlying allocator (never the
    /// shim) and initialise its frames and sentinel.
    pub unsafe fn alloc(pcs: &[*mut c_void]) -> *mut BacktraceEntry {
        unsafe {
            let bp =
                bootstrap::raw_calloc(1, size_of::<BacktraceEntry>()) as *mut BacktraceEntry;
            if bp.is_null() {
                bootstrap::fatal("memleak: out of memory interning a backtrace\n");
            }
            (&mut (*bp).pcs)[..pcs.len()].copy_from_slice(pcs);
            (*bp).depth = pcs.len();
            let head = &raw mut (*bp).head;
            (*head).prev = head;
            (*head).next = head;
            bp
        }
    }

    /// The valid frames of this backtrace.
    pub fn frames(&self) -> &[*mut c_void] {
        &self.pcs[..self.depth]
    }

    /// Length-then-elementwise equality against a raw sample.
    pub fn matches(&self, pcs: &[*mut c_void]) -> bool {
        self.depth == pcs.len() && self.frames() == pcs
    }
}
