//! Allocator bootstrap.
//!
//! The shim must serve allocation requests before it has located the
//! underlying allocator, because locating it (`dlsym` with `RTLD_NEXT`)
//! itself allocates. Three phases, advancing monotonically:
//!
//! 0. uninitialised — the first allocation call starts resolution;
//! 1. resolving — allocations made during resolution come from a small
//!    fixed bump arena;
//! 2. steady — everything routes through the resolved allocator.
//!
//! Frees check the arena first until its last block is released.

use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;

const UNINITIALIZED: u8 = 0;
const RESOLVING: u8 = 1;
const STEADY: u8 = 2;

static PHASE: AtomicU8 = AtomicU8::new(UNINITIALIZED);

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);

/// All in-arena blocks have been released; frees can stop probing it.
static ARENA_DRAINED: AtomicBool = AtomicBool::new(false);

/// The four operations of the underlying allocator, resolved once at
/// bootstrap and injected everywhere else.
#[derive(Clone, Copy)]
pub struct SysAlloc {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
}

impl SysAlloc {
    /// The resolved underlying allocator, resolving it first if no
    /// allocation call has happened yet (unit tests and the monitor
    /// thread can get here before any interposed call).
    pub fn get() -> SysAlloc {
        if PHASE.load(Ordering::Acquire) != STEADY
            && PHASE
                .compare_exchange(UNINITIALIZED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            resolve();
        }
        while PHASE.load(Ordering::Acquire) != STEADY {
            std::hint::spin_loop();
        }
        unsafe {
            SysAlloc {
                malloc: std::mem::transmute::<usize, MallocFn>(
                    REAL_MALLOC.load(Ordering::Relaxed),
                ),
                calloc: std::mem::transmute::<usize, CallocFn>(
                    REAL_CALLOC.load(Ordering::Relaxed),
                ),
                realloc: std::mem::transmute::<usize, ReallocFn>(
                    REAL_REALLOC.load(Ordering::Relaxed),
                ),
                free: std::mem::transmute::<usize, FreeFn>(REAL_FREE.load(Ordering::Relaxed)),
            }
        }
    }
}

/// Write a diagnostic without allocating, then abort.
pub fn fatal(msg: &str) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr() as *const c_void, msg.len());
        libc::abort();
    }
}

fn resolved_posix_memalign() -> PosixMemalignFn {
    unsafe {
        std::mem::transmute::<usize, PosixMemalignFn>(REAL_POSIX_MEMALIGN.load(Ordering::Relaxed))
    }
}

fn dlsym_or_die(name: &'static std::ffi::CStr) -> usize {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        fatal("memleak: failed to resolve the underlying allocator\n");
    }
    sym as usize
}

/// Locate the underlying allocator. Any allocation issued while this
/// runs is served by the bump arena.
fn resolve() {
    REAL_MALLOC.store(dlsym_or_die(c"malloc"), Ordering::Relaxed);
    REAL_CALLOC.store(dlsym_or_die(c"calloc"), Ordering::Relaxed);
    REAL_REALLOC.store(dlsym_or_die(c"realloc"), Ordering::Relaxed);
    REAL_FREE.store(dlsym_or_die(c"free"), Ordering::Relaxed);
    REAL_POSIX_MEMALIGN.store(dlsym_or_die(c"posix_memalign"), Ordering::Relaxed);
    PHASE.store(STEADY, Ordering::Release);
    #[cfg(not(test))]
    crate::engine::on_bootstrap_complete();
}

/// Cached `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(value, Ordering::Relaxed);
    value
}

// ---------------------------------------------------------------------------
// Phase-dispatched raw operations. These hand out memory without headers;
// the hook layer prepends headers and registers with the engine.

pub unsafe fn raw_malloc(size: usize) -> *mut c_void {
    match PHASE.load(Ordering::Acquire) {
        STEADY => unsafe { (SysAlloc::get().malloc)(size) },
        _ => {
            if PHASE
                .compare_exchange(UNINITIALIZED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                resolve();
                unsafe { (SysAlloc::get().malloc)(size) }
            } else {
                ARENA.alloc(size, size_of::<usize>())
            }
        }
    }
}

pub unsafe fn raw_calloc(nmemb: usize, size: usize) -> *mut c_void {
    match PHASE.load(Ordering::Acquire) {
        STEADY => unsafe { (SysAlloc::get().calloc)(nmemb, size) },
        _ => {
            if PHASE
                .compare_exchange(UNINITIALIZED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                resolve();
                unsafe { (SysAlloc::get().calloc)(nmemb, size) }
            } else {
                ARENA.alloc_zeroed(nmemb.saturating_mul(size))
            }
        }
    }
}

pub unsafe fn raw_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if !ARENA_DRAINED.load(Ordering::Acquire) && ARENA.contains(ptr) {
        if PHASE.load(Ordering::Acquire) == STEADY {
            // Migrate the block out of the arena now that the real
            // allocator is available.
            let new = unsafe { (SysAlloc::get().malloc)(size) };
            if new.is_null() {
                return new;
            }
            if let Some(old_size) = ARENA.size_of(ptr) {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ptr as *const u8,
                        new as *mut u8,
                        old_size.min(size),
                    );
                }
            }
            unsafe { raw_free(ptr) };
            return new;
        }
        return ARENA.realloc(ptr, size);
    }
    match PHASE.load(Ordering::Acquire) {
        STEADY => unsafe { (SysAlloc::get().realloc)(ptr, size) },
        _ => {
            if PHASE
                .compare_exchange(UNINITIALIZED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                resolve();
                unsafe { (SysAlloc::get().realloc)(ptr, size) }
            } else {
                ARENA.realloc(ptr, size)
            }
        }
    }
}

pub unsafe fn raw_free(ptr: *mut c_void) {
    if !ARENA_DRAINED.load(Ordering::Acquire)
        && let Some(remaining) = ARENA.free(ptr)
    {
        if remaining == 0 && PHASE.load(Ordering::Acquire) == STEADY {
            ARENA_DRAINED.store(true, Ordering::Release);
        }
        return;
    }
    if PHASE.load(Ordering::Acquire) == STEADY {
        unsafe { (SysAlloc::get().free)(ptr) }
    }
    // A foreign pointer freed while the underlying allocator is still
    // being resolved has no owner we can reach; leak it.
}

pub unsafe fn raw_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    match PHASE.load(Ordering::Acquire) {
        STEADY => unsafe { (resolved_posix_memalign())(memptr, alignment, size) },
        _ => {
            if PHASE
                .compare_exchange(UNINITIALIZED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                resolve();
                unsafe { (resolved_posix_memalign())(memptr, alignment, size) }
            } else {
                unsafe { *memptr = ARENA.alloc(size, alignment) };
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bump arena.

const ARENA_RESERVE_BYTES: usize = 1024;
const ARENA_RESERVE_SLOTS: usize = 6;
const ARENA_BYTES: usize = 2048 + ARENA_RESERVE_BYTES;
const ARENA_SLOTS: usize = 8 + ARENA_RESERVE_SLOTS;

/// Mutable arena bookkeeping; only ever touched while the arena's
/// spinlock is held.
struct ArenaState {
    next: usize,
    ptrs: [usize; ARENA_SLOTS],
    sizes: [usize; ARENA_SLOTS],
    live: usize,
    reserve_spent: bool,
}

/// Fixed-capacity bump allocator covering the resolution window. A
/// reserve of bytes and slots is held back; the first allocation that
/// would cross into it relaxes the reserve to zero, leaving one last
/// chance to build a diagnostic before full exhaustion aborts.
///
/// Allocator calls arrive on every thread, so every read-compute-write
/// over the slot table runs under a spinlock; a mutex is off limits
/// this early in the process.
struct BumpArena {
    heap: UnsafeCell<[u8; ARENA_BYTES]>,
    locked: AtomicBool,
    state: UnsafeCell<ArenaState>,
}

unsafe impl Sync for BumpArena {}

static ARENA: BumpArena = BumpArena::new();

impl BumpArena {
    const fn new() -> BumpArena {
        BumpArena {
            heap: UnsafeCell::new([0; ARENA_BYTES]),
            locked: AtomicBool::new(false),
            state: UnsafeCell::new(ArenaState {
                next: 0,
                ptrs: [0; ARENA_SLOTS],
                sizes: [0; ARENA_SLOTS],
                live: 0,
                reserve_spent: false,
            }),
        }
    }

    fn base(&self) -> *mut u8 {
        self.heap.get() as *mut u8
    }

    fn contains(&self, ptr: *mut c_void) -> bool {
        let p = ptr as usize;
        let base = self.base() as usize;
        p >= base && p < base + ARENA_BYTES
    }

    /// Run `f` with the bookkeeping spinlocked.
    fn with_state<R>(&self, f: impl FnOnce(&mut ArenaState) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        // Safety: the spinlock makes this the only live reference.
        let result = f(unsafe { &mut *self.state.get() });
        self.locked.store(false, Ordering::Release);
        result
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.with_state(|state| state.live)
    }

    fn alloc(&self, size: usize, align: usize) -> *mut c_void {
        self.with_state(|state| self.alloc_in(state, size, align))
    }

    fn alloc_in(&self, state: &mut ArenaState, size: usize, align: usize) -> *mut c_void {
        let word = size_of::<usize>();
        let align = if align < word { word } else { align };
        let offset = state.next.next_multiple_of(align);
        let (byte_reserve, slot_reserve) = if state.reserve_spent {
            (0, 0)
        } else {
            (ARENA_RESERVE_BYTES, ARENA_RESERVE_SLOTS)
        };
        if state.live >= ARENA_SLOTS - slot_reserve
            || offset + size > ARENA_BYTES - byte_reserve
        {
            state.reserve_spent = true;
        }
        if state.live >= ARENA_SLOTS || offset + size > ARENA_BYTES {
            fatal("memleak: bootstrap arena exhausted before the underlying allocator was resolved\n");
        }
        let ptr = unsafe { self.base().add(offset) };
        state.ptrs[state.live] = ptr as usize;
        state.sizes[state.live] = size;
        state.live += 1;
        state.next = offset + size;
        ptr as *mut c_void
    }

    fn alloc_zeroed(&self, size: usize) -> *mut c_void {
        let ptr = self.alloc(size, size_of::<usize>());
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        ptr
    }

    fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        self.with_state(|state| {
            let old_size = Self::slot_of(state, ptr).map(|i| state.sizes[i]);
            let new = self.alloc_in(state, size, size_of::<usize>());
            if let Some(old_size) = old_size {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ptr as *const u8,
                        new as *mut u8,
                        old_size.min(size),
                    );
                }
            }
            Self::free_in(state, ptr);
            new
        })
    }

    fn size_of(&self, ptr: *mut c_void) -> Option<usize> {
        self.with_state(|state| Self::slot_of(state, ptr).map(|i| state.sizes[i]))
    }

    fn slot_of(state: &ArenaState, ptr: *mut c_void) -> Option<usize> {
        (0..state.live).find(|&i| state.ptrs[i] == ptr as usize)
    }

    fn free_in(state: &mut ArenaState, ptr: *mut c_void) -> Option<usize> {
        let slot = Self::slot_of(state, ptr)?;
        let last = state.live - 1;
        state.ptrs[slot] = state.ptrs[last];
        state.sizes[slot] = state.sizes[last];
        state.ptrs[last] = 0;
        state.live = last;
        Some(last)
    }

    /// Release an arena block; `None` for foreign pointers, otherwise
    /// the number of arena blocks still live.
    fn free(&self, ptr: *mut c_void) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        self.with_state(|state| Self::free_in(state, ptr))
    }
}
