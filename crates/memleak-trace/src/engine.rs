//! The accounting engine.
//!
//! One process-wide mutex protects the backtrace hash table, every
//! entry's live list and interval list, and the global counters. The
//! `add`/`del` critical sections are O(1) except for back-attribution,
//! which is bounded by the allocations of a single second. Entry and
//! interval objects are created with the underlying allocator directly,
//! so nothing inside the lock can re-enter the shim.

use crate::clock::{self, Secs};
use crate::entry::BacktraceEntry;
use crate::header::{Header, MAGIC_FREED, MAGIC_LIVE, MAGIC_META};
use crate::interval::{self, Interval};
use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock};

pub const HASH_SLOTS: usize = 1 << 20;
const HASH_MASK: usize = HASH_SLOTS - 1;

pub struct Engine {
    /// Hash chains of interned backtraces.
    table: [*mut BacktraceEntry; HASH_SLOTS],
    /// All entries, newest first.
    pub first_entry: *mut BacktraceEntry,
    /// All entries in rank order (descending score after a sort).
    pub first_ranked: *mut BacktraceEntry,
    pub total_memory: usize,
    pub allocations: usize,
    pub backtraces: usize,
    /// Oldest interval end seen in the last report; the bound used by
    /// the `delete` command.
    pub oldest_interval_end: Secs,
    pub recording: bool,
    /// Entries shown per report.
    pub max_backtraces: usize,
    /// Epoch of the current recording window; allocations in this
    /// second are back-attributed when a backtrace opens its interval.
    pub interval_start: Secs,
}

unsafe impl Send for Engine {}

static ENGINE: Mutex<Engine> = Mutex::new(Engine::new());

/// The engine lock. A poisoned lock is taken anyway: the allocator
/// surface must keep serving even if a panic unwound past it somewhere.
pub fn lock() -> MutexGuard<'static, Engine> {
    match ENGINE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

thread_local! {
    /// Marks allocations made by the reporting path itself; they are
    /// tagged meta and never accounted, which also makes them safe to
    /// perform while the engine lock is held.
    static INSIDE_REPORT: Cell<bool> = const { Cell::new(false) };
}

/// RAII flag for the reporting path.
pub struct ReportGuard {
    was: bool,
}

impl ReportGuard {
    pub fn enter() -> ReportGuard {
        let was = INSIDE_REPORT.get();
        INSIDE_REPORT.set(true);
        ReportGuard { was }
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        INSIDE_REPORT.set(self.was);
    }
}

impl Engine {
    const fn new() -> Engine {
        Engine {
            table: [ptr::null_mut(); HASH_SLOTS],
            first_entry: ptr::null_mut(),
            first_ranked: ptr::null_mut(),
            total_memory: 0,
            allocations: 0,
            backtraces: 0,
            oldest_interval_end: 0,
            recording: false,
            max_backtraces: 4,
            interval_start: 0,
        }
    }

    /// Canonicalise a raw stack sample into its shared entry, creating
    /// one on first sighting, and count the allocation against it.
    pub unsafe fn intern(&mut self, pcs: &[*mut c_void]) -> *mut BacktraceEntry {
        let mut hash = pcs.len();
        for &pc in pcs {
            hash = hash.wrapping_add(pc as usize);
        }
        let slot = (hash.wrapping_mul(hash) >> 8) & HASH_MASK;
        unsafe {
            let mut bp = self.table[slot];
            while !bp.is_null() && !(*bp).matches(pcs) {
                bp = (*bp).hash_next;
            }
            if bp.is_null() {
                bp = BacktraceEntry::alloc(pcs);
                (*bp).hash_next = self.table[slot];
                self.table[slot] = bp;
                (*bp).next = self.first_entry;
                (*bp).next_ranked = self.first_ranked;
                self.first_entry = bp;
                self.first_ranked = bp;
                self.backtraces += 1;
                (*bp).id = self.backtraces as u32;
            }
            (*bp).allocations += 1;
            bp
        }
    }

    /// Attribute a just-registered header to an interval.
    unsafe fn attach_interval(&mut self, header: *mut Header) {
        unsafe {
            let entry = (*header).entry;
            let mut iv = (*entry).recording;
            if self.recording && iv.is_null() {
                iv = interval::alloc();
                (*entry).recording = iv;
                interval::link(entry, iv);
                (*iv).start = self.interval_start;
                // Sweep up allocations already made in the second the
                // recording window opened.
                let head = &raw mut (*entry).head;
                let mut h = (*(*head).next).next;
                while h != head && (*h).time == self.interval_start {
                    h = (*h).next;
                }
                h = (*h).prev;
                while h != header {
                    interval::attach(iv, h);
                    h = (*h).prev;
                }
            }
            // After a restart the newest interval starts one second in
            // the future; an allocation stamped before that belongs to
            // an older interval.
            while !iv.is_null() && (*header).time < (*iv).start {
                iv = (*iv).next;
            }
            if !iv.is_null() && ((*iv).end == 0 || (*header).time < (*iv).end) {
                interval::attach(iv, header);
            } else if !iv.is_null() && self.recording {
                // Recording, but the newest interval has not started yet
                // and the one before it ended earlier: a one-second gap
                // opened because no allocation arrived for a while.
                debug_assert!((*iv).end != 0 && (*header).time >= (*iv).end);
                let iv = (*iv).prev;
                debug_assert!(!iv.is_null() && (*header).time < (*iv).start);
                debug_assert!((*iv).start - (*header).time == 1);
                (*iv).start = (*header).time;
                interval::attach(iv, header);
            }
        }
    }
}

/// Register a freshly allocated header under the sampled backtrace.
pub unsafe fn add(header: *mut Header, size: usize, pcs: &[*mut c_void], offset: usize) {
    unsafe { add_at(header, size, pcs, offset, clock::now()) }
}

pub unsafe fn add_at(
    header: *mut Header,
    size: usize,
    pcs: &[*mut c_void],
    offset: usize,
    now: Secs,
) {
    unsafe {
        if INSIDE_REPORT.get() {
            (*header).magic = MAGIC_META;
            (*header).memalign_offset = offset;
            return;
        }
        (*header).memalign_offset = offset;
        (*header).size = size;
        let mut engine = lock();
        let entry = engine.intern(pcs);
        (*header).entry = entry;
        (*header).prev = &raw mut (*entry).head;
        (*header).next = (*entry).head.next;
        (*(*header).prev).next = header;
        (*(*header).next).prev = header;
        engine.total_memory += size;
        engine.allocations += 1;
        (*header).interval = ptr::null_mut();
        (*header).time = now;
        (*header).magic = MAGIC_LIVE;
        engine.attach_interval(header);
    }
}

/// Put a header back after a failed realloc: the allocation survives,
/// still owned by its original backtrace entry.
pub unsafe fn add_existing(header: *mut Header) {
    unsafe { add_existing_at(header, clock::now()) }
}

pub unsafe fn add_existing_at(header: *mut Header, now: Secs) {
    unsafe {
        let mut engine = lock();
        let entry = (*header).entry;
        (*entry).allocations += 1;
        (*header).prev = &raw mut (*entry).head;
        (*header).next = (*entry).head.next;
        (*(*header).prev).next = header;
        (*(*header).next).prev = header;
        engine.total_memory += (*header).size;
        engine.allocations += 1;
        (*header).interval = ptr::null_mut();
        (*header).time = now;
        (*header).magic = MAGIC_LIVE;
        engine.attach_interval(header);
    }
}

/// Deregister a live header.
pub unsafe fn del(header: *mut Header) {
    unsafe {
        debug_assert_eq!((*header).magic, MAGIC_LIVE);
        let mut engine = lock();
        let iv = (*header).interval;
        (*header).interval = ptr::null_mut();
        if !iv.is_null() {
            debug_assert!(engine.recording || (*iv).end != 0);
            interval::detach(iv, header);
        }
        engine.total_memory -= (*header).size;
        engine.allocations -= 1;
        (*(*header).prev).next = (*header).next;
        (*(*header).next).prev = (*header).prev;
        let entry = (*header).entry;
        debug_assert!((*entry).allocations > 0);
        (*entry).allocations -= 1;
        (*header).magic = MAGIC_FREED;
    }
}

// ---------------------------------------------------------------------------
// Recording state transitions.

/// Erase all intervals and start recording a fresh window.
pub fn start_recording() {
    start_recording_at(clock::now());
    println!("*** START RECORDING ***");
}

pub fn start_recording_at(now: Secs) {
    delete_all_intervals_at(now);
    let mut engine = lock();
    engine.interval_start = now;
    engine.recording = true;
}

/// Close every open interval. Returns whether recording was active.
pub fn stop_recording() -> bool {
    let stopped = stop_recording_at(clock::now());
    if stopped {
        println!("*** STOP RECORDING ***");
    }
    stopped
}

pub fn stop_recording_at(now: Secs) -> bool {
    let end = now + 1;
    let mut engine = lock();
    if !engine.recording {
        return false;
    }
    unsafe {
        close_open_intervals(&mut engine, end);
    }
    engine.recording = false;
    true
}

/// Close the current window and open a new, non-overlapping one.
pub fn restart_recording() {
    let was_recording = lock().recording;
    restart_recording_at(clock::now());
    if was_recording {
        println!("*** RESTART RECORDING ***");
    } else {
        println!("*** START RECORDING ***");
    }
}

pub fn restart_recording_at(now: Secs) {
    {
        let mut engine = lock();
        if engine.recording {
            let end = now + 1;
            unsafe {
                close_open_intervals(&mut engine, end);
            }
            engine.interval_start = end;
            return;
        }
    }
    start_recording_at(now);
}

unsafe fn close_open_intervals(engine: &mut Engine, end: Secs) {
    unsafe {
        let mut entry = engine.first_entry;
        while !entry.is_null() {
            let iv = (*entry).recording;
            if !iv.is_null() {
                (*iv).end = end;
                if (*iv).n == 0 {
                    interval::unlink(entry, iv);
                    interval::dealloc(iv);
                }
                (*entry).recording = ptr::null_mut();
            }
            entry = (*entry).next;
        }
    }
}

/// Detach and free every interval of every backtrace.
pub fn delete_all_intervals_at(now: Secs) {
    stop_recording_at(now);
    let engine = lock();
    unsafe {
        let mut entry = engine.first_entry;
        while !entry.is_null() {
            let mut iv = (*entry).intervals;
            while !iv.is_null() {
                let next = (*iv).next;
                clear_members(iv);
                interval::unlink(entry, iv);
                interval::dealloc(iv);
                iv = next;
            }
            debug_assert!((*entry).recording.is_null());
            entry = (*entry).next;
        }
    }
    drop(engine);
}

/// Free every interval whose end is at or before `bound`, oldest first.
pub fn delete_intervals_upto(bound: Secs) {
    let engine = lock();
    unsafe {
        let mut entry = engine.first_entry;
        while !entry.is_null() {
            let mut iv = (*entry).intervals;
            if !iv.is_null() {
                while !(*iv).next.is_null() {
                    iv = (*iv).next;
                }
                while !iv.is_null() && (*iv).end <= bound {
                    let newer = (*iv).prev;
                    clear_members(iv);
                    interval::unlink(entry, iv);
                    if (*entry).recording == iv {
                        (*entry).recording = ptr::null_mut();
                    }
                    interval::dealloc(iv);
                    iv = newer;
                }
            }
            entry = (*entry).next;
        }
    }
    drop(engine);
}

unsafe fn clear_members(iv: *mut Interval) {
    unsafe {
        let mut h = (*iv).first;
        while !h.is_null() && (*h).interval == iv {
            (*h).interval = ptr::null_mut();
            h = (*h).prev;
        }
    }
}

// ---------------------------------------------------------------------------
// Process identity and one-time initialisation.

static EXE_PATH: OnceLock<String> = OnceLock::new();

/// Full path of the running executable (dump file header).
pub fn exe_path() -> &'static str {
    EXE_PATH.get_or_init(|| {
        std::fs::read_link("/proc/self/exe")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "??".to_string())
    })
}

/// Basename of the executable (report line prefix).
pub fn app_name() -> &'static str {
    let exe = exe_path();
    exe.rsplit('/').next().unwrap_or(exe)
}

/// Runs once, immediately after the underlying allocator is resolved:
/// start the clock, snapshot the loaded-object map, start the monitor
/// thread, and keep child processes from loading the tracer again.
pub fn on_bootstrap_complete() {
    clock::init();
    exe_path();
    crate::symbols::init();
    crate::monitor::spawn();
    unsafe { std::env::remove_var("LD_PRELOAD") };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks;
    use crate::rank;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_PC: AtomicUsize = AtomicUsize::new(0x6000_0000);

    /// A synthetic backtrace no other test shares.
    fn unique_pcs() -> [*mut c_void; 3] {
        let base = NEXT_PC.fetch_add(0x1000, Ordering::Relaxed);
        [
            base as *mut c_void,
            (base + 0x10) as *mut c_void,
            (base + 0x20) as *mut c_void,
        ]
    }

    fn alloc_header() -> *mut Header {
        Box::into_raw(Box::new(unsafe { std::mem::zeroed::<Header>() }))
    }

    unsafe fn free_header(h: *mut Header) {
        drop(unsafe { Box::from_raw(h) });
    }

    unsafe fn interval_count(entry: *mut BacktraceEntry) -> usize {
        let mut count = 0;
        let mut iv = unsafe { (*entry).intervals };
        while !iv.is_null() {
            count += 1;
            iv = unsafe { (*iv).next };
        }
        count
    }

    #[test]
    #[serial]
    fn add_del_round_trip_restores_counters() {
        let pcs = unique_pcs();
        let (memory_before, allocations_before) = {
            let engine = lock();
            (engine.total_memory, engine.allocations)
        };
        let h = alloc_header();
        unsafe {
            add_at(h, 100, &pcs, 0, 5);
            assert_eq!((*h).magic, MAGIC_LIVE);
            let entry = (*h).entry;
            assert_eq!((*entry).allocations, 1);
            assert!((*entry).id > 0);
            checks::check_entry(entry);
            del(h);
            assert_eq!((*h).magic, MAGIC_FREED);
            assert_eq!((*entry).allocations, 0);
            checks::check_entry(entry);
            free_header(h);
        }
        let engine = lock();
        assert_eq!(engine.total_memory, memory_before);
        assert_eq!(engine.allocations, allocations_before);
    }

    #[test]
    #[serial]
    fn live_list_is_newest_first() {
        let pcs = unique_pcs();
        let (h1, h2, h3) = (alloc_header(), alloc_header(), alloc_header());
        unsafe {
            add_at(h1, 8, &pcs, 0, 1);
            add_at(h2, 8, &pcs, 0, 2);
            add_at(h3, 8, &pcs, 0, 2);
            let entry = (*h1).entry;
            assert_eq!((*entry).head.next, h3);
            assert_eq!((*entry).head.prev, h1);
            checks::check_entry(entry);
            del(h3);
            del(h1);
            checks::check_entry(entry);
            del(h2);
            free_header(h1);
            free_header(h2);
            free_header(h3);
        }
    }

    #[test]
    #[serial]
    fn interning_dedupes_and_assigns_stable_ids() {
        let pcs = unique_pcs();
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            add_at(h1, 8, &pcs, 0, 1);
            add_at(h2, 8, &pcs, 0, 1);
            assert_eq!((*h1).entry, (*h2).entry);
            assert_eq!((*(*h1).entry).allocations, 2);
            let other = unique_pcs();
            let h3 = alloc_header();
            add_at(h3, 8, &other, 0, 1);
            assert_ne!((*h3).entry, (*h1).entry);
            assert!((*(*h3).entry).id > (*(*h1).entry).id);
            del(h1);
            del(h2);
            del(h3);
            free_header(h1);
            free_header(h2);
            free_header(h3);
        }
    }

    #[test]
    #[serial]
    fn empty_backtrace_registers_against_shared_entry() {
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            add_at(h1, 8, &[], 0, 1);
            add_at(h2, 8, &[], 0, 1);
            assert_eq!((*h1).entry, (*h2).entry);
            assert_eq!((*(*h1).entry).depth, 0);
            del(h1);
            del(h2);
            free_header(h1);
            free_header(h2);
        }
    }

    #[test]
    #[serial]
    fn meta_allocations_stay_out_of_the_accounts() {
        let pcs = unique_pcs();
        let (memory_before, backtraces_before) = {
            let engine = lock();
            (engine.total_memory, engine.backtraces)
        };
        let h = alloc_header();
        unsafe {
            let _guard = ReportGuard::enter();
            add_at(h, 4096, &pcs, 0, 1);
            assert_eq!((*h).magic, crate::header::MAGIC_META);
            assert!((*h).entry.is_null());
        }
        let engine = lock();
        assert_eq!(engine.total_memory, memory_before);
        assert_eq!(engine.backtraces, backtraces_before);
        drop(engine);
        unsafe { free_header(h) };
    }

    #[test]
    #[serial]
    fn recording_attributes_and_stop_closes() {
        let pcs = unique_pcs();
        start_recording_at(10);
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            add_at(h1, 16, &pcs, 0, 10);
            add_at(h2, 16, &pcs, 0, 12);
            let entry = (*h1).entry;
            assert!(!(*entry).recording.is_null());
            assert_eq!((*(*entry).recording).n, 2);
            assert!(stop_recording_at(12));
            assert!((*entry).recording.is_null());
            let iv = (*entry).intervals;
            assert_eq!(((*iv).start, (*iv).end), (10, 13));
            assert_eq!((*iv).total_n, 2);
            assert_eq!((*iv).size, 32);
            checks::check_entry(entry);
            checks::check_class_monotone(entry);
            del(h1);
            del(h2);
            free_header(h1);
            free_header(h2);
        }
        assert!(!stop_recording_at(13));
    }

    #[test]
    #[serial]
    fn same_second_allocations_are_back_attributed() {
        let pcs = unique_pcs();
        let (h1, h2, h3) = (alloc_header(), alloc_header(), alloc_header());
        unsafe {
            // Two allocations land in second 7, then recording starts
            // within that same second.
            add_at(h1, 8, &pcs, 0, 7);
            add_at(h2, 8, &pcs, 0, 7);
            start_recording_at(7);
            add_at(h3, 8, &pcs, 0, 7);
            let entry = (*h1).entry;
            let iv = (*entry).recording;
            assert!(!iv.is_null());
            assert_eq!((*iv).n, 3);
            assert_eq!((*iv).total_n, 3);
            assert_eq!((*iv).first, h1);
            assert_eq!((*h1).interval, iv);
            assert_eq!((*h2).interval, iv);
            checks::check_entry(entry);
            stop_recording_at(8);
            del(h1);
            del(h2);
            del(h3);
            free_header(h1);
            free_header(h2);
            free_header(h3);
        }
    }

    #[test]
    #[serial]
    fn restart_yields_disjoint_intervals() {
        let pcs = unique_pcs();
        let (h1, h2, h3) = (alloc_header(), alloc_header(), alloc_header());
        unsafe {
            start_recording_at(0);
            add_at(h1, 8, &pcs, 0, 0);
            restart_recording_at(2);
            add_at(h2, 8, &pcs, 0, 3);
            restart_recording_at(5);
            add_at(h3, 8, &pcs, 0, 6);
            let entry = (*h1).entry;
            assert_eq!(interval_count(entry), 3);
            let newest = (*entry).intervals;
            let mid = (*newest).next;
            let oldest = (*mid).next;
            assert_eq!(((*newest).start, (*newest).end), (6, 0));
            assert_eq!(((*mid).start, (*mid).end), (3, 6));
            assert_eq!(((*oldest).start, (*oldest).end), (0, 3));
            assert_ne!((*h1).interval, (*h2).interval);
            assert_ne!((*h2).interval, (*h3).interval);
            checks::check_entry(entry);
            checks::check_class_monotone(entry);
            stop_recording_at(7);
            del(h1);
            del(h2);
            del(h3);
            free_header(h1);
            free_header(h2);
            free_header(h3);
        }
    }

    #[test]
    #[serial]
    fn allocation_in_restart_second_lands_in_old_interval() {
        let pcs = unique_pcs();
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            start_recording_at(0);
            add_at(h1, 8, &pcs, 0, 1);
            // Restart during second 3: the old interval is closed at 4
            // and the new window starts at 4. An allocation still
            // stamped 3 belongs to the old interval.
            restart_recording_at(3);
            add_at(h2, 8, &pcs, 0, 3);
            let entry = (*h1).entry;
            assert_eq!((*h2).interval, (*h1).interval);
            let iv = (*h2).interval;
            assert_eq!(((*iv).start, (*iv).end), (0, 4));
            checks::check_entry(entry);
            stop_recording_at(4);
            del(h1);
            del(h2);
            free_header(h1);
            free_header(h2);
        }
    }

    #[test]
    #[serial]
    fn one_second_gap_extends_the_new_interval() {
        let pcs = unique_pcs();
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            start_recording_at(0);
            add_at(h1, 8, &pcs, 0, 0);
            restart_recording_at(3); // closes [0,4), next window starts at 4
            restart_recording_at(9); // idle window, nothing to close; next starts at 10
            add_at(h2, 8, &pcs, 0, 9);
            let entry = (*h1).entry;
            let newest = (*entry).intervals;
            // The open interval was created for second 10 and pulled
            // back to cover the gap second.
            assert_eq!(((*newest).start, (*newest).end), (9, 0));
            assert_eq!((*h2).interval, newest);
            let older = (*newest).next;
            assert_eq!(((*older).start, (*older).end), (0, 4));
            checks::check_entry(entry);
            stop_recording_at(10);
            del(h1);
            del(h2);
            free_header(h1);
            free_header(h2);
        }
    }

    #[test]
    #[serial]
    fn empty_closed_interval_is_retired() {
        let pcs = unique_pcs();
        let h = alloc_header();
        unsafe {
            start_recording_at(0);
            add_at(h, 8, &pcs, 0, 0);
            let entry = (*h).entry;
            stop_recording_at(2);
            assert_eq!(interval_count(entry), 1);
            del(h);
            assert_eq!(interval_count(entry), 0);
            assert!((*entry).intervals.is_null());
            checks::check_entry(entry);
            free_header(h);
        }
    }

    #[test]
    #[serial]
    fn start_erases_previous_intervals() {
        let pcs = unique_pcs();
        let h = alloc_header();
        unsafe {
            start_recording_at(0);
            add_at(h, 8, &pcs, 0, 0);
            let entry = (*h).entry;
            stop_recording_at(1);
            assert_eq!(interval_count(entry), 1);
            start_recording_at(5);
            assert_eq!(interval_count(entry), 0);
            assert!((*h).interval.is_null());
            checks::check_entry(entry);
            stop_recording_at(6);
            del(h);
            free_header(h);
        }
    }

    #[test]
    #[serial]
    fn delete_upto_frees_only_old_enough_intervals() {
        let pcs = unique_pcs();
        let (h1, h2) = (alloc_header(), alloc_header());
        unsafe {
            start_recording_at(0);
            add_at(h1, 8, &pcs, 0, 0);
            restart_recording_at(2); // closes [0,3)
            add_at(h2, 8, &pcs, 0, 3);
            stop_recording_at(7); // closes [3,8)
            let entry = (*h1).entry;
            assert_eq!(interval_count(entry), 2);
            delete_intervals_upto(4);
            assert_eq!(interval_count(entry), 1);
            assert!((*h1).interval.is_null());
            assert_eq!((*h2).interval, (*entry).intervals);
            checks::check_entry(entry);
            del(h1);
            del(h2);
            free_header(h1);
            free_header(h2);
        }
    }

    #[test]
    #[serial]
    fn failed_realloc_reregisters_under_original_backtrace() {
        let pcs = unique_pcs();
        let h = alloc_header();
        unsafe {
            add_at(h, 100, &pcs, 0, 1);
            let entry = (*h).entry;
            let id = (*entry).id;
            del(h);
            assert_eq!((*h).magic, MAGIC_FREED);
            add_existing_at(h, 2);
            assert_eq!((*h).magic, MAGIC_LIVE);
            assert_eq!((*h).entry, entry);
            assert_eq!((*h).size, 100);
            assert_eq!((*entry).id, id);
            assert_eq!((*entry).allocations, 1);
            assert_eq!((*entry).head.next, h);
            checks::check_entry(entry);
            del(h);
            free_header(h);
        }
    }

    #[test]
    #[serial]
    fn continuous_recording_compresses_to_a_log_fingerprint() {
        let pcs = unique_pcs();
        let mut headers = Vec::new();
        start_recording_at(0);
        for s in 0..64i64 {
            if s > 0 {
                restart_recording_at(s);
            }
            let h = alloc_header();
            unsafe { add_at(h, 16, &pcs, 0, s) };
            headers.push(h);
            let mut engine = lock();
            rank::combine_and_score(&mut engine);
        }
        stop_recording_at(64);
        let mut engine = lock();
        rank::combine_and_score(&mut engine);
        drop(engine);
        unsafe {
            let entry = (*headers[0]).entry;
            checks::check_entry(entry);
            checks::check_class_monotone(entry);
            assert_eq!((*entry).allocations, 64);
            let count = interval_count(entry);
            assert!(count <= 8, "expected a compressed list, got {count} intervals");
            let mut attributed = 0;
            let mut iv = (*entry).intervals;
            while !iv.is_null() {
                attributed += (*iv).n;
                iv = (*iv).next;
            }
            assert_eq!(attributed, 64);
        }
        // The headers stay live on purpose; they model a leak.
    }

    #[test]
    #[serial]
    fn old_wide_survivors_outrank_recent_churn() {
        let leak_pcs = unique_pcs();
        let fresh_pcs = unique_pcs();
        let mut retained = Vec::new();
        start_recording_at(0);
        for t in 0..4i64 {
            let h = alloc_header();
            unsafe { add_at(h, 32, &leak_pcs, 0, t) };
            retained.push(h);
        }
        restart_recording_at(10);
        for t in [11i64, 12] {
            let h = alloc_header();
            unsafe { add_at(h, 32, &fresh_pcs, 0, t) };
            retained.push(h);
        }
        stop_recording_at(13);
        let mut engine = lock();
        rank::combine_and_score(&mut engine);
        drop(engine);
        unsafe {
            let leaker = (*retained[0]).entry;
            let fresh = (*retained[4]).entry;
            assert!(
                (*leaker).value_n > (*fresh).value_n,
                "leak-like backtrace should outrank recent one ({} vs {})",
                (*leaker).value_n,
                (*fresh).value_n
            );
            for &h in &retained {
                del(h);
                free_header(h);
            }
        }
    }
}
