//! Report generation: the ranked stats text and the backtrace dump file.

use crate::clock::{self, Secs};
use crate::engine::{self, ReportGuard};
use crate::entry::BacktraceEntry;
use crate::interval::Interval;
use crate::rank;
use crate::sort;
use crate::symbols;
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Dump file with resolved backtraces, in the working directory.
pub const BACKTRACE_FILE: &str = "memleak_backtraces";

static DUMPED_BEFORE: AtomicBool = AtomicBool::new(false);

struct ReportLine {
    id: u32,
    value_n: f64,
    interval: Interval,
}

/// Produce one report: compress and score every backtrace, sort the
/// rank list, print the top interval lines, and append newly selected
/// backtraces to the dump file.
pub fn print_stats() {
    // Allocations made from here on are meta: never accounted, and safe
    // to make while the engine lock is held.
    let _guard = ReportGuard::enter();
    let now = clock::now();

    let mut engine = engine::lock();
    rank::combine_and_score(&mut engine);
    let total_memory = engine.total_memory;
    let allocations = engine.allocations;
    let backtraces = engine.backtraces;
    let max_backtraces = engine.max_backtraces;
    let old_first = engine.first_ranked;
    drop(engine);

    // Sort outside the lock; allocator threads may intern new entries
    // meanwhile, but they only prepend in front of `old_first`.
    let sorted = unsafe { sort::sort_ranked(old_first) };

    let mut engine = engine::lock();
    unsafe {
        // Splice the sorted chain back where the old head used to hang.
        let mut link: *mut *mut BacktraceEntry = &raw mut engine.first_ranked;
        while *link != old_first {
            link = &raw mut (**link).next_ranked;
        }
        *link = sorted;
    }

    // Snapshot the intervals worth printing from the top entries.
    let mut selected: Vec<ReportLine> = Vec::new();
    unsafe {
        let mut entry = engine.first_ranked;
        let mut count = 0;
        while !entry.is_null() && count < max_backtraces {
            let mut has_interval = false;
            let mut iv = (*entry).intervals;
            while !iv.is_null() {
                // Skip the not-so-interesting "leaks".
                if (*iv).n > 1 && (*iv).end != 0 {
                    selected.push(ReportLine {
                        id: (*entry).id,
                        value_n: (*entry).value_n,
                        interval: *iv,
                    });
                    has_interval = true;
                }
                iv = (*iv).next;
            }
            if has_interval {
                (*entry).need_printing = true;
                count += 1;
            }
            entry = (*entry).next_ranked;
        }
    }
    drop(engine);

    println!(
        "{}: Now: {}; \tBacktraces: {}; \tallocations: {}; \ttotal memory: {} bytes.",
        engine::app_name(),
        now,
        backtraces,
        allocations,
        group_digits(total_memory)
    );

    let mut oldest_interval_end: Secs = 10_000_000;
    for line in &selected {
        println!(
            " backtrace {} (value_n: {:6.2}); {}",
            line.id,
            line.value_n,
            format_interval(&line.interval)
        );
        if line.interval.end < oldest_interval_end {
            oldest_interval_end = line.interval.end;
        }
    }

    // Remember the bound for the `delete` command and collect the
    // entries that still need to reach the dump file.
    let mut engine = engine::lock();
    engine.oldest_interval_end = oldest_interval_end;
    let mut to_dump: Vec<(u32, Vec<*mut c_void>)> = Vec::new();
    unsafe {
        let mut entry = engine.first_entry;
        while !entry.is_null() {
            if (*entry).need_printing && !(*entry).printed {
                (*entry).printed = true;
                to_dump.push(((*entry).id, (*entry).frames().to_vec()));
            }
            entry = (*entry).next;
        }
    }
    drop(engine);

    if !to_dump.is_empty() {
        match append_backtraces(&to_dump) {
            Ok(()) => println!("memleak: Wrote {} new backtraces.", to_dump.len()),
            Err(e) => eprintln!("memleak: failed to write {}: {}", BACKTRACE_FILE, e),
        }
    }
}

fn append_backtraces(entries: &[(u32, Vec<*mut c_void>)]) -> crate::Result<()> {
    let first = !DUMPED_BEFORE.swap(true, Ordering::Relaxed);
    let mut file = if first {
        File::create(BACKTRACE_FILE)?
    } else {
        OpenOptions::new().append(true).open(BACKTRACE_FILE)?
    };
    if first {
        writeln!(file, "Application: \"{}\"", engine::exe_path())?;
    }
    let resolver = symbols::resolver();
    let mut resolver = match resolver.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    write_backtraces(&mut file, &mut resolver, entries)
}

/// Write `Backtrace N:` blocks, oldest entry first (the creation list
/// is newest-first), with a progress line every hundred entries.
fn write_backtraces(
    out: &mut dyn Write,
    resolver: &mut symbols::Resolver,
    entries: &[(u32, Vec<*mut c_void>)],
) -> crate::Result<()> {
    let total = entries.len();
    for (idx, (id, pcs)) in entries.iter().rev().enumerate() {
        let remaining = total - idx;
        if idx > 0 && remaining % 100 == 0 {
            println!(
                "{} backtraces to go ({:3.1} % cache hits)...",
                remaining,
                100.0 * resolver.cache_hit_ratio()
            );
        }
        writeln!(out, "Backtrace {}:", id)?;
        resolver.resolve_and_print(out, pcs)?;
    }
    Ok(())
}

/// One interval, formatted the way the stats report prints it.
fn format_interval(iv: &Interval) -> String {
    if iv.end == 0 {
        return format!(
            "[{:4},now: {:5} allocations ({:6} total), size {:7}",
            iv.start, iv.n, iv.total_n, iv.size
        );
    }
    let duration = iv.end - iv.start;
    format!(
        "[{:4},{:4}>({:4}): {:5} allocations ({:6} total, {:4.1}%), size {:7}; {:6.2} allocations/s, {} bytes/s",
        iv.start,
        iv.end,
        duration,
        iv.n,
        iv.total_n,
        100.0 * iv.n as f64 / iv.total_n as f64,
        iv.size,
        iv.n as f64 / duration as f64,
        iv.size as u64 / duration as u64
    )
}

/// Decimal digit grouping for the total-memory figure.
fn group_digits(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let lead = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn closed_interval(start: Secs, end: Secs, total_n: usize, n: usize, size: usize) -> Interval {
        Interval {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            start,
            end,
            total_n,
            n,
            size,
            first: ptr::null_mut(),
        }
    }

    #[test]
    fn groups_digits_in_threes() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1000), "1,000");
        assert_eq!(group_digits(1234567), "1,234,567");
        assert_eq!(group_digits(12345678), "12,345,678");
    }

    #[test]
    fn closed_interval_line_shape() {
        let iv = closed_interval(10, 20, 200, 50, 4096);
        let line = format_interval(&iv);
        assert_eq!(
            line,
            "[  10,  20>(  10):    50 allocations (   200 total, 25.0%), size    4096;   5.00 allocations/s, 409 bytes/s"
        );
    }

    #[test]
    fn open_interval_line_shape() {
        let iv = Interval {
            end: 0,
            ..closed_interval(7, 0, 3, 2, 64)
        };
        let line = format_interval(&iv);
        assert!(line.starts_with("[   7,now:"));
        assert!(line.contains("2 allocations"));
    }

    #[test]
    fn dump_format_matches_the_contract() {
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let path = dir.path().join("backtraces");
        let mut file = File::create(&path).unwrap();
        let mut resolver = symbols::Resolver::empty();
        let entries = vec![
            (2u32, vec![0x2000 as *mut c_void]),
            (1u32, vec![0x1000 as *mut c_void, 0x1008 as *mut c_void]),
        ];
        write_backtraces(&mut file, &mut resolver, &entries).unwrap();
        drop(file);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Oldest entry (the last in creation order) comes first.
        assert_eq!(lines[0], "Backtrace 1:");
        assert!(lines[1].starts_with(" #0  0000000000001000"));
        assert!(lines[2].starts_with(" #1  0000000000001008"));
        assert_eq!(lines[3], "Backtrace 2:");
        assert!(lines[4].starts_with(" #0  0000000000002000"));
    }
}
