//! Interval compression and leak scoring, run on every report tick.

use crate::clock::Secs;
use crate::engine::Engine;
use crate::interval::{self, Interval};

/// Compress every backtrace's interval list and recompute its score.
///
/// Walking newest to oldest, the pass keeps a (class, run length)
/// counter over the interval durations. The third interval of a class,
/// or a class drop that breaks the merge order, triggers combining the
/// current interval with its newer neighbour. The surviving sequence of
/// classes is weakly increasing, which bounds the list at O(log T) over
/// any recorded horizon T.
///
/// The score walk doubles the accumulator whenever it crosses into a
/// wider class and then adds the interval's live count, so a survivor
/// in an old, wide interval weighs far more than one in a narrow recent
/// interval. Open intervals do not contribute.
pub fn combine_and_score(engine: &mut Engine) {
    unsafe {
        let mut entry = engine.first_entry;
        while !entry.is_null() {
            let mut iv = (*entry).intervals;
            let mut combine_count = 0usize;
            let mut combine_class: Secs = 0;
            let mut last_class: Secs = Secs::MAX;
            let mut value_n: f64 = 0.0;
            while !iv.is_null() {
                let mut class = interval::class_of((*iv).end - (*iv).start);
                if class > combine_class {
                    combine_class = class;
                    combine_count = 1;
                } else {
                    combine_count += 1;
                    if combine_count == 3 || class < combine_class {
                        if (*(*iv).prev).start == (*iv).end {
                            interval::combine(entry, iv);
                        } else {
                            close_gap(iv, class);
                        }
                        class = interval::class_of((*iv).end - (*iv).start);
                        combine_class = class;
                        combine_count = 1;
                    }
                }
                if (*iv).end != 0 {
                    if last_class < class {
                        value_n *= 2.0;
                    }
                    value_n += (*iv).n as f64;
                }
                last_class = class;
                iv = (*iv).next;
            }
            (*entry).value_n = value_n;
            entry = (*entry).next;
        }
    }
}

/// A hole separates `iv` from its newer neighbour. Grow `iv` forward by
/// one class width, clamped at the neighbour's start; if the leftover
/// hole is of a strictly smaller class, hand it to the neighbour.
unsafe fn close_gap(iv: *mut Interval, class: Secs) {
    unsafe {
        let newer = (*iv).prev;
        let grown_end = (*iv).end + class;
        (*iv).end = (*newer).start;
        if grown_end < (*newer).start {
            (*iv).end = grown_end;
            if interval::class_of((*newer).start - (*iv).end) < class {
                (*newer).start = (*iv).end;
            }
        }
    }
}
