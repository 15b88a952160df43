//! Structural invariant checker used by the engine tests.

use crate::entry::BacktraceEntry;
use crate::header::MAGIC_LIVE;
use crate::interval::class_of;

/// Walk one entry and assert every structural invariant: the live list
/// is circular and time-ordered, interval links are consistent, ranges
/// do not overlap, per-interval live counts match the headers that
/// reference them, and no closed interval silently covers an
/// unattributed live header.
pub unsafe fn check_entry(entry: *mut BacktraceEntry) {
    unsafe {
        let head = &raw mut (*entry).head;

        // Live list: circular, live magic, time monotone non-increasing
        // along `next` (newest to oldest).
        let mut count = 0;
        let mut last_time = i64::MAX;
        let mut h = (*head).next;
        while h != head {
            assert_eq!((*h).magic, MAGIC_LIVE);
            assert_eq!((*(*h).next).prev, h);
            assert_eq!((*(*h).prev).next, h);
            assert_eq!((*h).entry, entry);
            assert!((*h).time <= last_time, "live list out of time order");
            last_time = (*h).time;
            count += 1;
            h = (*h).next;
        }
        assert_eq!(count, (*entry).allocations);

        // Interval list: newest first, at most one open interval and
        // only at the head, ranges disjoint, links consistent.
        let mut iv = (*entry).intervals;
        assert!(iv.is_null() || (*iv).prev.is_null());
        if !(*entry).recording.is_null() {
            assert_eq!((*entry).recording, (*entry).intervals);
            assert_eq!((*(*entry).recording).end, 0);
        }
        let mut newer_start = i64::MAX;
        let mut open_seen = 0;
        let mut n_sum = 0;
        while !iv.is_null() {
            if (*iv).end == 0 {
                open_seen += 1;
                assert_eq!(iv, (*entry).intervals, "open interval not at head");
            } else {
                assert!((*iv).start < (*iv).end);
                assert!((*iv).end <= newer_start, "intervals overlap");
            }
            newer_start = (*iv).start;
            n_sum += (*iv).n;

            if (*iv).n == 0 {
                assert!((*iv).first.is_null());
            } else {
                assert!(!(*iv).first.is_null());
                assert_eq!((*(*iv).first).interval, iv);
                // `first` is the oldest member: the next-older header
                // belongs elsewhere.
                assert!(
                    (*(*iv).first).next == head || (*(*(*iv).first).next).interval != iv
                );
                let mut member = (*iv).first;
                let mut members = 0;
                while (*member).interval == iv {
                    assert!(
                        (*member).time >= (*iv).start
                            && ((*iv).end == 0 || (*member).time < (*iv).end)
                    );
                    members += 1;
                    member = (*member).prev;
                }
                assert_eq!(members, (*iv).n);
            }

            if !(*iv).next.is_null() {
                assert_eq!((*(*iv).next).prev, iv);
            }
            iv = (*iv).next;
        }
        assert!(open_seen <= 1);

        // The interval counts account for exactly the attributed
        // headers, and no closed interval covers the timestamp of a
        // live header that lost its attribution.
        let mut attributed = 0;
        h = (*head).next;
        while h != head {
            if !(*h).interval.is_null() {
                attributed += 1;
            } else {
                let mut iv = (*entry).intervals;
                while !iv.is_null() {
                    if (*iv).end != 0 {
                        assert!(
                            (*h).time < (*iv).start || (*h).time >= (*iv).end,
                            "unattributed live header inside a closed interval"
                        );
                    }
                    iv = (*iv).next;
                }
            }
            h = (*h).next;
        }
        assert_eq!(n_sum, attributed);
    }
}

/// Scanning newest to oldest, the classes of the closed intervals must
/// be weakly increasing.
pub unsafe fn check_class_monotone(entry: *mut BacktraceEntry) {
    unsafe {
        let mut last = 0;
        let mut iv = (*entry).intervals;
        while !iv.is_null() {
            if (*iv).end != 0 {
                let class = class_of((*iv).end - (*iv).start);
                assert!(class >= last, "class order broken: {class} after {last}");
                last = class;
            }
            iv = (*iv).next;
        }
    }
}
