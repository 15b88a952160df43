//! Merge sort for the singly-linked rank list.

use crate::entry::BacktraceEntry;
use std::ptr;

/// Stable merge sort of the `next_ranked` chain, descending by
/// `value_n`. Returns the new head; the chain is re-linked in place.
pub unsafe fn sort_ranked(head: *mut BacktraceEntry) -> *mut BacktraceEntry {
    unsafe {
        if head.is_null() || (*head).next_ranked.is_null() {
            return head;
        }
        // Slow/fast split.
        let mut slow = head;
        let mut fast = (*head).next_ranked;
        while !fast.is_null() {
            fast = (*fast).next_ranked;
            if !fast.is_null() {
                fast = (*fast).next_ranked;
                slow = (*slow).next_ranked;
            }
        }
        let second = (*slow).next_ranked;
        (*slow).next_ranked = ptr::null_mut();
        let a = sort_ranked(head);
        let b = sort_ranked(second);
        merge(a, b)
    }
}

unsafe fn merge(mut a: *mut BacktraceEntry, mut b: *mut BacktraceEntry) -> *mut BacktraceEntry {
    unsafe {
        let mut head: *mut BacktraceEntry = ptr::null_mut();
        let mut tail: *mut BacktraceEntry = ptr::null_mut();
        while !a.is_null() && !b.is_null() {
            // `>=` keeps equal keys in first-half order: stability.
            let node = if (*a).value_n >= (*b).value_n {
                let node = a;
                a = (*a).next_ranked;
                node
            } else {
                let node = b;
                b = (*b).next_ranked;
                node
            };
            if head.is_null() {
                head = node;
            } else {
                (*tail).next_ranked = node;
            }
            tail = node;
        }
        let rest = if a.is_null() { b } else { a };
        if head.is_null() {
            return rest;
        }
        (*tail).next_ranked = rest;
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_chain(values: &[f64]) -> Vec<*mut BacktraceEntry> {
        let entries: Vec<*mut BacktraceEntry> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let mut e: BacktraceEntry = unsafe { std::mem::zeroed() };
                e.value_n = v;
                e.id = i as u32;
                Box::into_raw(Box::new(e))
            })
            .collect();
        for pair in entries.windows(2) {
            unsafe { (*pair[0]).next_ranked = pair[1] };
        }
        entries
    }

    fn collect(head: *mut BacktraceEntry) -> Vec<(u32, f64)> {
        let mut out = Vec::new();
        let mut node = head;
        while !node.is_null() {
            unsafe {
                out.push(((*node).id, (*node).value_n));
                node = (*node).next_ranked;
            }
        }
        out
    }

    fn destroy(entries: Vec<*mut BacktraceEntry>) {
        for e in entries {
            drop(unsafe { Box::from_raw(e) });
        }
    }

    #[test]
    fn sorts_descending() {
        let entries = build_chain(&[1.0, 7.0, 3.0, 0.0, 12.0]);
        let sorted = unsafe { sort_ranked(entries[0]) };
        let values: Vec<f64> = collect(sorted).iter().map(|&(_, v)| v).collect();
        assert_eq!(values, vec![12.0, 7.0, 3.0, 1.0, 0.0]);
        destroy(entries);
    }

    #[test]
    fn equal_keys_keep_list_order() {
        let entries = build_chain(&[2.0, 5.0, 2.0, 5.0, 2.0]);
        let sorted = unsafe { sort_ranked(entries[0]) };
        let order = collect(sorted);
        assert_eq!(
            order,
            vec![(1, 5.0), (3, 5.0), (0, 2.0), (2, 2.0), (4, 2.0)]
        );
        destroy(entries);
    }

    #[test]
    fn trivial_lists() {
        assert!(unsafe { sort_ranked(ptr::null_mut()) }.is_null());
        let single = build_chain(&[4.0]);
        assert_eq!(unsafe { sort_ranked(single[0]) }, single[0]);
        destroy(single);
    }
}
