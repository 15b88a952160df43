//! Seconds-since-start clock used to stamp allocations.
//!
//! Whole seconds are all the interval engine needs: timestamps may
//! repeat, and both registration and back-attribution handle repeats.

use std::sync::atomic::{AtomicI64, Ordering};

/// Whole seconds since process start.
pub type Secs = i64;

static APP_START: AtomicI64 = AtomicI64::new(0);

fn wall_secs() -> i64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    tv.tv_sec
}

/// Record the process start epoch. Called once when the shim finishes
/// its bootstrap.
pub fn init() {
    APP_START.store(wall_secs(), Ordering::Relaxed);
}

/// Whole seconds elapsed since `init`.
pub fn now() -> Secs {
    wall_secs() - APP_START.load(Ordering::Relaxed)
}
