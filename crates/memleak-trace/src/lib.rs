//! Leak-detecting allocation tracer.
//!
//! Loaded into a target process with `LD_PRELOAD`, this library replaces
//! the C allocator surface, attributes every live allocation to the call
//! stack that produced it, and groups live allocations by backtrace.
//! While recording, each backtrace accumulates a list of time intervals
//! that is repeatedly compressed into a logarithmic "age fingerprint";
//! backtraces whose old, wide intervals still hold live allocations rank
//! highest in the periodic report, because that age profile is what a
//! slow leak looks like.
//!
//! A monitor thread serves a newline protocol on a unix stream socket
//! (see the `memleak` client): start/stop/restart recording, tune the
//! report, dump resolved backtraces.
//!
//! ```text
//! LIBMEMLEAK_SOCKNAME=/tmp/memleak.sock \
//! LD_PRELOAD=target/release/libmemleak_trace.so ./leaky
//! ```

pub mod backtrace;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod header;
pub mod interval;
pub mod monitor;
pub mod rank;
pub mod report;
pub mod sort;
pub mod symbols;

// The interposed allocator itself. Left out of test builds so that the
// test binary keeps the system allocator and can drive the engine with
// synthetic headers instead.
#[cfg(not(test))]
pub mod hooks;

#[cfg(test)]
mod checks;

pub use error::{Error, Result};
