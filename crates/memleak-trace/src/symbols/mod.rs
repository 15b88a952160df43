//! In-process symbol resolution for backtrace dumps.
//!
//! The loaded-object map is snapshotted from `/proc/self/maps` at
//! startup; per object, symbol tables and DWARF line ranges are parsed
//! lazily on the first address that lands in it. Resolved frames are
//! cached per address.

mod maps;
mod object_info;
mod resolver;

pub use maps::{MemoryMapping, MemoryMaps};
pub use object_info::{AddressRange, FuncSym, ObjectInfo};
pub use resolver::Resolver;

use std::sync::{Mutex, OnceLock};

static RESOLVER: OnceLock<Mutex<Resolver>> = OnceLock::new();

/// Snapshot the loaded-object map. Called once at bootstrap; later
/// calls are no-ops.
pub fn init() {
    resolver();
}

/// The global resolver, initialising it on first use.
pub fn resolver() -> &'static Mutex<Resolver> {
    RESOLVER.get_or_init(|| Mutex::new(Resolver::from_current_maps()))
}
