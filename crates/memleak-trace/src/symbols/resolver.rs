//! Frame resolution with a per-address cache.

use super::maps::MemoryMaps;
use super::object_info::ObjectInfo;
use crate::error::Result;
use std::collections::HashMap;
use std::ffi::c_void;
use std::io::Write;
use std::path::PathBuf;

enum LazyInfo {
    Unloaded,
    Failed,
    Loaded(Box<ObjectInfo>),
}

struct LoadedObject {
    path: PathBuf,
    start: u64,
    end: u64,
    load_base: u64,
    info: LazyInfo,
}

impl LoadedObject {
    fn ensure_loaded(&mut self) {
        if matches!(self.info, LazyInfo::Unloaded) {
            self.info = match ObjectInfo::parse(&self.path, self.load_base) {
                Ok(info) => LazyInfo::Loaded(Box::new(info)),
                Err(e) => {
                    eprintln!("memleak: {}", e);
                    LazyInfo::Failed
                }
            };
        }
    }

    fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub struct Resolver {
    objects: Vec<LoadedObject>,
    cache: HashMap<u64, String>,
    cache_total: u64,
    cache_hits: u64,
}

impl Resolver {
    /// Snapshot the code mappings of the current process.
    pub fn from_current_maps() -> Resolver {
        let mut objects = Vec::new();
        if let Ok(maps) = MemoryMaps::current() {
            for m in maps.resolvable_mappings() {
                objects.push(LoadedObject {
                    path: PathBuf::from(m.pathname.as_deref().unwrap_or_default()),
                    start: m.start,
                    end: m.end,
                    load_base: m.start - m.offset,
                    info: LazyInfo::Unloaded,
                });
            }
        }
        Resolver {
            objects,
            cache: HashMap::new(),
            cache_total: 0,
            cache_hits: 0,
        }
    }

    /// A resolver that knows no objects; every frame falls back to the
    /// raw form.
    pub fn empty() -> Resolver {
        Resolver {
            objects: Vec::new(),
            cache: HashMap::new(),
            cache_total: 0,
            cache_hits: 0,
        }
    }

    /// Resolve each frame and write one ` #n <addr> <description>`
    /// line per program counter.
    pub fn resolve_and_print(&mut self, out: &mut dyn Write, pcs: &[*mut c_void]) -> Result<()> {
        for (frame, &pc) in pcs.iter().enumerate() {
            let addr = pc as u64;
            self.cache_total += 1;
            if let Some(description) = self.cache.get(&addr) {
                self.cache_hits += 1;
                writeln!(out, " #{:<2} {:016x}{}", frame, addr, description)?;
                continue;
            }
            let description = self.describe(addr);
            writeln!(out, " #{:<2} {:016x}{}", frame, addr, description)?;
            self.cache.insert(addr, description);
        }
        Ok(())
    }

    /// Fraction of lookups served from the cache since last asked;
    /// asking resets the counters.
    pub fn cache_hit_ratio(&mut self) -> f64 {
        let ratio = if self.cache_total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.cache_total as f64
        };
        self.cache_total = 0;
        self.cache_hits = 0;
        ratio
    }

    fn describe(&mut self, addr: u64) -> String {
        let Some(idx) = self
            .objects
            .iter()
            .position(|o| addr >= o.start && addr < o.end)
        else {
            // No loaded object covers this address, so there is no
            // basename to bracket; emit the raw address instead.
            return format!(" [{:#018x}]", addr);
        };
        let object = &mut self.objects[idx];
        object.ensure_loaded();
        let basename = object.basename();
        let LazyInfo::Loaded(info) = &object.info else {
            return format!(" [{}]", basename);
        };
        let local = addr - info.bias;
        match (info.find_function(local), info.find_line(local)) {
            (Some(f), Some(r)) => format!(" in {} at {}:{}", f.name, r.file, r.line),
            (Some(f), None) => format!(" in {}", f.name),
            (None, Some(r)) => format!(" in ?? at {}:{}", r.file, r.line),
            (None, None) => format!(" [{}]", basename),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_outside_every_object_fall_back_to_the_raw_address() {
        let mut resolver = Resolver::empty();
        let mut out = Vec::new();
        resolver
            .resolve_and_print(&mut out, &[0xdead as *mut c_void])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, " #0  000000000000dead [0x000000000000dead]\n");
    }

    #[test]
    fn failed_resolution_falls_back_to_the_bracketed_basename() {
        let mut resolver = Resolver::empty();
        resolver.objects.push(LoadedObject {
            path: PathBuf::from("/nonexistent/libfake.so.1"),
            start: 0x1000,
            end: 0x2000,
            load_base: 0x1000,
            info: LazyInfo::Unloaded,
        });
        let mut out = Vec::new();
        resolver
            .resolve_and_print(&mut out, &[0x1500 as *mut c_void])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, " #0  0000000000001500 [libfake.so.1]\n");
    }

    #[test]
    fn repeated_frames_hit_the_cache() {
        let mut resolver = Resolver::empty();
        let pcs = [0x100 as *mut c_void, 0x100 as *mut c_void];
        let mut out = Vec::new();
        resolver.resolve_and_print(&mut out, &pcs).unwrap();
        assert_eq!(resolver.cache_hit_ratio(), 0.5);
        // The counters reset once read.
        assert_eq!(resolver.cache_hit_ratio(), 0.0);
    }

    #[test]
    fn resolves_addresses_inside_the_test_binary() {
        let mut resolver = Resolver::from_current_maps();
        assert!(!resolver.objects.is_empty());
        let pc = (resolves_addresses_inside_the_test_binary as fn()) as usize as *mut c_void;
        let mut out = Vec::new();
        resolver.resolve_and_print(&mut out, &[pc]).unwrap();
        let text = String::from_utf8(out).unwrap();
        // The frame resolves into this binary one way or another; it
        // must not fall back to the raw unknown-object form.
        assert!(text.contains(" in "), "unexpected line: {text}");
    }
}
