//! `/proc/self/maps` parsing.

use crate::error::{Error, Result};
use std::fs;

/// A parsed memory mapping.
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    /// A file-backed code mapping with an absolute path: something the
    /// resolver can open and parse.
    pub fn is_resolvable(&self) -> bool {
        self.is_executable()
            && self
                .pathname
                .as_deref()
                .is_some_and(|p| p.starts_with('/'))
    }
}

/// The mappings of the current process.
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    pub fn current() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/maps")
            .map_err(|e| Error::SymbolResolution(format!("cannot read /proc/self/maps: {}", e)))?;
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        Ok(MemoryMaps { mappings })
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }
        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;
        let pathname = (parts.len() >= 6).then(|| parts[5..].join(" "));
        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    pub fn resolvable_mappings(&self) -> impl Iterator<Item = &MemoryMapping> {
        self.mappings.iter().filter(|m| m.is_resolvable())
    }
}
