//! Lazily parsed symbol and line information for one loaded object.

use crate::error::{Error, Result};
use gimli::RunTimeEndian;
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// A line-table range mapped to a source location.
#[derive(Debug, Clone)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
}

/// A function symbol from the object's symbol tables.
#[derive(Debug, Clone)]
pub struct FuncSym {
    pub addr: u64,
    pub size: u64,
    pub name: String,
}

pub struct ObjectInfo {
    /// Subtracted from runtime addresses before lookup. Zero for
    /// non-PIE executables, whose symbols carry absolute addresses.
    pub bias: u64,
    /// Function symbols sorted by address.
    pub functions: Vec<FuncSym>,
    /// Line ranges sorted by start address.
    pub ranges: Vec<AddressRange>,
}

impl ObjectInfo {
    /// Parse symbols and line tables from an ELF on disk. `load_base`
    /// is the runtime address its first file byte is mapped at.
    pub fn parse(path: &Path, load_base: u64) -> Result<Self> {
        let file = File::open(path).map_err(Error::Io)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(Error::Io)?;
        let obj = object::File::parse(&*mmap)
            .map_err(|e| Error::SymbolResolution(format!("{}: {}", path.display(), e)))?;

        let bias = if obj.kind() == ObjectKind::Executable {
            0
        } else {
            load_base
        };

        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let functions = Self::parse_functions(&obj);
        let ranges = Self::parse_line_ranges(&obj, endian);

        Ok(ObjectInfo {
            bias,
            functions,
            ranges,
        })
    }

    fn parse_functions(obj: &object::File<'_>) -> Vec<FuncSym> {
        let mut functions: Vec<FuncSym> = Vec::new();
        for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
            if symbol.kind() == object::SymbolKind::Text
                && symbol.size() > 0
                && let Ok(name) = symbol.name()
            {
                functions.push(FuncSym {
                    addr: symbol.address(),
                    size: symbol.size(),
                    name: rustc_demangle::demangle(name).to_string(),
                });
            }
        }
        functions.sort_by_key(|f| f.addr);
        functions.dedup_by_key(|f| f.addr);
        functions
    }

    fn parse_line_ranges(obj: &object::File<'_>, endian: RunTimeEndian) -> Vec<AddressRange> {
        let load_section = |name: &str| -> &[u8] {
            obj.section_by_name(name)
                .and_then(|s| s.data().ok())
                .unwrap_or(&[])
        };

        let dwarf = gimli::Dwarf {
            debug_abbrev: gimli::DebugAbbrev::new(load_section(".debug_abbrev"), endian),
            debug_info: gimli::DebugInfo::new(load_section(".debug_info"), endian),
            debug_line: gimli::DebugLine::new(load_section(".debug_line"), endian),
            debug_str: gimli::DebugStr::new(load_section(".debug_str"), endian),
            debug_line_str: gimli::DebugLineStr::new(load_section(".debug_line_str"), endian),
            ..Default::default()
        };

        let mut ranges = Vec::new();
        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let Ok(unit) = dwarf.unit(header) else {
                continue;
            };
            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut rows = program.rows();
            let mut prev_row: Option<(u64, String, u32)> = None;
            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();
                let file = row
                    .file(header)
                    .map(|f| {
                        let mut path = String::new();
                        if let Some(dir) = f.directory(header)
                            && let Ok(dir_str) = dwarf.attr_string(&unit, dir)
                            && let Ok(s) = dir_str.to_string()
                        {
                            path.push_str(s);
                            if !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                        if let Ok(name) = dwarf.attr_string(&unit, f.path_name())
                            && let Ok(s) = name.to_string()
                        {
                            path.push_str(s);
                        }
                        path
                    })
                    .unwrap_or_default();
                let line = row.line().map(|l| l.get() as u32).unwrap_or(0);

                if let Some((prev_addr, prev_file, prev_line)) = prev_row.take()
                    && addr > prev_addr
                    && !prev_file.is_empty()
                {
                    ranges.push(AddressRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                    });
                }
                if !row.end_sequence() {
                    prev_row = Some((addr, file, line));
                }
            }
        }

        ranges.sort_by_key(|r| r.start);
        ranges
    }

    /// The function symbol containing this file-relative address.
    pub fn find_function(&self, addr: u64) -> Option<&FuncSym> {
        let idx = self.functions.partition_point(|f| f.addr <= addr);
        if idx == 0 {
            return None;
        }
        let f = &self.functions[idx - 1];
        (addr < f.addr + f.size).then_some(f)
    }

    /// The line range containing this file-relative address.
    pub fn find_line(&self, addr: u64) -> Option<&AddressRange> {
        self.ranges
            .binary_search_by(|r| {
                if addr < r.start {
                    std::cmp::Ordering::Greater
                } else if addr >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
            .map(|idx| &self.ranges[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectInfo {
        ObjectInfo {
            bias: 0,
            functions: vec![
                FuncSym {
                    addr: 0x1000,
                    size: 0x100,
                    name: "alpha".into(),
                },
                FuncSym {
                    addr: 0x2000,
                    size: 0x40,
                    name: "beta".into(),
                },
            ],
            ranges: vec![
                AddressRange {
                    start: 0x1000,
                    end: 0x1010,
                    file: "src/a.rs".into(),
                    line: 10,
                },
                AddressRange {
                    start: 0x1010,
                    end: 0x1100,
                    file: "src/a.rs".into(),
                    line: 11,
                },
            ],
        }
    }

    #[test]
    fn function_lookup_respects_symbol_bounds() {
        let info = sample();
        assert_eq!(info.find_function(0x1000).unwrap().name, "alpha");
        assert_eq!(info.find_function(0x10ff).unwrap().name, "alpha");
        assert!(info.find_function(0x1100).is_none());
        assert_eq!(info.find_function(0x2010).unwrap().name, "beta");
        assert!(info.find_function(0x0fff).is_none());
        assert!(info.find_function(0x9000).is_none());
    }

    #[test]
    fn line_lookup_is_half_open() {
        let info = sample();
        assert_eq!(info.find_line(0x1000).unwrap().line, 10);
        assert_eq!(info.find_line(0x100f).unwrap().line, 10);
        assert_eq!(info.find_line(0x1010).unwrap().line, 11);
        assert!(info.find_line(0x1100).is_none());
    }

    #[test]
    fn parses_own_test_binary() {
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let info = ObjectInfo::parse(&exe, 0).unwrap();
        assert!(!info.functions.is_empty());
    }
}
