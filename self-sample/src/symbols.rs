//! Address → symbol lookup over every image loaded into the process.
//!
//! The table is a single sorted array of start addresses. Looking up an
//! address finds the greatest entry at or below it; the following entry's
//! address is the exclusive end of that symbol. Each image contributes its
//! function symbols plus two sentinels marking the bounds of its executable
//! segment, so addresses past the last symbol of an image never resolve to
//! that symbol.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use crate::platform::{ImageSymbols, Platform, SymbolError};
use crate::reader::ByteReader;

/// What a table entry marks.
///
/// When entries share an address a named symbol wins over a segment
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolSlot {
    /// Index into the image's [`ImageSymbols::symbols`].
    Named(u32),
    SegmentStart,
    SegmentEnd,
}

impl SymbolSlot {
    fn rank(self) -> u8 {
        match self {
            SymbolSlot::Named(_) => 0,
            SymbolSlot::SegmentStart => 1,
            SymbolSlot::SegmentEnd => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId {
    pub image: u32,
    pub slot: SymbolSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableEntry {
    pub address: u64,
    pub id: SymbolId,
}

/// A resolved, demangled symbol and the image it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolName {
    pub name: String,
    pub image: String,
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.image)
    }
}

struct ImageEntry {
    short_name: String,
    symbols: ImageSymbols,
}

pub struct SymbolTable {
    entries: Vec<SymbolTableEntry>,
    images: Vec<ImageEntry>,
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("entries", &self.entries.len())
            .field("images", &self.images.len())
            .finish()
    }
}

impl SymbolTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Build the table, degrading to an empty one on any failure.
    pub fn build(platform: &dyn Platform) -> Self {
        match Self::try_build(platform) {
            Ok(table) => {
                tracing::debug!(
                    images = table.images.len(),
                    entries = table.entries.len(),
                    "symbol table built"
                );
                table
            }
            Err(error) => {
                tracing::warn!(%error, "symbol table unavailable, samples will not be symbolicated");
                Self::empty()
            }
        }
    }

    pub fn try_build(platform: &dyn Platform) -> Result<Self, SymbolError> {
        let loaded = platform.enumerate_loaded_images()?;

        let mut entries = Vec::new();
        let mut images = Vec::with_capacity(loaded.len());
        for image in &loaded {
            let symbols = platform.read_symbol_table(image)?;
            let index = images.len() as u32;

            entries.extend(symbols.symbols.iter().enumerate().map(|(i, sym)| SymbolTableEntry {
                address: image.base_address.wrapping_add(sym.value),
                id: SymbolId {
                    image: index,
                    slot: SymbolSlot::Named(i as u32),
                },
            }));
            entries.push(SymbolTableEntry {
                address: image.exec_start,
                id: SymbolId {
                    image: index,
                    slot: SymbolSlot::SegmentStart,
                },
            });
            entries.push(SymbolTableEntry {
                address: image.exec_end,
                id: SymbolId {
                    image: index,
                    slot: SymbolSlot::SegmentEnd,
                },
            });

            images.push(ImageEntry {
                short_name: image.short_name(),
                symbols,
            });
        }

        entries.sort_by_key(|e| (e.address, e.id.slot.rank()));
        entries.dedup_by_key(|e| e.address);

        Ok(Self { entries, images })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SymbolTableEntry] {
        &self.entries
    }

    /// Index of the entry covering `address`, or `None` below the first entry.
    pub fn resolve(&self, address: u64) -> Option<usize> {
        self.entries
            .partition_point(|e| e.address <= address)
            .checked_sub(1)
    }

    pub fn symbol_name(&self, index: usize) -> Option<SymbolName> {
        let entry = self.entries.get(index)?;
        let image = self.images.get(entry.id.image as usize)?;
        let name = match entry.id.slot {
            SymbolSlot::SegmentStart => "_start".to_string(),
            SymbolSlot::SegmentEnd => return None,
            SymbolSlot::Named(i) => {
                let raw = image.symbols.symbols.get(i as usize)?;
                let bytes = ByteReader::new(&image.symbols.strtab)
                    .cstr_at(raw.name_offset as usize)
                    .ok()?;
                let mangled = String::from_utf8_lossy(bytes);
                format!("{:#}", rustc_demangle::demangle(&mangled))
            }
        };
        Some(SymbolName {
            name,
            image: image.short_name.clone(),
        })
    }

    /// `resolve` followed by `symbol_name`.
    pub fn lookup(&self, address: u64) -> Option<SymbolName> {
        self.symbol_name(self.resolve(address)?)
    }

    /// Address ranges of the named symbols whose raw (mangled) name is in
    /// `names`. Used to recognise the outermost frames of a stack.
    pub fn ranges_named(&self, names: &[&str]) -> Vec<Range<u64>> {
        let mut ranges = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let SymbolSlot::Named(sym) = entry.id.slot else {
                continue;
            };
            let Some(image) = self.images.get(entry.id.image as usize) else {
                continue;
            };
            let Some(raw) = image.symbols.symbols.get(sym as usize) else {
                continue;
            };
            let Ok(bytes) = ByteReader::new(&image.symbols.strtab).cstr_at(raw.name_offset as usize)
            else {
                continue;
            };
            if !names.iter().any(|n| n.as_bytes() == bytes) {
                continue;
            }
            let end = self.entries.get(i + 1).map_or(u64::MAX, |next| next.address);
            ranges.push(entry.address..end);
        }
        ranges
    }
}

/// The process-wide symbol table for the native platform, built on first use.
pub fn process_symbols() -> Arc<SymbolTable> {
    static TABLE: OnceLock<Arc<SymbolTable>> = OnceLock::new();
    TABLE
        .get_or_init(|| Arc::new(SymbolTable::build(&crate::sys::NativePlatform::new())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePlatform;

    const MANGLED: &str = "_ZN3foo3bar17h0123456789abcdefE";

    fn platform() -> FakePlatform {
        let p = FakePlatform::new();
        p.add_image(
            "/opt/app/bin/app",
            0x1000,
            0x3000,
            &[("main", 0x1000), (MANGLED, 0x1800), ("helper", 0x2000)],
        );
        p.add_image("/usr/lib/libc.so.6", 0x8000, 0x9000, &[("memcpy", 0x8100)]);
        p
    }

    #[test]
    fn entries_are_strictly_increasing() {
        let table = SymbolTable::build(&platform());
        assert!(!table.is_empty());
        assert!(table.entries().windows(2).all(|w| w[0].address < w[1].address));
    }

    #[test]
    fn named_symbol_wins_over_segment_start() {
        let table = SymbolTable::build(&platform());
        let idx = table.resolve(0x1000).unwrap();
        assert_eq!(table.entries()[idx].id.slot, SymbolSlot::Named(0));
        assert_eq!(table.symbol_name(idx).unwrap().name, "main");
    }

    #[test]
    fn resolves_to_enclosing_symbol_and_demangles() {
        let table = SymbolTable::build(&platform());
        let name = table.lookup(0x1850).unwrap();
        assert_eq!(name.name, "foo::bar");
        assert_eq!(name.image, "app");
        assert_eq!(name.to_string(), "foo::bar [app]");
        assert_eq!(table.lookup(0x1fff).unwrap().name, "foo::bar");
        assert_eq!(table.lookup(0x2000).unwrap().name, "helper");
    }

    #[test]
    fn segment_start_without_symbol_is_start() {
        let table = SymbolTable::build(&platform());
        let name = table.lookup(0x8010).unwrap();
        assert_eq!(name.name, "_start");
        assert_eq!(name.image, "libc.so.6");
        assert_eq!(table.lookup(0x8100).unwrap().name, "memcpy");
    }

    #[test]
    fn out_of_range_addresses() {
        let table = SymbolTable::build(&platform());
        // Below every image.
        assert_eq!(table.resolve(0xfff), None);
        // Past an image's executable segment: the end sentinel has no name.
        let idx = table.resolve(0x3000).unwrap();
        assert_eq!(table.entries()[idx].id.slot, SymbolSlot::SegmentEnd);
        assert_eq!(table.symbol_name(idx), None);
        assert_eq!(table.lookup(0x5000), None);
        // Past the last image.
        assert_eq!(table.lookup(u64::MAX), None);
    }

    #[test]
    fn enumeration_failure_gives_empty_table() {
        let p = platform();
        p.fail_enumeration();
        let table = SymbolTable::build(&p);
        assert!(table.is_empty());
        assert_eq!(table.resolve(0x1850), None);
    }

    #[test]
    fn one_unreadable_image_clears_everything() {
        let p = platform();
        p.fail_symbols_for_image(1);
        assert!(SymbolTable::try_build(&p).is_err());
        assert!(SymbolTable::build(&p).is_empty());
    }

    #[test]
    fn stack_top_ranges_end_at_next_entry() {
        let table = SymbolTable::build(&platform());
        assert_eq!(table.ranges_named(&["main"]), vec![0x1000..0x1800]);
        assert_eq!(table.ranges_named(&["memcpy"]), vec![0x8100..0x9000]);
        assert!(table.ranges_named(&["absent"]).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_table_resolves_own_code() {
        #[inline(never)]
        fn marker() -> u64 {
            marker as fn() -> u64 as usize as u64
        }
        let table = process_symbols();
        if table.is_empty() {
            return;
        }
        let name = table.lookup(marker()).unwrap();
        assert!(name.name.contains("marker"), "{name}");
    }
}
