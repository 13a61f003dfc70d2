//! Minimal ELF64 little-endian symbol-table reader.
//!
//! Only what symbolication needs: section headers, `.symtab` (or `.dynsym`
//! when the image is stripped) and the string table they link to.

use crate::platform::{ImageSymbols, RawSymbol, SymbolError};
use crate::reader::ByteReader;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

// ELF64 header offsets
const E_SHOFF: usize = 0x28;
const E_SHENTSIZE: usize = 0x3a;
const E_SHNUM: usize = 0x3c;

const SECTION_HEADER_SIZE: usize = 64;
const SYMBOL_SIZE: usize = 24;

pub const SHT_SYMTAB: u32 = 2;
pub const SHT_DYNSYM: u32 = 11;

pub const STT_FUNC: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
}

fn section_headers(r: &ByteReader<'_>) -> Result<Vec<SectionHeader>, SymbolError> {
    let ident = r.slice(0, 16)?;
    if &ident[..4] != ELF_MAGIC {
        return Err(SymbolError::BadMagic);
    }
    if ident[4] != ELFCLASS64 {
        return Err(SymbolError::Unsupported("32-bit ELF"));
    }
    if ident[5] != ELFDATA2LSB {
        return Err(SymbolError::Unsupported("big-endian ELF"));
    }

    let shoff = r.u64_at(E_SHOFF)? as usize;
    let shentsize = r.u16_at(E_SHENTSIZE)? as usize;
    let shnum = r.u16_at(E_SHNUM)? as usize;
    if shnum == 0 {
        return Err(SymbolError::NoSymbolTable);
    }
    if shentsize < SECTION_HEADER_SIZE {
        return Err(SymbolError::Unsupported("short section header entries"));
    }

    (0..shnum)
        .map(|i| {
            let sh = r.sub(shoff + i * shentsize, SECTION_HEADER_SIZE)?;
            Ok(SectionHeader {
                sh_type: sh.u32_at(4)?,
                offset: sh.u64_at(24)?,
                size: sh.u64_at(32)?,
                link: sh.u32_at(40)?,
                entsize: sh.u64_at(56)?,
            })
        })
        .collect()
}

/// Parse the function symbols out of an ELF file image.
///
/// Prefers the full `.symtab`; falls back to `.dynsym`. Only named,
/// defined `STT_FUNC` symbols are kept.
pub fn parse_symbols(data: &[u8]) -> Result<ImageSymbols, SymbolError> {
    let r = ByteReader::new(data);
    let sections = section_headers(&r)?;

    let symtab = sections
        .iter()
        .find(|s| s.sh_type == SHT_SYMTAB)
        .or_else(|| sections.iter().find(|s| s.sh_type == SHT_DYNSYM))
        .ok_or(SymbolError::NoSymbolTable)?;
    let strtab = sections
        .get(symtab.link as usize)
        .ok_or(SymbolError::Unsupported("symbol table links to a missing section"))?;

    let entsize = if symtab.entsize == 0 {
        SYMBOL_SIZE
    } else {
        symtab.entsize as usize
    };
    if entsize < SYMBOL_SIZE {
        return Err(SymbolError::Unsupported("short symbol entries"));
    }

    let table = r.sub(symtab.offset as usize, symtab.size as usize)?;
    let strings = r.slice(strtab.offset as usize, strtab.size as usize)?;

    let count = table.len() / entsize;
    let mut symbols = Vec::with_capacity(count);
    for i in 0..count {
        let sym = table.sub(i * entsize, SYMBOL_SIZE)?;
        let name_offset = sym.u32_at(0)?;
        let info = sym.u8_at(4)?;
        let shndx = sym.u16_at(6)?;
        let value = sym.u64_at(8)?;

        if name_offset == 0 || shndx == SHN_UNDEF || value == 0 {
            continue;
        }
        if info & 0xf != STT_FUNC {
            continue;
        }
        if name_offset as usize >= strings.len() {
            return Err(SymbolError::OutOfBounds {
                offset: name_offset as usize,
                len: 1,
            });
        }
        symbols.push(RawSymbol { name_offset, value });
    }

    Ok(ImageSymbols {
        symbols,
        strtab: strings.to_vec(),
    })
}

/// Builds tiny ELF64 images for tests.
#[cfg(any(test, feature = "fake-platform"))]
pub mod testing {
    /// `(name, st_info, st_shndx, st_value)`
    pub type SymbolSpec<'a> = (&'a str, u8, u16, u64);

    /// Lay out: ELF header, .strtab, .symtab, then four section headers
    /// (null, symtab, strtab, shstrtab-less padding).
    pub fn build_elf(symtab_type: u32, symbols: &[SymbolSpec<'_>]) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut entries = vec![[0u8; 24]];
        for &(name, info, shndx, value) in symbols {
            let name_offset = if name.is_empty() {
                0
            } else {
                let off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                off
            };
            let mut e = [0u8; 24];
            e[0..4].copy_from_slice(&name_offset.to_le_bytes());
            e[4] = info;
            e[6..8].copy_from_slice(&shndx.to_le_bytes());
            e[8..16].copy_from_slice(&value.to_le_bytes());
            entries.push(e);
        }

        let mut out = vec![0u8; 64];
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;

        let strtab_off = out.len() as u64;
        out.extend_from_slice(&strtab);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let symtab_off = out.len() as u64;
        for e in &entries {
            out.extend_from_slice(e);
        }
        let shoff = out.len() as u64;

        let section = |sh_type: u32, offset: u64, size: u64, link: u32, entsize: u64| {
            let mut sh = [0u8; 64];
            sh[4..8].copy_from_slice(&sh_type.to_le_bytes());
            sh[24..32].copy_from_slice(&offset.to_le_bytes());
            sh[32..40].copy_from_slice(&size.to_le_bytes());
            sh[40..44].copy_from_slice(&link.to_le_bytes());
            sh[56..64].copy_from_slice(&entsize.to_le_bytes());
            sh
        };
        out.extend_from_slice(&[0u8; 64]);
        out.extend_from_slice(&section(
            symtab_type,
            symtab_off,
            (entries.len() * 24) as u64,
            2,
            24,
        ));
        out.extend_from_slice(&section(3, strtab_off, strtab.len() as u64, 0, 0));

        out[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
        out[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
        out[0x3c..0x3e].copy_from_slice(&3u16.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::build_elf;
    use super::*;

    const FUNC_GLOBAL: u8 = 0x10 | STT_FUNC;
    const OBJECT: u8 = 0x11;

    fn names(syms: &ImageSymbols) -> Vec<String> {
        let r = ByteReader::new(&syms.strtab);
        syms.symbols
            .iter()
            .map(|s| String::from_utf8_lossy(r.cstr_at(s.name_offset as usize).unwrap()).into_owned())
            .collect()
    }

    #[test]
    fn keeps_named_defined_functions() {
        let data = build_elf(
            SHT_SYMTAB,
            &[
                ("alpha", FUNC_GLOBAL, 1, 0x1000),
                ("undefined", FUNC_GLOBAL, SHN_UNDEF, 0),
                ("a_global", OBJECT, 2, 0x4000),
                ("", FUNC_GLOBAL, 1, 0x1800),
                ("beta", FUNC_GLOBAL, 1, 0x2000),
            ],
        );
        let syms = parse_symbols(&data).unwrap();
        assert_eq!(names(&syms), vec!["alpha", "beta"]);
        assert_eq!(syms.symbols[0].value, 0x1000);
        assert_eq!(syms.symbols[1].value, 0x2000);
    }

    #[test]
    fn falls_back_to_dynsym() {
        let data = build_elf(SHT_DYNSYM, &[("exported", FUNC_GLOBAL, 1, 0x3000)]);
        let syms = parse_symbols(&data).unwrap();
        assert_eq!(names(&syms), vec!["exported"]);
    }

    #[test]
    fn rejects_non_elf() {
        assert!(matches!(
            parse_symbols(&[0u8; 128]),
            Err(SymbolError::BadMagic)
        ));
        assert!(parse_symbols(b"\x7fELF").is_err());
    }

    #[test]
    fn rejects_32_bit() {
        let mut data = build_elf(SHT_SYMTAB, &[]);
        data[4] = 1;
        assert!(matches!(
            parse_symbols(&data),
            Err(SymbolError::Unsupported(_))
        ));
    }

    #[test]
    fn truncated_symbol_table_is_an_error() {
        let data = build_elf(SHT_SYMTAB, &[("alpha", FUNC_GLOBAL, 1, 0x1000)]);
        // Cut inside the section header table.
        let cut = &data[..data.len() - 10];
        assert!(matches!(
            parse_symbols(cut),
            Err(SymbolError::OutOfBounds { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_own_executable() {
        let data = std::fs::read("/proc/self/exe").unwrap();
        let syms = parse_symbols(&data).unwrap();
        assert!(!syms.symbols.is_empty());
    }
}
