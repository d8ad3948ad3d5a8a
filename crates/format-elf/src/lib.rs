//! ELF32 big-endian executable parser for m68k program images.
//!
//! Parses `ET_EXEC` / `EM_68K` executables, collects loadable segment data,
//! caches object/function symbols from every symbol table, and applies
//! `R_68K_32` relocations against a chosen load base. Linkers only emit the
//! relocations an already-linked executable needs when invoked with
//! `--emit-relocs`, so loading at a non-zero base without any is an error.

mod symbols;
#[cfg(any(test, feature = "fixtures"))]
pub mod testfile;

use std::fmt;

pub use symbols::{Symbol, SymbolStore};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const ET_EXEC: u16 = 2;
pub const EM_68K: u16 = 4;

pub const PT_GNU_STACK: u32 = 0x6474_E551;

pub const SHT_SYMTAB: u32 = 2;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHF_ALLOC: u32 = 0x2;

pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

/// The only relocation type applied; all others are ignored.
pub const R_68K_32: u8 = 1;

/// Name of the synthesized stack symbol when `PT_GNU_STACK` is present.
pub const STACK_SYMBOL: &str = "__STACK__";

#[derive(Debug)]
pub enum ElfError {
    Truncated,
    BadMagic,
    NotElf32BigEndian,
    NotExecutable(u16),
    NotM68k(u16),
    NoSegments,
    /// A non-zero load base was requested but the file carries no
    /// `R_68K_32` relocations (not linked with `--emit-relocs`).
    NoRelocations,
    /// A relocation points outside its target section's data.
    RelocationOutOfRange { offset: u32 },
    BadStringTable,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "file truncated"),
            Self::BadMagic => write!(f, "not an ELF file"),
            Self::NotElf32BigEndian => write!(f, "not a 32-bit big-endian ELF file"),
            Self::NotExecutable(t) => write!(f, "not an ELF executable (e_type {t})"),
            Self::NotM68k(m) => write!(f, "not an m68k ELF file (e_machine {m})"),
            Self::NoSegments => write!(f, "no segments in ELF file"),
            Self::NoRelocations => write!(
                f,
                "non-zero load address but no R_68K_32 relocations; link with --emit-relocs"
            ),
            Self::RelocationOutOfRange { offset } => {
                write!(f, "relocation at {offset:#x} outside its target section")
            }
            Self::BadStringTable => write!(f, "bad string table reference"),
        }
    }
}

impl std::error::Error for ElfError {}

/// One loadable chunk of the image, already shifted to its load address.
pub struct LoadSegment {
    pub name: String,
    pub address: u32,
    pub data: Vec<u8>,
}

struct SectionHeader {
    name: String,
    sh_type: u32,
    sh_flags: u32,
    sh_addr: u32,
    sh_offset: u32,
    sh_size: u32,
    sh_link: u32,
    sh_info: u32,
    sh_entsize: u32,
}

struct ProgramHeader {
    p_type: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_memsz: u32,
}

/// A parsed, relocated program image.
pub struct ElfImage {
    entry: u32,
    load_base: u32,
    segments: Vec<LoadSegment>,
    symbols: SymbolStore,
    stack: Option<(u32, u32)>,
}

impl ElfImage {
    /// Parse an executable and prepare it for loading at `load_base`.
    ///
    /// Segment data and symbol addresses in the result are already shifted
    /// by the base, and every `R_68K_32` relocation has been applied.
    pub fn load(bytes: &[u8], load_base: u32) -> Result<Self, ElfError> {
        let parser = Parser::new(bytes)?;
        parser.check_executable()?;
        let phdrs = parser.program_headers()?;
        if phdrs.is_empty() {
            return Err(ElfError::NoSegments);
        }
        let shdrs = parser.section_headers()?;

        let mut segments = Vec::new();
        for (index, sh) in shdrs.iter().enumerate() {
            if sh.sh_flags & SHF_ALLOC == 0 || sh.sh_type == SHT_NOBITS || sh.sh_size == 0 {
                continue;
            }
            // The load address may differ from the run address; the section
            // doesn't know that, the enclosing segment does.
            let mut paddr = sh.sh_addr;
            for ph in &phdrs {
                if ph.p_paddr != 0
                    && ph.p_memsz > 0
                    && sh.sh_addr >= ph.p_vaddr
                    && sh.sh_addr < ph.p_vaddr.wrapping_add(ph.p_memsz)
                {
                    paddr = sh.sh_addr.wrapping_sub(ph.p_vaddr.wrapping_sub(ph.p_paddr));
                    break;
                }
            }
            let data = parser.section_data(sh)?.to_vec();
            segments.push((index, paddr.wrapping_add(load_base), sh.sh_addr, data));
        }

        let relocated = parser.apply_relocations(&shdrs, &mut segments, load_base)?;
        if load_base != 0 && relocated == 0 {
            return Err(ElfError::NoRelocations);
        }

        let mut symbols = SymbolStore::new();
        parser.cache_symbols(&shdrs, load_base, &mut symbols)?;

        let segments: Vec<LoadSegment> = segments
            .into_iter()
            .map(|(index, address, _, data)| LoadSegment {
                name: shdrs[index].name.clone(),
                address,
                data,
            })
            .collect();

        let stack = Self::synthesize_stack(&phdrs, &segments, &mut symbols);

        Ok(Self {
            entry: parser.entry().wrapping_add(load_base),
            load_base,
            segments,
            symbols,
            stack,
        })
    }

    /// Parse a file for its symbols only. Accepts any ELF32-BE m68k object,
    /// not just executables; used for trace symbolication side files.
    pub fn load_symbols(bytes: &[u8]) -> Result<SymbolStore, ElfError> {
        let parser = Parser::new(bytes)?;
        let shdrs = parser.section_headers()?;
        let mut symbols = SymbolStore::new();
        parser.cache_symbols(&shdrs, 0, &mut symbols)?;
        Ok(symbols)
    }

    fn synthesize_stack(
        phdrs: &[ProgramHeader],
        segments: &[LoadSegment],
        symbols: &mut SymbolStore,
    ) -> Option<(u32, u32)> {
        let stack_size = phdrs
            .iter()
            .find(|ph| ph.p_type == PT_GNU_STACK && ph.p_memsz > 0)
            .map(|ph| ph.p_memsz)?;
        let end_of_image = segments
            .iter()
            .map(|seg| seg.address + seg.data.len() as u32)
            .max()?;
        // word-align the stack base
        let base = (end_of_image + 3) & !3;
        symbols.insert(Symbol {
            name: STACK_SYMBOL.to_string(),
            address: base,
            size: stack_size,
        });
        Some((base, stack_size))
    }

    /// Program entry point, shifted to the load address.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn load_base(&self) -> u32 {
        self.load_base
    }

    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    /// Initial stack pointer: the upper bound of the synthesized
    /// `__STACK__` range, when the file declares a stack size.
    pub fn initial_sp(&self) -> Option<u32> {
        self.stack.map(|(base, size)| base + size)
    }

    pub fn symbols(&self) -> &SymbolStore {
        &self.symbols
    }

    pub fn into_symbols(self) -> SymbolStore {
        self.symbols
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < 52 {
            return Err(ElfError::Truncated);
        }
        if bytes[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2MSB {
            return Err(ElfError::NotElf32BigEndian);
        }
        Ok(Self { bytes })
    }

    fn u16_at(&self, offset: usize) -> Result<u16, ElfError> {
        let b = self.bytes.get(offset..offset + 2).ok_or(ElfError::Truncated)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_at(&self, offset: usize) -> Result<u32, ElfError> {
        let b = self.bytes.get(offset..offset + 4).ok_or(ElfError::Truncated)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn check_executable(&self) -> Result<(), ElfError> {
        let e_type = self.u16_at(16)?;
        if e_type != ET_EXEC {
            return Err(ElfError::NotExecutable(e_type));
        }
        let e_machine = self.u16_at(18)?;
        if e_machine != EM_68K {
            return Err(ElfError::NotM68k(e_machine));
        }
        Ok(())
    }

    fn entry(&self) -> u32 {
        self.u32_at(24).unwrap_or(0)
    }

    fn program_headers(&self) -> Result<Vec<ProgramHeader>, ElfError> {
        let phoff = self.u32_at(28)? as usize;
        let phentsize = self.u16_at(42)? as usize;
        let phnum = self.u16_at(44)? as usize;
        let mut headers = Vec::with_capacity(phnum);
        for i in 0..phnum {
            let base = phoff + i * phentsize;
            headers.push(ProgramHeader {
                p_type: self.u32_at(base)?,
                p_vaddr: self.u32_at(base + 8)?,
                p_paddr: self.u32_at(base + 12)?,
                p_memsz: self.u32_at(base + 20)?,
            });
        }
        Ok(headers)
    }

    fn section_headers(&self) -> Result<Vec<SectionHeader>, ElfError> {
        let shoff = self.u32_at(32)? as usize;
        let shentsize = self.u16_at(46)? as usize;
        let shnum = self.u16_at(48)? as usize;
        let shstrndx = self.u16_at(50)? as usize;

        let mut raw = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let base = shoff + i * shentsize;
            raw.push(SectionHeader {
                name: String::new(),
                sh_type: self.u32_at(base + 4)?,
                sh_flags: self.u32_at(base + 8)?,
                sh_addr: self.u32_at(base + 12)?,
                sh_offset: self.u32_at(base + 16)?,
                sh_size: self.u32_at(base + 20)?,
                sh_link: self.u32_at(base + 24)?,
                sh_info: self.u32_at(base + 28)?,
                sh_entsize: self.u32_at(base + 36)?,
            });
        }

        // resolve names through the section-name string table
        if shstrndx < raw.len() {
            let strtab_off = raw[shstrndx].sh_offset as usize;
            let strtab_size = raw[shstrndx].sh_size as usize;
            let strtab = self
                .bytes
                .get(strtab_off..strtab_off + strtab_size)
                .ok_or(ElfError::Truncated)?;
            let name_offsets: Vec<u32> = (0..raw.len())
                .map(|i| self.u32_at(shoff + i * shentsize))
                .collect::<Result<_, _>>()?;
            for (sh, name_off) in raw.iter_mut().zip(name_offsets) {
                sh.name = read_string(strtab, name_off as usize)?;
            }
        }
        Ok(raw)
    }

    fn section_data(&self, sh: &SectionHeader) -> Result<&'a [u8], ElfError> {
        let start = sh.sh_offset as usize;
        let end = start + sh.sh_size as usize;
        self.bytes.get(start..end).ok_or(ElfError::Truncated)
    }

    /// Apply every `R_68K_32` relocation whose target section was loaded.
    /// Returns the number of relocations applied (other types are ignored).
    fn apply_relocations(
        &self,
        shdrs: &[SectionHeader],
        segments: &mut [(usize, u32, u32, Vec<u8>)],
        load_base: u32,
    ) -> Result<usize, ElfError> {
        let mut applied = 0;
        for sh in shdrs {
            if sh.sh_type != SHT_RELA || sh.sh_entsize == 0 {
                continue;
            }
            let target_index = sh.sh_info as usize;
            let Some(target) = segments.iter_mut().find(|(i, _, _, _)| *i == target_index)
            else {
                continue;
            };
            let (_, _, target_vaddr, target_data) = target;
            let data = self.section_data(sh)?;
            let count = sh.sh_size as usize / sh.sh_entsize as usize;
            for i in 0..count {
                let base = i * sh.sh_entsize as usize;
                let r_offset = u32::from_be_bytes(
                    data.get(base..base + 4)
                        .ok_or(ElfError::Truncated)?
                        .try_into()
                        .unwrap_or([0; 4]),
                );
                let r_info = u32::from_be_bytes(
                    data.get(base + 4..base + 8)
                        .ok_or(ElfError::Truncated)?
                        .try_into()
                        .unwrap_or([0; 4]),
                );
                if (r_info & 0xFF) as u8 != R_68K_32 {
                    continue;
                }
                let index = r_offset.wrapping_sub(*target_vaddr) as usize;
                let slot = target_data
                    .get_mut(index..index + 4)
                    .ok_or(ElfError::RelocationOutOfRange { offset: r_offset })?;
                let word = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);
                slot.copy_from_slice(&word.wrapping_add(load_base).to_be_bytes());
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn cache_symbols(
        &self,
        shdrs: &[SectionHeader],
        load_base: u32,
        store: &mut SymbolStore,
    ) -> Result<(), ElfError> {
        for sh in shdrs {
            if sh.sh_type != SHT_SYMTAB || sh.sh_entsize == 0 {
                continue;
            }
            let strtab_sh = shdrs.get(sh.sh_link as usize).ok_or(ElfError::BadStringTable)?;
            let strtab = self.section_data(strtab_sh)?;
            let data = self.section_data(sh)?;
            let count = sh.sh_size as usize / sh.sh_entsize as usize;
            for i in 0..count {
                let base = i * sh.sh_entsize as usize;
                let entry = data.get(base..base + 16).ok_or(ElfError::Truncated)?;
                let st_info = entry[12];
                // only data and function symbols are interesting
                let st_type = st_info & 0xF;
                if st_type != STT_OBJECT && st_type != STT_FUNC {
                    continue;
                }
                let st_name = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
                let name = read_string(strtab, st_name as usize)?;
                if name.is_empty() {
                    continue;
                }
                let st_value = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);
                let st_size = u32::from_be_bytes([entry[8], entry[9], entry[10], entry[11]]);
                store.insert(Symbol {
                    name,
                    address: st_value.wrapping_add(load_base),
                    size: st_size,
                });
            }
        }
        Ok(())
    }
}

fn read_string(strtab: &[u8], offset: usize) -> Result<String, ElfError> {
    let tail = strtab.get(offset..).ok_or(ElfError::BadStringTable)?;
    let end = tail.iter().position(|&b| b == 0).ok_or(ElfError::BadStringTable)?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfile::ElfBuilder;

    #[test]
    fn reject_non_elf() {
        let junk = vec![0x20u8; 64];
        assert!(matches!(ElfImage::load(&junk, 0), Err(ElfError::BadMagic)));
        assert!(matches!(ElfImage::load(b"short", 0), Err(ElfError::Truncated)));
    }

    #[test]
    fn reject_wrong_machine() {
        let bytes = ElfBuilder::new().machine(3).build();
        assert!(matches!(ElfImage::load(&bytes, 0), Err(ElfError::NotM68k(3))));
    }

    #[test]
    fn reject_relocatable_object() {
        let bytes = ElfBuilder::new().elf_type(1).build();
        assert!(matches!(ElfImage::load(&bytes, 0), Err(ElfError::NotExecutable(1))));
    }

    #[test]
    fn load_at_link_address() {
        let bytes = ElfBuilder::new()
            .entry(0x400)
            .text(0x400, vec![0x4E, 0x71, 0x4E, 0x71])
            .build();
        let image = ElfImage::load(&bytes, 0).expect("loads");
        assert_eq!(image.entry(), 0x400);
        assert_eq!(image.segments().len(), 1);
        assert_eq!(image.segments()[0].address, 0x400);
        assert_eq!(image.segments()[0].data, vec![0x4E, 0x71, 0x4E, 0x71]);
    }

    #[test]
    fn relocation_round_trip() {
        // a pointer at 0x800 referencing _start at 0x400, relocated by delta
        let delta = 0x10000;
        let mut text = vec![0u8; 0x404];
        text[0x400..0x404].copy_from_slice(&0x400u32.to_be_bytes());
        let bytes = ElfBuilder::new()
            .entry(0x400)
            .text(0x400, text)
            .rela(0x800, R_68K_32)
            .symbol("_start", 0x400, 4)
            .build();
        let image = ElfImage::load(&bytes, delta).expect("loads");
        let seg = &image.segments()[0];
        assert_eq!(seg.address, 0x400 + delta);
        let word = &seg.data[0x400..0x404];
        assert_eq!(u32::from_be_bytes([word[0], word[1], word[2], word[3]]), 0x400 + delta);
        assert_eq!(image.entry(), 0x400 + delta);
    }

    #[test]
    fn nonzero_base_without_relocs_is_an_error() {
        let bytes = ElfBuilder::new().entry(0x400).text(0x400, vec![0; 16]).build();
        assert!(matches!(
            ElfImage::load(&bytes, 0x10000),
            Err(ElfError::NoRelocations)
        ));
    }

    #[test]
    fn other_relocation_types_are_ignored() {
        let bytes = ElfBuilder::new()
            .entry(0x400)
            .text(0x400, vec![0u8; 0x10])
            .rela(0x400, R_68K_32)
            .rela(0x408, 2) // R_68K_16, must not be applied
            .build();
        let image = ElfImage::load(&bytes, 0x100).expect("loads");
        let seg = &image.segments()[0];
        assert_eq!(&seg.data[0..4], &0x100u32.to_be_bytes());
        assert_eq!(&seg.data[8..12], &[0, 0, 0, 0], "16-bit reloc site untouched");
    }

    #[test]
    fn stack_symbol_synthesis() {
        let bytes = ElfBuilder::new()
            .entry(0x400)
            .text(0x400, vec![0; 0x100])
            .gnu_stack(0x1000)
            .build();
        let image = ElfImage::load(&bytes, 0).expect("loads");
        // image ends at 0x500, already aligned
        assert_eq!(image.initial_sp(), Some(0x500 + 0x1000));
        assert_eq!(image.symbols().lookup(0x500).as_deref(), Some(STACK_SYMBOL));
        assert_eq!(
            image.symbols().lookup(0x500 + 0xFFF).as_deref(),
            Some("__STACK__+0xfff")
        );
    }

    #[test]
    fn symbols_shift_with_load_base() {
        let mut text = vec![0u8; 8];
        text[0..4].copy_from_slice(&0u32.to_be_bytes());
        let bytes = ElfBuilder::new()
            .entry(0x400)
            .text(0x400, text)
            .rela(0x400, R_68K_32)
            .symbol("main", 0x400, 8)
            .build();
        let image = ElfImage::load(&bytes, 0x2000).expect("loads");
        assert_eq!(image.symbols().lookup(0x2400).as_deref(), Some("main"));
    }

    #[test]
    fn symbols_only_accepts_objects() {
        let bytes = ElfBuilder::new()
            .elf_type(1)
            .symbol("counter", 0x1234, 4)
            .build();
        let store = ElfImage::load_symbols(&bytes).expect("symbol load");
        assert_eq!(store.lookup(0x1234).as_deref(), Some("counter"));
    }
}
