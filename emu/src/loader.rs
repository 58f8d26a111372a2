//! Binary and ELF loading utilities.

use crate::address_space::AddressSpace;
use crate::error::FatalError;
use goblin::elf::{program_header::PT_LOAD, sym::STT_FUNC, sym::STT_NOTYPE, Elf};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("ELF parse error: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("segment at file offset {offset:#x} exceeds file bounds")]
    Truncated { offset: u64 },

    #[error("segment {start:#x}..{end:#x} lies outside RAM {ram_start:#x}..{ram_end:#x}")]
    OutOfRam {
        start: u64,
        end: u64,
        ram_start: u64,
        ram_end: u64,
    },

    #[error("ROM image of {size:#x} bytes exceeds the {max:#x} byte ROM window")]
    RomTooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Address-ordered symbols for annotating trace output.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u64, String>,
}

impl SymbolTable {
    pub fn insert(&mut self, addr: u64, name: &str) {
        self.symbols.insert(addr, name.to_string());
    }

    /// Nearest symbol at or below `addr`, with the offset from it.
    pub fn lookup(&self, addr: u64) -> Option<(&str, u64)> {
        self.symbols
            .range(..=addr)
            .next_back()
            .map(|(&start, name)| (name.as_str(), addr - start))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Result of loading an ELF image.
#[derive(Debug)]
pub struct LoadedImage {
    pub entry: u64,
    pub symbols: SymbolTable,
}

/// Copy the `PT_LOAD` segments of `image` into RAM through the blob write
/// path and zero their bss tails.
pub fn load_elf(
    bus: &mut AddressSpace,
    image: &[u8],
    ram_start: u64,
    ram_size: u64,
) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(image)?;
    let ram_end = ram_start + ram_size;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz;
        let file_offset = ph.p_offset as usize;
        if file_offset
            .checked_add(file_size)
            .map_or(true, |end| end > image.len())
        {
            return Err(LoadError::Truncated { offset: ph.p_offset });
        }

        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        let end = target.checked_add(mem_size).unwrap_or(u64::MAX);
        if target < ram_start || end > ram_end {
            return Err(LoadError::OutOfRam {
                start: target,
                end,
                ram_start,
                ram_end,
            });
        }

        bus.write_blob(target, &image[file_offset..file_offset + file_size])?;
        if mem_size > file_size as u64 {
            let bss = vec![0u8; (mem_size - file_size as u64) as usize];
            bus.write_blob(target + file_size as u64, &bss)?;
        }
        log::debug!(
            "loader: segment {:#x}..{:#x} ({} bytes from file)",
            target,
            end,
            file_size
        );
    }

    let mut symbols = SymbolTable::default();
    for sym in elf.syms.iter() {
        let kind = sym.st_type();
        if sym.st_value == 0 || (kind != STT_FUNC && kind != STT_NOTYPE) {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if !name.is_empty() && !name.starts_with('$') {
                symbols.insert(sym.st_value, name);
            }
        }
    }

    log::info!(
        "loader: ELF entry={:#x}, {} symbols",
        elf.entry,
        symbols.len()
    );
    Ok(LoadedImage {
        entry: elf.entry,
        symbols,
    })
}
