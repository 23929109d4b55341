//! Memory-maps an ELF executable and answers the two questions
//! [`nexus_trace_core::ExecutableLookup`] needs: what bytes sit at a PC,
//! and what source line (if any) that PC maps to.

use std::fs::File;
use std::rc::Rc;
use std::sync::Arc;

use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use rangemap::RangeMap;

use nexus_trace_core::{ExecutableLookup, SourceLocation};

use crate::error::{Error, Result};
use crate::path_rewrite::PathRewriter;

type Addr2lineContext = addr2line::Context<EndianRcSlice<RunTimeEndian>>;

#[derive(Clone, PartialEq)]
struct Section {
    base: u64,
    bytes: Arc<[u8]>,
}

/// An ELF image loaded for instruction-byte and source-line lookup. One
/// instance covers a single core's current executable; a multi-process
/// trace uses one [`ElfImage`] per `process_tag`/core pair.
pub struct ElfImage {
    sections: RangeMap<u64, Section>,
    symbols: RangeMap<u64, String>,
    context: Option<Addr2lineContext>,
    rewriter: PathRewriter,
    // Keeps the backing mmap alive for the lifetime of borrowed slices
    // copied out of it during construction.
    _mmap: memmap2::Mmap,
}

impl ElfImage {
    pub fn open(path: &str, rewriter: PathRewriter) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        // Safety: the file is not expected to be mutated concurrently by
        // another process while this decoder run is reading it; the same
        // assumption every mmap-based object reader in this ecosystem
        // makes.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;

        let obj = object::File::parse(&mmap[..])?;

        let mut sections = RangeMap::new();
        for section in obj.sections() {
            let addr = section.address();
            let size = section.size();
            if size == 0 || addr == 0 {
                continue;
            }
            if let Ok(data) = section.data() {
                sections.insert(
                    addr..addr + size,
                    Section {
                        base: addr,
                        bytes: Arc::from(data),
                    },
                );
            }
        }

        let mut symbols = RangeMap::new();
        for symbol in obj.symbols() {
            if symbol.kind() != SymbolKind::Text || symbol.size() == 0 {
                continue;
            }
            let name = symbol
                .name()
                .ok()
                .map(|n| rustc_demangle::demangle(n).to_string())
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            symbols.insert(symbol.address()..symbol.address() + symbol.size(), name);
        }

        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> std::result::Result<_, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or_default();
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let context = gimli::Dwarf::load(load_section)
            .ok()
            .and_then(|dwarf| addr2line::Context::from_dwarf(dwarf).ok());

        Ok(ElfImage {
            sections,
            symbols,
            context,
            rewriter,
            _mmap: mmap,
        })
    }
}

impl ExecutableLookup for ElfImage {
    fn read_instruction_bytes(&self, _core: u8, pc: u64) -> Option<[u8; 4]> {
        let section = self.sections.get(&pc)?;
        let offset = (pc - section.base) as usize;
        let mut out = [0u8; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = *section.bytes.get(offset + i).unwrap_or(&0);
        }
        Some(out)
    }

    fn resolve_source(&self, pc: u64) -> Option<SourceLocation> {
        let context = self.context.as_ref()?;
        let location = context.find_location(pc).ok().flatten()?;
        let file = location.file?;
        let function = self.symbols.get(&pc).cloned();
        Some(SourceLocation {
            file: self.rewriter.rewrite(file),
            line: location.line.unwrap_or(0),
            function,
        })
    }
}
