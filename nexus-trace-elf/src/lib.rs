//! ELF/DWARF executable-image support for `nexus-trace-core`: an
//! [`ExecutableLookup`] implementation backed by `object`/`addr2line`, a
//! minimal RISC-V disassembler, and source-path rewriting.

pub mod disasm;
mod error;
pub mod image;
pub mod path_rewrite;

pub use disasm::MinimalRiscVDisassembler;
pub use error::{Error, Result};
pub use image::ElfImage;
pub use nexus_trace_core::ExecutableLookup;
pub use path_rewrite::{PathRewriteRule, PathRewriter};
