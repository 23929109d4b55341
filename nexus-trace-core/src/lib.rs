//! Core reconstruction engine for a Nexus-style hardware instruction trace:
//! slice parsing, per-core counter bookkeeping, RISC-V instruction
//! classification, PC/branch-history reconstruction and cycle-accurate
//! correlation.
//!
//! The crate is organized the way the wire format is layered: bytes become
//! [`message::TraceMessage`]s ([`slice_parser`]), messages feed per-core
//! counters ([`counter_bank`]) and a PC walk ([`address_walker`]), and the
//! two combine in [`fsm`] to retire instructions one at a time through a
//! pull-style [`Decoder::next_instruction`] API.

pub mod address_walker;
pub mod ca_engine;
pub mod counter_bank;
mod error;
pub mod fsm;
pub mod instr_decode;
pub mod itc_perf_fsm;
pub mod itc_router;
pub mod message;
pub mod sink;
pub mod slice_parser;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
pub use fsm::Decoder;
pub use sink::{
    CrFlag, DecodeWarning, DecodedEvent, Disassembler, ExecutableLookup, RetiredInstruction,
    SourceLocation, StepOutcome,
};

/// Upper bound on concurrently-traced hart/core ids. Chosen to match the
/// widest `srcbits` this decoder accepts (3 bits).
pub const MAX_CORES: usize = 8;
