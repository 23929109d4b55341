//! Types at the boundary between this crate and the rest of the world:
//! what the decoder asks of an executable image, and what it hands back
//! per pull of [`crate::fsm::Decoder::next_instruction`].

use bitflags::bitflags;

use crate::itc_perf_fsm::CounterDef;
use crate::message::BranchType;

bitflags! {
    /// Control-flow annotations attached to a retired instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CrFlag: u16 {
        /// This instruction is the target of a taken branch/jump/return.
        const BRANCH_TARGET = 1 << 0;
        /// This instruction retired immediately after a taken branch.
        const AFTER_TAKEN_BRANCH = 1 << 1;
        /// Retirement was inferred from an `i_cnt`, not witnessed directly.
        const INFERRED = 1 << 2;
        /// First instruction traced after a sync/full-address message.
        const SYNC_POINT = 1 << 3;
        /// Instruction is a trap/exception entry (`ecall`/`ebreak`).
        const EXCEPTION = 1 << 4;
        /// Instruction is an interrupt entry.
        const INTERRUPT = 1 << 5;
        /// Instruction is a function call (inferred from decode class).
        const CALL = 1 << 6;
        /// Instruction is a function return (inferred from decode class).
        const RETURN = 1 << 7;
        /// Instruction is a trap return (`mret`/`sret`/`uret`).
        const EXCEPTION_RETURN = 1 << 8;
        /// Instruction is a `jalr` "swap": pops the return stack and
        /// immediately pushes a new return address (`rd`/`rs1` both link
        /// registers, but distinct).
        const SWAP = 1 << 9;
    }
}

/// Resolved file/line for a retired PC, when debug info is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

/// One retired instruction, with everything downstream converters need:
/// reconstructed PC, decoded flags, and cycle correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetiredInstruction {
    pub core: u8,
    pub pc: u64,
    /// Instruction size in bytes: 2 for RVC, 4 otherwise.
    pub size: u8,
    pub raw: Option<u32>,
    pub branch_type: Option<BranchType>,
    pub flags: CrFlag,
    pub timestamp: Option<u64>,
    pub cycle_count: Option<u64>,
    pub source: Option<SourceLocation>,
}

/// A non-instruction event the decoder surfaces inline with retirement,
/// destined for the CTF/event-log/perf converters.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    ItcPrint {
        core: u8,
        channel: u32,
        text: Vec<u8>,
    },
    ItcPerfSample {
        core: u8,
        channel: u32,
        address: u64,
        value: u64,
        call_site: u64,
    },
    /// A counter-definition record decoded by `ITCPerfFSM`'s `GetCntrDef`
    /// state, emitted once per counter before any of its samples.
    CounterDef {
        core: u8,
        channel: u32,
        def: CounterDef,
    },
    Ownership {
        core: u8,
        process_tag: u64,
    },
    Correlation {
        core: u8,
        cdf: bool,
    },
    Watchpoint {
        core: u8,
        pc: u64,
    },
    TraceEnabled {
        core: u8,
    },
    TraceDisabled {
        core: u8,
    },
    /// A `Sync` arrived for a reason that cannot start retirement
    /// (`Evti`/`PcSample`/`Watchpoint`/`Overflow`) before the core has ever
    /// seen a qualifying sync. Surfaced instead of retiring at `f_addr`.
    SyncObserved {
        core: u8,
        f_addr: u64,
    },
    /// An `Error` tcode reset this core's state back to `GetFirstSync`.
    MissedMessages {
        core: u8,
    },
}

/// A recoverable decode anomaly. These never stop the decoder; they are
/// surfaced so converters can annotate their output and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    /// An indirect branch's target could not be resolved (no executable
    /// image covers `u_addr`, or `u_addr` was itself missing).
    UnknownNextAddress { core: u8, from_pc: u64 },
    /// A count reached zero at a point the walk did not expect.
    CountExhaustedEarly { core: u8, pc: u64 },
    /// [`crate::slice_parser::SliceParser`] resynchronized after malformed
    /// framing.
    MalformedMessage { core: u8 },
    /// A tcode this decoder does not implement.
    UnsupportedMessage { core: u8, tcode: u8 },
    /// The return-address stack underflowed on an inferred return.
    ReturnStackUnderflow { core: u8, pc: u64 },
}

/// One pull of [`crate::fsm::Decoder::next_instruction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Retired(RetiredInstruction),
    Event(DecodedEvent),
    Warning(DecodeWarning),
    /// The current message queue is empty; feed more bytes and call again.
    NeedMoreData,
    /// Clean end of trace.
    Eof,
}

/// What the decoder needs from an executable image to walk PCs and
/// annotate retired instructions. Implemented against ELF+DWARF by
/// `nexus-trace-elf`; trivially mockable in tests.
pub trait ExecutableLookup {
    /// Reads up to 4 bytes of instruction encoding at `pc` for the given
    /// core's current image. Returns fewer than 4 bytes at the end of a
    /// mapped region; `None` if `pc` is not mapped at all.
    fn read_instruction_bytes(&self, core: u8, pc: u64) -> Option<[u8; 4]>;

    /// Resolves `pc` to a source location, if debug info covers it.
    fn resolve_source(&self, pc: u64) -> Option<SourceLocation> {
        let _ = pc;
        None
    }
}

/// Produces a human-readable mnemonic for a decoded instruction. Optional:
/// the decoder itself only needs instruction *class* (branch/call/return/
/// other) from [`crate::instr_decode`], not a full disassembly.
pub trait Disassembler {
    fn disassemble(&self, bytes: &[u8], pc: u64) -> Option<String>;
}
