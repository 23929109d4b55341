//! The decoder's public surface: a pull iterator over retired
//! instructions and side events, built by driving
//! [`crate::slice_parser::SliceParser`] output through the counter bank,
//! address walker and ITC sub-engines.

use std::collections::VecDeque;
use std::io::Read;

use crate::address_walker::{AddressWalker, TraceType};
use crate::ca_engine::{CaEngine, CaMode, CaRecord};
use crate::counter_bank::CounterBank;
use crate::error::{Error, Result};
use crate::instr_decode::{self, ArchSize, InstrClass};
use crate::itc_perf_fsm::{ItcPerfFsm, PerfValueMode};
use crate::itc_router::{ItcPrintOpts, ItcRouter};
use crate::message::{BranchType, HistoryField, MessagePayload, TimestampField, TraceMessage};
use crate::sink::{
    CrFlag, DecodeWarning, DecodedEvent, ExecutableLookup, RetiredInstruction, StepOutcome,
};
use crate::slice_parser::{ParseError, ParseOutcome, SliceParser};
use crate::MAX_CORES;

/// Everything needed to stand up a [`Decoder`] beyond the byte stream and
/// the executable image, gathered in one place the way a `.properties`
/// config file on disk would set them.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub srcbits: u8,
    pub arch: ArchSize,
    pub itc_print_opts: ItcPrintOpts,
    pub itc_print_channel_mask: u32,
    pub perf_address_mode: PerfValueMode,
    pub perf_value_mode: PerfValueMode,
    /// Value seen on an ITC perf channel that forces it back to `Sync`
    /// regardless of its current state (`trace.config.int.itc.perf.marker`).
    pub perf_marker: u64,
    pub ca_mode: CaMode,
    /// Overrides automatic BTM→HTM promotion: `Some(Htm)` starts every core
    /// already promoted, `Some(Btm)` behaves like the default, `None`
    /// leaves promotion to the first history-carrying message (`--traceType`).
    pub force_trace_type: Option<TraceType>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            srcbits: 0,
            arch: ArchSize::Rv64,
            itc_print_opts: ItcPrintOpts::default(),
            itc_print_channel_mask: 1,
            perf_address_mode: PerfValueMode::default(),
            perf_value_mode: PerfValueMode::default(),
            perf_marker: u64::MAX,
            ca_mode: CaMode::None,
            force_trace_type: None,
        }
    }
}

/// Consumes history bits LSB-first; a consumed bit of `1` means taken.
fn pop_history_bit(history: &mut HistoryField) -> Option<bool> {
    if history.width == 0 {
        return None;
    }
    let taken = history.bits & 1 != 0;
    history.bits >>= 1;
    history.width -= 1;
    Some(taken)
}

/// Pulls retired instructions and side events out of a raw trace stream.
pub struct Decoder<R, L> {
    parser: SliceParser<R>,
    lookup: L,
    arch: ArchSize,
    counters: Vec<CounterBank>,
    walker: AddressWalker,
    itc_router: ItcRouter,
    itc_perf: ItcPerfFsm,
    ca_engine: CaEngine,
    last_time: [u64; MAX_CORES],
    /// Whether each core has seen a sync-reason (or ICT control) qualified
    /// to *start* retirement (the `GetFirstSync` state). Cleared by an
    /// `Error` tcode, which puts the core back in `GetFirstSync`.
    started: [bool; MAX_CORES],
    pending_cycles: [Option<u64>; MAX_CORES],
    queue: VecDeque<StepOutcome>,
    stream_ended: bool,
}

impl<R: Read, L: ExecutableLookup> Decoder<R, L> {
    pub fn new(reader: R, lookup: L, config: DecoderConfig) -> Self {
        let mut counters = Vec::with_capacity(MAX_CORES);
        counters.resize_with(MAX_CORES, CounterBank::new);
        let mut walker = AddressWalker::new();
        if matches!(config.force_trace_type, Some(TraceType::Htm)) {
            for core in 0..MAX_CORES as u8 {
                walker.promote_to_htm(core);
            }
        }
        Decoder {
            parser: SliceParser::new(reader, config.srcbits),
            lookup,
            arch: config.arch,
            counters,
            walker,
            itc_router: ItcRouter::with_print_channel_mask(
                config.itc_print_opts,
                config.itc_print_channel_mask,
            ),
            itc_perf: ItcPerfFsm::with_marker(
                config.perf_address_mode,
                config.perf_value_mode,
                config.perf_marker,
            ),
            ca_engine: CaEngine::new(config.ca_mode),
            last_time: [0; MAX_CORES],
            started: [false; MAX_CORES],
            pending_cycles: [None; MAX_CORES],
            queue: VecDeque::new(),
            stream_ended: false,
        }
    }

    /// Feeds one record from a companion cycle-accurate stream. Its cycle
    /// count is attached to the next instruction retired for `core`.
    pub fn feed_ca_record(&mut self, core: u8, record: CaRecord) {
        let correlation = self.ca_engine.correlate(core, record);
        if correlation.completes_instruction {
            self.pending_cycles[core as usize % MAX_CORES] = Some(correlation.cycles);
        }
    }

    /// Pulls the next decoded step. Returns [`StepOutcome::Eof`] once the
    /// stream is exhausted; further calls keep returning `Eof`. Returns
    /// `Err` for two fatal conditions: an unreadable stream, and a clean
    /// end of stream before any core ever started retiring instructions.
    pub fn next_instruction(&mut self) -> Result<StepOutcome> {
        if let Some(outcome) = self.queue.pop_front() {
            return Ok(outcome);
        }
        if self.stream_ended {
            return Ok(StepOutcome::Eof);
        }
        loop {
            match self.parser.read_next_trace_msg() {
                Err(ParseError::Io(e)) => {
                    self.stream_ended = true;
                    return Err(Error::UnreadableStream(e));
                }
                Err(ParseError::TruncatedMessage) => {
                    log::warn!("trace stream ended mid-message");
                    self.stream_ended = true;
                    return Ok(StepOutcome::Eof);
                }
                Ok(ParseOutcome::Eof) => {
                    self.stream_ended = true;
                    if !self.started.iter().any(|&s| s) {
                        return Err(Error::EofBeforeFirstSync);
                    }
                    for event in self.itc_router.flush_all() {
                        self.queue.push_back(StepOutcome::Event(event));
                    }
                    return Ok(self.queue.pop_front().unwrap_or(StepOutcome::Eof));
                }
                Ok(ParseOutcome::Message(msg)) => {
                    self.handle_message(msg)?;
                    if let Some(outcome) = self.queue.pop_front() {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    fn reconstruct_timestamp(&mut self, core: u8, field: Option<TimestampField>) -> Option<u64> {
        let field = field?;
        let slot = &mut self.last_time[core as usize % MAX_CORES];
        *slot = match field {
            TimestampField::Full(v) => v,
            TimestampField::Relative(v) => *slot ^ v,
        };
        Some(*slot)
    }

    fn take_pending_cycles(&mut self, core: u8) -> Option<u64> {
        self.pending_cycles[core as usize % MAX_CORES].take()
    }

    /// Marks `core` as having started retirement if `can_start` is set, and
    /// reports whether retirement may proceed now (either already started,
    /// or starting on this very message).
    fn gate_retire(&mut self, core: u8, can_start: bool) -> bool {
        let idx = core as usize % MAX_CORES;
        if self.started[idx] {
            return true;
        }
        if can_start {
            self.started[idx] = true;
            true
        } else {
            false
        }
    }

    fn fetch_and_decode(&self, core: u8, pc: u64) -> Option<(instr_decode::Decoded, u32, [u8; 4])> {
        let bytes = self.lookup.read_instruction_bytes(core, pc)?;
        let raw16 = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        let is_compressed = raw16 & 0b11 != 0b11;
        let raw = if is_compressed {
            raw16
        } else {
            u32::from_le_bytes(bytes)
        };
        Some((instr_decode::decode(raw, self.arch), raw, bytes))
    }

    /// Control-flow flags implied purely by an instruction's own decoded
    /// class, independent of any branch message: `ecall`/`ebreak` are
    /// always an exception entry, `mret`/
    /// `sret`/`uret` always an exception return, regardless of whether a
    /// branch message happens to resolve this instruction.
    fn class_flags(class: InstrClass) -> CrFlag {
        match class {
            InstrClass::Ecall | InstrClass::Ebreak => CrFlag::EXCEPTION,
            InstrClass::TrapReturn => CrFlag::EXCEPTION_RETURN,
            _ => CrFlag::empty(),
        }
    }

    fn retire_one(&mut self, core: u8, pc: u64, extra_flags: CrFlag, timestamp: Option<u64>) -> (RetiredInstruction, InstrClass) {
        let (decoded, raw, _) = match self.fetch_and_decode(core, pc) {
            Some(v) => v,
            None => {
                // unmapped PC: report a zero-size, classless instruction so
                // the caller still advances rather than looping forever.
                let instr = RetiredInstruction {
                    core,
                    pc,
                    size: 0,
                    raw: None,
                    branch_type: None,
                    flags: extra_flags,
                    timestamp,
                    cycle_count: self.take_pending_cycles(core),
                    source: self.lookup.resolve_source(pc),
                };
                return (instr, InstrClass::Other);
            }
        };
        let instr = RetiredInstruction {
            core,
            pc,
            size: decoded.size,
            raw: Some(raw),
            branch_type: None,
            flags: extra_flags | Self::class_flags(decoded.class),
            timestamp,
            cycle_count: self.take_pending_cycles(core),
            source: self.lookup.resolve_source(pc),
        };
        (instr, decoded.class)
    }

    /// Walks `count` instructions sequentially from `core`'s current PC,
    /// consuming HTM history bits to resolve any direct branches
    /// encountered before the final (triggering) instruction, and draining
    /// `count` itself through the core's [`CounterBank`] rather than a raw
    /// loop counter. Returns the final instruction's class so the caller
    /// can resolve its target.
    ///
    /// Under HTM, a conditional branch with no history bit left to consume
    /// mid-walk is a logic error: the encoder promised history for every
    /// branch this core retires once promoted, so running dry before the
    /// walk's own count is exhausted means the two are desynchronized.
    fn walk_straight_line(
        &mut self,
        core: u8,
        count: u64,
        history: &mut Option<HistoryField>,
    ) -> Result<(Vec<RetiredInstruction>, InstrClass)> {
        let idx = core as usize % MAX_CORES;
        self.counters[idx].set_i_cnt(count);
        let mut retired = Vec::new();
        let mut last_class = InstrClass::Other;
        loop {
            let pc = self.walker.last_f_addr(core);
            let (instr, class) = self.retire_one(core, pc, CrFlag::empty(), None);
            let size = instr.size.max(1) as u64;
            last_class = class;
            retired.push(instr);

            let exhausted = self.counters[idx].tick_i_cnt();
            if exhausted {
                break;
            }

            if class.is_branch() {
                let taken = match history.as_mut().and_then(pop_history_bit) {
                    Some(taken) => taken,
                    None if self.walker.trace_type(core) == TraceType::Htm => {
                        self.counters[idx].clear_i_cnt();
                        return Err(Error::CountExhaustionLogicError { core });
                    }
                    None => false,
                };
                if taken {
                    let raw = self
                        .fetch_and_decode(core, pc)
                        .map(|(_, raw, _)| raw)
                        .unwrap_or(0);
                    let offset = instr_decode::direct_branch_offset(raw, size as u8);
                    let target = (pc as i64 + offset) as u64;
                    self.walker.record_pc(core, target);
                } else {
                    self.walker.record_pc(core, pc + size);
                }
            } else {
                self.walker.record_pc(core, pc + size);
            }
        }
        self.counters[idx].clear_i_cnt();
        Ok((retired, last_class))
    }

    fn branch_taken_flags(class: InstrClass, b_type: Option<BranchType>) -> CrFlag {
        let mut flags = CrFlag::empty();
        match class {
            InstrClass::Call | InstrClass::IndirectCall => flags |= CrFlag::CALL,
            InstrClass::Return => flags |= CrFlag::RETURN,
            InstrClass::Swap => flags |= CrFlag::CALL | CrFlag::RETURN | CrFlag::SWAP,
            _ => {}
        }
        if matches!(b_type, Some(BranchType::Exception)) {
            flags |= CrFlag::EXCEPTION;
        }
        flags
    }

    fn handle_message(&mut self, msg: TraceMessage) -> Result<()> {
        let core = msg.core;
        if (core as usize) >= MAX_CORES {
            self.stream_ended = true;
            return Err(Error::CoreIdOutOfRange(core));
        }
        if msg.payload.carries_history() {
            self.walker.promote_to_htm(core);
        }

        let timestamp = self.reconstruct_timestamp(core, msg.timestamp);

        match msg.payload {
            MessagePayload::Sync { f_addr, reason } => {
                self.walker.sync_to(core, f_addr);
                self.counters[core as usize].reset();
                let can_start = reason.can_start_trace();
                if can_start {
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::TraceEnabled { core }));
                }
                if self.gate_retire(core, can_start) {
                    let (instr, _) = self.retire_one(core, f_addr, CrFlag::SYNC_POINT, timestamp);
                    let size = instr.size.max(1) as u64;
                    self.walker.record_pc(core, f_addr + size);
                    self.queue.push_back(StepOutcome::Retired(instr));
                } else {
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }));
                }
            }
            MessagePayload::DirectBranch { i_cnt } => {
                self.emit_direct_walk(core, i_cnt, timestamp, None)?;
            }
            MessagePayload::DirectBranchWs {
                f_addr,
                i_cnt,
                b_type: _,
            } => {
                self.walker.sync_to(core, f_addr);
                self.counters[core as usize].reset();
                if self.gate_retire(core, false) {
                    let (anchor, _) = self.retire_one(core, f_addr, CrFlag::SYNC_POINT, timestamp);
                    let size = anchor.size.max(1) as u64;
                    self.walker.record_pc(core, f_addr + size);
                    self.queue.push_back(StepOutcome::Retired(anchor));
                    if let Some(i_cnt) = i_cnt {
                        self.emit_direct_walk(core, i_cnt, None, None)?;
                    }
                } else {
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }));
                }
            }
            MessagePayload::IndirectBranch {
                i_cnt,
                u_addr,
                b_type,
            } => {
                self.emit_indirect_walk(core, i_cnt, u_addr, Some(b_type), timestamp, None)?;
            }
            MessagePayload::IndirectBranchWs {
                f_addr,
                i_cnt,
                b_type,
                u_addr,
            } => {
                self.walker.sync_to(core, f_addr);
                self.counters[core as usize].reset();
                if self.gate_retire(core, false) {
                    let (anchor, _) = self.retire_one(core, f_addr, CrFlag::SYNC_POINT, timestamp);
                    let size = anchor.size.max(1) as u64;
                    self.walker.record_pc(core, f_addr + size);
                    self.queue.push_back(StepOutcome::Retired(anchor));
                    if let (Some(i_cnt), Some(u_addr)) = (i_cnt, u_addr) {
                        self.emit_indirect_walk(core, i_cnt, u_addr, b_type, None, None)?;
                    }
                } else {
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }));
                }
            }
            MessagePayload::IndirectBranchHistory {
                i_cnt,
                u_addr,
                b_type,
                history,
            } => {
                self.emit_indirect_walk(
                    core,
                    i_cnt,
                    u_addr,
                    Some(b_type),
                    timestamp,
                    Some(history),
                )?;
            }
            MessagePayload::IndirectBranchHistoryWs {
                f_addr,
                i_cnt,
                b_type: _,
                history,
            } => {
                self.walker.sync_to(core, f_addr);
                self.counters[core as usize].reset();
                if self.gate_retire(core, false) {
                    let (anchor, _) = self.retire_one(core, f_addr, CrFlag::SYNC_POINT, timestamp);
                    let size = anchor.size.max(1) as u64;
                    self.walker.record_pc(core, f_addr + size);
                    self.queue.push_back(StepOutcome::Retired(anchor));
                    if let Some(i_cnt) = i_cnt {
                        let mut hist = Some(history);
                        let (retired, _) = self.walk_straight_line(core, i_cnt, &mut hist)?;
                        for instr in retired {
                            self.queue.push_back(StepOutcome::Retired(instr));
                        }
                    }
                } else {
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }));
                }
            }
            MessagePayload::ResourceFull(payload) => {
                self.counters[core as usize].push_resource_full(payload);
            }
            MessagePayload::Correlation { i_cnt, cdf } => {
                let mut hist = None;
                let (retired, _) = self.walk_straight_line(core, i_cnt, &mut hist)?;
                for instr in retired {
                    self.queue.push_back(StepOutcome::Retired(instr));
                }
                self.queue
                    .push_back(StepOutcome::Event(DecodedEvent::Correlation { core, cdf }));
            }
            MessagePayload::OwnershipTrace { process_tag } => {
                self.queue.push_back(StepOutcome::Event(
                    DecodedEvent::Ownership { core, process_tag },
                ));
            }
            MessagePayload::AuxAccessWrite {
                channel,
                width,
                data,
            } => {
                for event in self.itc_router.handle_write(core, channel, width, data) {
                    self.queue.push_back(StepOutcome::Event(event));
                }
            }
            MessagePayload::DataAcquisition {
                channel,
                width: _,
                data,
            } => {
                if let Some(event) = self.itc_perf.handle_payload(core, channel, data) {
                    self.queue.push_back(StepOutcome::Event(event));
                }
            }
            MessagePayload::InCircuitTrace {
                cksrc,
                control,
                data,
                ..
            } => {
                self.handle_ict(core, cksrc, control, data);
            }
            MessagePayload::InCircuitTraceWs {
                f_addr,
                cksrc,
                control,
                data,
                ..
            } => {
                self.walker.sync_to(core, f_addr);
                self.handle_ict(core, cksrc, control, data);
            }
            MessagePayload::Error => {
                // An Error tcode resets this core back to GetFirstSync, not
                // a permanent halt. Subsequent Sync/ICT control messages
                // restart retirement exactly as if this were the first
                // sync ever seen.
                self.walker.reset(core);
                self.counters[core as usize].reset();
                self.last_time[core as usize] = 0;
                self.pending_cycles[core as usize] = None;
                self.started[core as usize] = false;
                self.queue
                    .push_back(StepOutcome::Event(DecodedEvent::MissedMessages { core }));
            }
            MessagePayload::Unsupported(tcode) => {
                self.queue.push_back(StepOutcome::Warning(
                    DecodeWarning::UnsupportedMessage { core, tcode },
                ));
            }
        }
        Ok(())
    }

    fn handle_ict(
        &mut self,
        core: u8,
        cksrc: crate::message::IctSource,
        control: Option<crate::message::IctControl>,
        data: [u64; 2],
    ) {
        use crate::message::{IctControl, IctSource};
        match cksrc {
            IctSource::Watchpoint => {
                self.queue.push_back(StepOutcome::Event(DecodedEvent::Watchpoint {
                    core,
                    pc: data[0],
                }));
            }
            IctSource::Exception | IctSource::Interrupt => {
                // data[0] is lastFaddr XORed against the exception/interrupt
                // vector, the same XOR-delta convention an indirect branch's
                // u_addr uses.
                let pc = self.walker.last_f_addr(core);
                let extra = if cksrc == IctSource::Exception {
                    CrFlag::EXCEPTION
                } else {
                    CrFlag::INTERRUPT
                };
                let (instr, _) = self.retire_one(core, pc, extra, None);
                self.walker.resolve_xor_delta(core, data[0]);
                self.queue.push_back(StepOutcome::Retired(instr));
            }
            IctSource::Control => match control {
                Some(IctControl::TraceOn) => {
                    self.started[core as usize % MAX_CORES] = true;
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::TraceEnabled { core }));
                }
                Some(IctControl::ExitDebug) => {
                    self.started[core as usize % MAX_CORES] = true;
                    self.queue
                        .push_back(StepOutcome::Event(DecodedEvent::TraceDisabled { core }));
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Walks `i_cnt` instructions and resolves the final one as a direct
    /// transfer (branch/jump/call), advancing `lastFaddr` to its target.
    fn emit_direct_walk(
        &mut self,
        core: u8,
        i_cnt: u64,
        timestamp: Option<u64>,
        mut history: Option<HistoryField>,
    ) -> Result<()> {
        let (mut retired, class) = self.walk_straight_line(core, i_cnt, &mut history)?;
        if let Some(last) = retired.last_mut() {
            last.timestamp = timestamp;
            last.flags |= Self::branch_taken_flags(class, None);
            if class.is_direct_transfer() {
                if let Some((_, raw, _)) = self.fetch_and_decode(core, last.pc) {
                    let offset = instr_decode::direct_branch_offset(raw, last.size);
                    let target = (last.pc as i64 + offset) as u64;
                    self.walker.record_pc(core, target);
                }
            } else {
                let size = last.size.max(1) as u64;
                self.walker.record_pc(core, last.pc + size);
            }
        }
        for instr in retired {
            self.queue.push_back(StepOutcome::Retired(instr));
        }
        Ok(())
    }

    /// Walks `i_cnt` instructions and resolves the final one's target from
    /// `u_addr`, XORed against `lastFaddr`.
    fn emit_indirect_walk(
        &mut self,
        core: u8,
        i_cnt: u64,
        u_addr: u64,
        b_type: Option<BranchType>,
        timestamp: Option<u64>,
        mut history: Option<HistoryField>,
    ) -> Result<()> {
        let (mut retired, class) = self.walk_straight_line(core, i_cnt, &mut history)?;
        if let Some(last) = retired.last_mut() {
            last.timestamp = timestamp;
            last.branch_type = b_type;
            last.flags |= Self::branch_taken_flags(class, b_type);
            if class.is_indirect_transfer() {
                let target = self.walker.resolve_xor_delta(core, u_addr);
                self.walker.record_pc(core, target);
            } else {
                self.queue.push_back(StepOutcome::Warning(
                    DecodeWarning::UnknownNextAddress {
                        core,
                        from_pc: last.pc,
                    },
                ));
            }
            let size = last.size.max(1) as u64;
            match class {
                InstrClass::Call | InstrClass::IndirectCall => {
                    self.counters[core as usize].push_return_address(last.pc + size);
                }
                InstrClass::Return => {
                    if self.counters[core as usize].pop_return_address().is_none() {
                        self.queue.push_back(StepOutcome::Warning(
                            DecodeWarning::ReturnStackUnderflow { core, pc: last.pc },
                        ));
                    }
                }
                InstrClass::Swap => {
                    if self.counters[core as usize].pop_return_address().is_none() {
                        self.queue.push_back(StepOutcome::Warning(
                            DecodeWarning::ReturnStackUnderflow { core, pc: last.pc },
                        ));
                    }
                    self.counters[core as usize].push_return_address(last.pc + size);
                }
                _ => {}
            }
        }
        for instr in retired {
            self.queue.push_back(StepOutcome::Retired(instr));
        }
        Ok(())
    }
}
