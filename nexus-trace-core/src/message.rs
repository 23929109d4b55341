//! The [`TraceMessage`] data model: a tagged record with a `tcode` tag and
//! a per-tag payload, as produced by [`crate::slice_parser::SliceParser`].

/// Reason a `Sync`/`*WS` message was emitted.
///
/// Only `ExitDebug` and `TraceEnable` are capable of *starting* a trace;
/// the others are periodic/ownership syncs that re-anchor `lastFaddr`
/// without implying the trace was off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    ExitDebug,
    TraceEnable,
    Evti,
    PcSample,
    Watchpoint,
    Overflow,
    Other(u8),
}

impl SyncReason {
    pub fn can_start_trace(self) -> bool {
        matches!(self, SyncReason::ExitDebug | SyncReason::TraceEnable)
    }
}

/// `b_type` field carried by branch messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchType {
    Indirect,
    Exception,
    Other(u8),
}

/// In-circuit-trace event source (`cksrc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IctSource {
    ExtTrig,
    Watchpoint,
    InferableCall,
    Exception,
    Interrupt,
    Context,
    PcSample,
    Control,
}

/// ICT `Control` sub-reason, relevant only when `cksrc == Control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IctControl {
    TraceOn,
    ExitDebug,
    Other(u64),
}

/// Width encoded in the low 2 bits of an ITC channel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItcWidth {
    W32,
    W16,
    W8,
}

impl ItcWidth {
    pub fn from_low_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => ItcWidth::W32,
            0b10 => ItcWidth::W16,
            0b11 => ItcWidth::W8,
            _ => ItcWidth::W32, // 0b01 is reserved; fail closed to the widest width
        }
    }
}

/// A history bitstring carried by `IndirectBranchHistory[WS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryField {
    pub bits: u64,
    pub width: u8,
}

/// The sub-payload of a `ResourceFull` message. At most one is carried per
/// message, but consecutive `ResourceFull` messages layer onto the same
/// [`crate::counter_bank::CounterBank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceFullPayload {
    HistoryContinuation(HistoryField),
    TakenCount(u64),
    NotTakenCount(u64),
    ICount(u64),
}

/// Full/relative timestamp field attached to most messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    /// Replaces the low `tsSize` bits of `lastTime`.
    Full(u64),
    /// XORed into `lastTime`.
    Relative(u64),
}

/// A fully decoded trace message for one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceMessage {
    pub core: u8,
    pub timestamp: Option<TimestampField>,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Sync {
        f_addr: u64,
        reason: SyncReason,
    },
    DirectBranchWs {
        f_addr: u64,
        i_cnt: Option<u64>,
        b_type: Option<BranchType>,
    },
    IndirectBranchWs {
        f_addr: u64,
        i_cnt: Option<u64>,
        b_type: Option<BranchType>,
        u_addr: Option<u64>,
    },
    DirectBranch {
        i_cnt: u64,
    },
    IndirectBranch {
        i_cnt: u64,
        u_addr: u64,
        b_type: BranchType,
    },
    IndirectBranchHistory {
        i_cnt: u64,
        u_addr: u64,
        b_type: BranchType,
        history: HistoryField,
    },
    IndirectBranchHistoryWs {
        f_addr: u64,
        i_cnt: Option<u64>,
        b_type: Option<BranchType>,
        history: HistoryField,
    },
    ResourceFull(ResourceFullPayload),
    Correlation {
        i_cnt: u64,
        cdf: bool,
    },
    OwnershipTrace {
        process_tag: u64,
    },
    AuxAccessWrite {
        channel: u32,
        width: ItcWidth,
        data: u64,
    },
    DataAcquisition {
        channel: u32,
        width: ItcWidth,
        data: u64,
    },
    InCircuitTrace {
        cksrc: IctSource,
        control: Option<IctControl>,
        ckdf: bool,
        data: [u64; 2],
        data_len: u8,
    },
    InCircuitTraceWs {
        f_addr: u64,
        cksrc: IctSource,
        control: Option<IctControl>,
        ckdf: bool,
        data: [u64; 2],
        data_len: u8,
    },
    Error,
    /// A tcode this decoder does not implement. Fails closed: the message
    /// is surfaced but never drives instruction retirement.
    Unsupported(u8),
}

impl MessagePayload {
    /// True for messages carrying an absolute PC (`f_addr`), which reset
    /// per-core `lastFaddr`, counts and the return stack.
    pub fn is_absolute_pc(&self) -> bool {
        matches!(
            self,
            MessagePayload::Sync { .. }
                | MessagePayload::DirectBranchWs { .. }
                | MessagePayload::IndirectBranchWs { .. }
                | MessagePayload::IndirectBranchHistoryWs { .. }
                | MessagePayload::InCircuitTraceWs { .. }
        )
    }

    pub fn f_addr(&self) -> Option<u64> {
        match *self {
            MessagePayload::Sync { f_addr, .. }
            | MessagePayload::DirectBranchWs { f_addr, .. }
            | MessagePayload::IndirectBranchWs { f_addr, .. }
            | MessagePayload::IndirectBranchHistoryWs { f_addr, .. }
            | MessagePayload::InCircuitTraceWs { f_addr, .. } => Some(f_addr),
            _ => None,
        }
    }

    /// True for messages that carry history bits, which permanently
    /// promote the per-core trace-type mode to HTM.
    pub fn carries_history(&self) -> bool {
        matches!(
            self,
            MessagePayload::IndirectBranchHistory { .. }
                | MessagePayload::IndirectBranchHistoryWs { .. }
                | MessagePayload::ResourceFull(ResourceFullPayload::HistoryContinuation(_))
                | MessagePayload::Correlation { cdf: true, .. }
        )
    }

    /// True for sync-reason-gated messages able to *begin* tracing.
    pub fn can_start_trace(&self) -> bool {
        match self {
            MessagePayload::Sync { reason, .. } => reason.can_start_trace(),
            MessagePayload::InCircuitTrace {
                cksrc: IctSource::Control,
                control: Some(c),
                ..
            }
            | MessagePayload::InCircuitTraceWs {
                cksrc: IctSource::Control,
                control: Some(c),
                ..
            } => matches!(c, IctControl::TraceOn | IctControl::ExitDebug),
            _ => false,
        }
    }
}
