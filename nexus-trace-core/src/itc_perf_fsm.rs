//! Reconstructs `perf`-style counter samples and counter-definition records
//! carried over an ITC performance channel.
//!
//! Every record on a perf channel begins with a framing word whose low bit
//! selects what follows: a **counter definition** (type, mask, def, code,
//! event data, info, then a terminator) or a **sample** (address, call
//! site, value). A `GetCnts`/`GetAddr`/`GetCallSite` field is itself split
//! across two consecutive writes — low 32 bits then high 16 bits — via
//! [`WideValue`], the same convention used for ITC addresses elsewhere.
//! Samples additionally support the `Raw`/`Delta`/`DeltaXor` reconstruction
//! modes `AddressWalker`'s XOR-delta trick already uses, so repeated nearby
//! addresses/values cost fewer wire bits. A reserved marker word resets the
//! channel to `Sync` unconditionally, letting the encoder recover framing
//! after a dropped write without waiting for `Error` detection.

use std::collections::BTreeMap;

use crate::sink::DecodedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerfValueMode {
    #[default]
    Raw,
    Delta,
    DeltaXor,
}

/// A decoded performance-counter definition (`GetCntrDef`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDef {
    pub cnt_type: u64,
    pub cntr_mask: u64,
    pub def: u64,
    pub code: u64,
    pub event_data: u64,
    pub info: u64,
}

/// Assembles a 64-bit value from two writes: the low 32 bits, then the
/// high 16 bits. Values wider than 48 bits are not representable by this
/// wire convention.
#[derive(Debug, Clone, Copy, Default)]
struct WideValue {
    low: Option<u32>,
}

impl WideValue {
    fn feed(&mut self, raw: u64) -> Option<u64> {
        match self.low.take() {
            None => {
                self.low = Some(raw as u32);
                None
            }
            Some(low) => Some((low as u64) | ((raw & 0xffff) << 32)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync,
    GetCntType,
    GetCntrMask,
    GetCntrDef,
    GetCntrCode,
    GetCntrEventData,
    GetCntrInfo,
    GetCntrRecord,
    GetAddr,
    GetCallSite,
    GetCnts,
    Error,
}

impl Default for State {
    fn default() -> Self {
        State::Sync
    }
}

#[derive(Default)]
struct ChannelState {
    state: State,
    wide: WideValue,
    pending_def: CounterDef,
    address: u64,
    call_site: u64,
    last_address: u64,
    last_value: u64,
}

/// Per-(core, channel) performance-counter FSM.
pub struct ItcPerfFsm {
    address_mode: PerfValueMode,
    value_mode: PerfValueMode,
    marker: u64,
    channels: BTreeMap<(u8, u32), ChannelState>,
}

impl ItcPerfFsm {
    pub fn new(address_mode: PerfValueMode, value_mode: PerfValueMode) -> Self {
        Self::with_marker(address_mode, value_mode, u64::MAX)
    }

    pub fn with_marker(address_mode: PerfValueMode, value_mode: PerfValueMode, marker: u64) -> Self {
        ItcPerfFsm {
            address_mode,
            value_mode,
            marker,
            channels: BTreeMap::new(),
        }
    }

    fn reconstruct(mode: PerfValueMode, last: u64, raw: u64) -> u64 {
        match mode {
            PerfValueMode::Raw => raw,
            PerfValueMode::Delta => last.wrapping_add(raw),
            PerfValueMode::DeltaXor => last ^ raw,
        }
    }

    /// Feeds one raw ITC payload on `channel`. Returns `Some` once a
    /// complete counter definition or sample has been assembled.
    pub fn handle_payload(&mut self, core: u8, channel: u32, raw: u64) -> Option<DecodedEvent> {
        if raw == self.marker {
            self.channels.insert((core, channel), ChannelState::default());
            return None;
        }
        let entry = self.channels.entry((core, channel)).or_default();
        match entry.state {
            State::Sync => {
                if raw & 1 != 0 {
                    entry.pending_def = CounterDef::default();
                    entry.state = State::GetCntType;
                } else {
                    entry.wide = WideValue::default();
                    entry.state = State::GetAddr;
                }
                None
            }
            State::GetCntType => {
                entry.pending_def.cnt_type = raw;
                entry.state = State::GetCntrMask;
                None
            }
            State::GetCntrMask => {
                entry.pending_def.cntr_mask = raw;
                entry.state = State::GetCntrDef;
                None
            }
            State::GetCntrDef => {
                entry.pending_def.def = raw;
                entry.state = State::GetCntrCode;
                None
            }
            State::GetCntrCode => {
                entry.pending_def.code = raw;
                entry.state = State::GetCntrEventData;
                None
            }
            State::GetCntrEventData => {
                entry.pending_def.event_data = raw;
                entry.state = State::GetCntrInfo;
                None
            }
            State::GetCntrInfo => {
                entry.pending_def.info = raw;
                entry.state = State::GetCntrRecord;
                None
            }
            State::GetCntrRecord => {
                // the record terminator carries no field of its own.
                let def = entry.pending_def;
                entry.state = State::Sync;
                Some(DecodedEvent::CounterDef { core, channel, def })
            }
            State::GetAddr => {
                if let Some(combined) = entry.wide.feed(raw) {
                    entry.address = Self::reconstruct(self.address_mode, entry.last_address, combined);
                    entry.last_address = entry.address;
                    entry.wide = WideValue::default();
                    entry.state = State::GetCallSite;
                }
                None
            }
            State::GetCallSite => {
                if let Some(combined) = entry.wide.feed(raw) {
                    entry.call_site = combined;
                    entry.wide = WideValue::default();
                    entry.state = State::GetCnts;
                }
                None
            }
            State::GetCnts => {
                if let Some(combined) = entry.wide.feed(raw) {
                    let value = Self::reconstruct(self.value_mode, entry.last_value, combined);
                    entry.last_value = value;
                    let event = DecodedEvent::ItcPerfSample {
                        core,
                        channel,
                        address: entry.address,
                        value,
                        call_site: entry.call_site,
                    };
                    entry.state = State::Sync;
                    entry.wide = WideValue::default();
                    return Some(event);
                }
                None
            }
            State::Error => None,
        }
    }
}
