//! Per-core PC reconstruction: `lastFaddr` bookkeeping, XOR-delta target
//! recovery and the one-way BTM→HTM trace-type promotion.
//!
//! Two trace types exist: BTM (Branch Target Messaging) reports taken/
//! not-taken counts and leaves the decoder to walk straight-line code
//! itself, while HTM (History Trace Messaging) additionally reports a
//! branch-history bitstring so direct conditional branches don't need a
//! count message at all. A core starts in BTM and is promoted to HTM the
//! first time it emits a history-carrying message; the promotion is
//! one-way; a decoder never has a reason to need to see BTM-only behavior
//! again once the encoder starts sending history.

use crate::MAX_CORES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceType {
    Btm,
    Htm,
}

#[derive(Debug, Clone, Copy)]
struct WalkState {
    trace_type: TraceType,
    last_f_addr: u64,
    synced: bool,
}

impl Default for WalkState {
    fn default() -> Self {
        WalkState {
            trace_type: TraceType::Btm,
            last_f_addr: 0,
            synced: false,
        }
    }
}

/// What the walker decided the next PC is, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Sequential/direct-branch fallthrough or direct-transfer target;
    /// computable without trace input.
    Computed(u64),
    /// Target came from the message's `u_addr`, XORed against `lastFaddr`.
    FromXorDelta(u64),
    /// Target came from a message's absolute `f_addr`.
    Absolute(u64),
    /// No trace information and no direct-transfer target: the walk
    /// cannot proceed until the next message arrives.
    Unknown,
}

/// Per-core PC walk state, indexed by core id.
pub struct AddressWalker {
    cores: [WalkState; MAX_CORES],
}

impl Default for AddressWalker {
    fn default() -> Self {
        AddressWalker {
            cores: [WalkState::default(); MAX_CORES],
        }
    }
}

impl AddressWalker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, core: u8) -> &WalkState {
        &self.cores[core as usize % MAX_CORES]
    }

    fn state_mut(&mut self, core: u8) -> &mut WalkState {
        &mut self.cores[core as usize % MAX_CORES]
    }

    pub fn trace_type(&self, core: u8) -> TraceType {
        self.state(core).trace_type
    }

    pub fn is_synced(&self, core: u8) -> bool {
        self.state(core).synced
    }

    pub fn last_f_addr(&self, core: u8) -> u64 {
        self.state(core).last_f_addr
    }

    /// Applies an absolute address from a sync/`*WS` message, re-anchoring
    /// `lastFaddr`. Does not itself change trace type: a WS message can
    /// arrive on an already-HTM core without demoting it.
    pub fn sync_to(&mut self, core: u8, f_addr: u64) {
        let state = self.state_mut(core);
        state.last_f_addr = f_addr;
        state.synced = true;
    }

    /// Applies a XOR-delta `u_addr` against `lastFaddr`, returning and
    /// recording the resolved absolute address.
    pub fn resolve_xor_delta(&mut self, core: u8, u_addr: u64) -> u64 {
        let state = self.state_mut(core);
        let resolved = state.last_f_addr ^ u_addr;
        state.last_f_addr = resolved;
        resolved
    }

    /// Records a plain (non-branch-target) retirement's address, so the
    /// next XOR-delta resolves against the right base.
    pub fn record_pc(&mut self, core: u8, pc: u64) {
        self.state_mut(core).last_f_addr = pc;
    }

    /// One-way promotion to HTM on the first history-carrying message.
    pub fn promote_to_htm(&mut self, core: u8) {
        self.state_mut(core).trace_type = TraceType::Htm;
    }

    /// Resets one core back to its power-on state: BTM, unsynced, `lastFaddr`
    /// zeroed. Called when an `Error` tcode forces a core back to
    /// `GetFirstSync`.
    pub fn reset(&mut self, core: u8) {
        *self.state_mut(core) = WalkState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_delta_resolves_against_last_faddr() {
        let mut walker = AddressWalker::new();
        walker.sync_to(0, 0x8000_0000);
        let resolved = walker.resolve_xor_delta(0, 0x0000_0010);
        assert_eq!(resolved, 0x8000_0010);
    }

    #[test]
    fn promotion_to_htm_is_one_way() {
        let mut walker = AddressWalker::new();
        assert_eq!(walker.trace_type(2), TraceType::Btm);
        walker.promote_to_htm(2);
        assert_eq!(walker.trace_type(2), TraceType::Htm);
        // a later WS sync must not demote it back to BTM
        walker.sync_to(2, 0x1000);
        assert_eq!(walker.trace_type(2), TraceType::Htm);
    }

    #[test]
    fn reset_drops_to_btm_and_unsynced() {
        let mut walker = AddressWalker::new();
        walker.promote_to_htm(0);
        walker.sync_to(0, 0x8000);
        walker.reset(0);
        assert_eq!(walker.trace_type(0), TraceType::Btm);
        assert!(!walker.is_synced(0));
        assert_eq!(walker.last_f_addr(0), 0);
    }

    #[test]
    fn cores_are_independent() {
        let mut walker = AddressWalker::new();
        walker.sync_to(0, 0x1000);
        walker.sync_to(1, 0x2000);
        assert_eq!(walker.last_f_addr(0), 0x1000);
        assert_eq!(walker.last_f_addr(1), 0x2000);
    }
}
