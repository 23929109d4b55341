//! Per-core instruction/branch counters and the bounded call-return stack.
//!
//! `ResourceFull` messages carry one sub-count each, but several can
//! accumulate before the walk consumes them (a history continuation for an
//! over-wide history field, then a taken count, then a not-taken count,
//! then an instruction count). They must drain in that fixed order
//! regardless of arrival order, since a trace encoder emits them to refill
//! exhausted counters in priority order, not FIFO.

use std::collections::VecDeque;

use crate::message::{HistoryField, ResourceFullPayload};

const RETURN_STACK_DEPTH: usize = 2048;

/// A single pending count drained from [`CounterBank::take_queued`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedCount {
    HistoryContinuation(HistoryField),
    Taken(u64),
    NotTaken(u64),
    ICount(u64),
}

/// Counters and call stack for a single core.
#[derive(Debug, Default)]
pub struct CounterBank {
    /// Countdown of retirements until the next branch message applies,
    /// set by `i_cnt` fields on direct/indirect branch messages.
    i_cnt: Option<u64>,
    history: VecDeque<HistoryField>,
    taken: VecDeque<u64>,
    not_taken: VecDeque<u64>,
    icount: VecDeque<u64>,
    return_stack: Vec<u64>,
}

impl CounterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_i_cnt(&mut self, n: u64) {
        self.i_cnt = Some(n);
    }

    pub fn i_cnt(&self) -> Option<u64> {
        self.i_cnt
    }

    /// Consumes one instruction's worth of `i_cnt`. Returns `true` once the
    /// count reaches zero, meaning the pending branch now applies.
    pub fn tick_i_cnt(&mut self) -> bool {
        match self.i_cnt {
            Some(0) | None => true,
            Some(n) => {
                self.i_cnt = Some(n - 1);
                n - 1 == 0
            }
        }
    }

    pub fn clear_i_cnt(&mut self) {
        self.i_cnt = None;
    }

    /// Enqueues a `ResourceFull` sub-count for later draining.
    pub fn push_resource_full(&mut self, payload: ResourceFullPayload) {
        match payload {
            ResourceFullPayload::HistoryContinuation(h) => self.history.push_back(h),
            ResourceFullPayload::TakenCount(v) => self.taken.push_back(v),
            ResourceFullPayload::NotTakenCount(v) => self.not_taken.push_back(v),
            ResourceFullPayload::ICount(v) => self.icount.push_back(v),
        }
    }

    /// Drains the next queued count in fixed priority order: history
    /// continuation, then taken, then not-taken, then instruction count.
    pub fn take_queued(&mut self) -> Option<QueuedCount> {
        if let Some(h) = self.history.pop_front() {
            return Some(QueuedCount::HistoryContinuation(h));
        }
        if let Some(v) = self.taken.pop_front() {
            return Some(QueuedCount::Taken(v));
        }
        if let Some(v) = self.not_taken.pop_front() {
            return Some(QueuedCount::NotTaken(v));
        }
        self.icount.pop_front().map(QueuedCount::ICount)
    }

    pub fn has_queued(&self) -> bool {
        !self.history.is_empty()
            || !self.taken.is_empty()
            || !self.not_taken.is_empty()
            || !self.icount.is_empty()
    }

    /// Pushes a return address, evicting the oldest entry if the bounded
    /// stack is full (a deep enough call chain loses HTM return inference
    /// for its outermost frames, never crashes the walk).
    pub fn push_return_address(&mut self, addr: u64) {
        if self.return_stack.len() == RETURN_STACK_DEPTH {
            self.return_stack.remove(0);
        }
        self.return_stack.push(addr);
    }

    pub fn pop_return_address(&mut self) -> Option<u64> {
        self.return_stack.pop()
    }

    /// Resets everything derived from a prior trace window. Called when a
    /// sync/full-address message re-anchors the walk.
    pub fn reset(&mut self) {
        self.i_cnt = None;
        self.history.clear();
        self.taken.clear();
        self.not_taken.clear();
        self.icount.clear();
        self.return_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_priority_order_regardless_of_arrival_order() {
        let mut bank = CounterBank::new();
        bank.push_resource_full(ResourceFullPayload::ICount(5));
        bank.push_resource_full(ResourceFullPayload::TakenCount(2));
        bank.push_resource_full(ResourceFullPayload::HistoryContinuation(HistoryField {
            bits: 0xff,
            width: 8,
        }));
        bank.push_resource_full(ResourceFullPayload::NotTakenCount(3));

        assert_eq!(
            bank.take_queued(),
            Some(QueuedCount::HistoryContinuation(HistoryField {
                bits: 0xff,
                width: 8
            }))
        );
        assert_eq!(bank.take_queued(), Some(QueuedCount::Taken(2)));
        assert_eq!(bank.take_queued(), Some(QueuedCount::NotTaken(3)));
        assert_eq!(bank.take_queued(), Some(QueuedCount::ICount(5)));
        assert_eq!(bank.take_queued(), None);
    }

    #[test]
    fn return_stack_evicts_oldest_on_overflow() {
        let mut bank = CounterBank::new();
        for i in 0..RETURN_STACK_DEPTH as u64 + 1 {
            bank.push_return_address(i);
        }
        // the oldest entry (0) should have been evicted
        let mut popped = Vec::new();
        while let Some(v) = bank.pop_return_address() {
            popped.push(v);
        }
        assert_eq!(popped.len(), RETURN_STACK_DEPTH);
        assert!(!popped.contains(&0));
        assert_eq!(popped[0], RETURN_STACK_DEPTH as u64);
    }

    #[test]
    fn i_cnt_reaches_zero_then_stays_satisfied() {
        let mut bank = CounterBank::new();
        bank.set_i_cnt(2);
        assert!(!bank.tick_i_cnt());
        assert!(bank.tick_i_cnt());
        // once a branch's i_cnt is exhausted, subsequent ticks with no new
        // count set are immediately satisfied (no pending branch).
        bank.clear_i_cnt();
        assert!(bank.tick_i_cnt());
    }
}
