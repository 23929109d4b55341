//! Synthetic encoder for [`crate::slice_parser`]'s own tests. Encodes the
//! exact wire layout `SliceParser` expects; not exposed outside the crate
//! and not meant to be a general-purpose trace encoder.

use crate::message::SyncReason;

const TAG_CONTINUE: u8 = 0b00;
const TAG_END_OF_FIELD: u8 = 0b01;
const TAG_END_OF_MESSAGE: u8 = 0b11;

mod tcode {
    pub const DIRECT_BRANCH: u64 = 3;
    pub const ERROR: u64 = 8;
    pub const SYNC: u64 = 9;
}

pub struct MessageEncoder {
    bytes: Vec<u8>,
}

impl MessageEncoder {
    pub fn new() -> Self {
        MessageEncoder { bytes: Vec::new() }
    }

    fn push_field(&mut self, value: u64, terminal_tag: u8) {
        let mut v = value;
        loop {
            let chunk = (v & 0x3f) as u8;
            v >>= 6;
            if v == 0 {
                self.bytes.push((chunk << 2) | terminal_tag);
                break;
            } else {
                self.bytes.push((chunk << 2) | TAG_CONTINUE);
            }
        }
    }

    fn reason_to_raw(reason: SyncReason) -> u64 {
        match reason {
            SyncReason::ExitDebug => 0,
            SyncReason::TraceEnable => 1,
            SyncReason::Evti => 2,
            SyncReason::PcSample => 3,
            SyncReason::Watchpoint => 4,
            SyncReason::Overflow => 5,
            SyncReason::Other(v) => v as u64,
        }
    }

    pub fn sync(&mut self, f_addr: u64, reason: SyncReason) -> &mut Self {
        self.push_field(tcode::SYNC, TAG_END_OF_FIELD);
        self.push_field(Self::reason_to_raw(reason), TAG_END_OF_FIELD);
        self.push_field(f_addr, TAG_END_OF_MESSAGE);
        self
    }

    pub fn direct_branch(&mut self, i_cnt: u64) -> &mut Self {
        self.push_field(tcode::DIRECT_BRANCH, TAG_END_OF_FIELD);
        self.push_field(i_cnt, TAG_END_OF_MESSAGE);
        self
    }

    /// An `Error` tcode: the tag alone fills the message (no further fields).
    pub fn error(&mut self) -> &mut Self {
        self.push_field(tcode::ERROR, TAG_END_OF_MESSAGE);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Prepends a `srcbits`-wide core-id field ahead of whatever message
    /// body has already been encoded.
    pub fn finish_with_core(&mut self, core: u8, _srcbits: u8) -> Vec<u8> {
        let body = std::mem::take(&mut self.bytes);
        self.push_field(core as u64, TAG_END_OF_FIELD);
        let mut prefixed = std::mem::take(&mut self.bytes);
        prefixed.extend(body);
        prefixed
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}
