//! Shared helpers for integration-level decode scenarios. Deliberately a
//! second, smaller copy of the unit-test encoder in `src/test_support.rs`
//! rather than exposing that module publicly just for tests/ to reach it.

use nexus_trace_core::message::{BranchType, HistoryField, IctSource, SyncReason};
use nexus_trace_core::ExecutableLookup;

const TAG_CONTINUE: u8 = 0b00;
const TAG_END_OF_FIELD: u8 = 0b01;
const TAG_END_OF_MESSAGE: u8 = 0b11;

mod tcode {
    pub const DIRECT_BRANCH: u64 = 3;
    pub const INDIRECT_BRANCH: u64 = 4;
    pub const ERROR: u64 = 8;
    pub const SYNC: u64 = 9;
    pub const AUXACCESS_WRITE: u64 = 23;
    pub const INDIRECT_BRANCH_HISTORY: u64 = 28;
    pub const INCIRCUIT_TRACE: u64 = 34;
}

#[derive(Default)]
pub struct MessageEncoder {
    bytes: Vec<u8>,
}

impl MessageEncoder {
    pub fn new() -> Self {
        Self::default()
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

    fn reason_raw(reason: SyncReason) -> u64 {
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

    fn branch_type_raw(b_type: BranchType) -> u64 {
        match b_type {
            BranchType::Indirect => 0,
            BranchType::Exception => 1,
            BranchType::Other(v) => v as u64,
        }
    }

    pub fn sync(&mut self, f_addr: u64, reason: SyncReason) -> &mut Self {
        self.push_field(tcode::SYNC, TAG_END_OF_FIELD);
        self.push_field(Self::reason_raw(reason), TAG_END_OF_FIELD);
        self.push_field(f_addr, TAG_END_OF_MESSAGE);
        self
    }

    pub fn direct_branch(&mut self, i_cnt: u64) -> &mut Self {
        self.push_field(tcode::DIRECT_BRANCH, TAG_END_OF_FIELD);
        self.push_field(i_cnt, TAG_END_OF_MESSAGE);
        self
    }

    pub fn indirect_branch(&mut self, i_cnt: u64, u_addr: u64, b_type: BranchType) -> &mut Self {
        self.push_field(tcode::INDIRECT_BRANCH, TAG_END_OF_FIELD);
        self.push_field(i_cnt, TAG_END_OF_FIELD);
        self.push_field(u_addr, TAG_END_OF_FIELD);
        self.push_field(Self::branch_type_raw(b_type), TAG_END_OF_MESSAGE);
        self
    }

    pub fn aux_access_write(&mut self, channel: u32, width_bits: u8, data: u64) -> &mut Self {
        self.push_field(tcode::AUXACCESS_WRITE, TAG_END_OF_FIELD);
        let chan_and_width = ((channel as u64) << 2) | width_bits as u64;
        self.push_field(chan_and_width, TAG_END_OF_FIELD);
        self.push_field(data, TAG_END_OF_MESSAGE);
        self
    }

    pub fn indirect_branch_history(
        &mut self,
        i_cnt: u64,
        u_addr: u64,
        b_type: BranchType,
        history: HistoryField,
    ) -> &mut Self {
        self.push_field(tcode::INDIRECT_BRANCH_HISTORY, TAG_END_OF_FIELD);
        self.push_field(i_cnt, TAG_END_OF_FIELD);
        self.push_field(u_addr, TAG_END_OF_FIELD);
        self.push_field(Self::branch_type_raw(b_type), TAG_END_OF_FIELD);
        self.push_field(history.width as u64, TAG_END_OF_FIELD);
        self.push_field(history.bits, TAG_END_OF_MESSAGE);
        self
    }

    fn ict_source_raw(source: IctSource) -> u64 {
        match source {
            IctSource::ExtTrig => 0,
            IctSource::Watchpoint => 1,
            IctSource::InferableCall => 2,
            IctSource::Exception => 3,
            IctSource::Interrupt => 4,
            IctSource::Context => 5,
            IctSource::PcSample => 6,
            IctSource::Control => 7,
        }
    }

    /// An `InCircuitTrace` message carrying a single data slot (`ckdf`
    /// unset).
    pub fn in_circuit_trace(&mut self, cksrc: IctSource, data0: u64) -> &mut Self {
        self.push_field(tcode::INCIRCUIT_TRACE, TAG_END_OF_FIELD);
        self.push_field(Self::ict_source_raw(cksrc), TAG_END_OF_FIELD);
        self.push_field(0, TAG_END_OF_FIELD); // ckdf = false
        self.push_field(data0, TAG_END_OF_MESSAGE);
        self
    }

    /// An `Error` tcode: the tag alone fills the message.
    pub fn error(&mut self) -> &mut Self {
        self.push_field(tcode::ERROR, TAG_END_OF_MESSAGE);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

/// A flat array of instruction bytes at a fixed base address.
pub struct FlatImage {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl ExecutableLookup for FlatImage {
    fn read_instruction_bytes(&self, _core: u8, pc: u64) -> Option<[u8; 4]> {
        if pc < self.base {
            return None;
        }
        let offset = (pc - self.base) as usize;
        let mut out = [0u8; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = *self.bytes.get(offset + i).unwrap_or(&0);
        }
        Some(out)
    }
}

pub fn nop_word() -> u32 {
    0x0000_0013 // addi x0, x0, 0
}

/// `jalr x1, 0(x1)`: an indirect call (rd = x1).
pub fn jalr_call_word() -> u32 {
    (1u32 << 15) | (1u32 << 7) | 0x67
}

/// `jalr rd, 0(rs1)`.
pub fn jalr_word(rd: u32, rs1: u32) -> u32 {
    (rs1 << 15) | (rd << 7) | 0x67
}

fn j_type_word(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    let imm20 = (imm >> 20) & 1;
    let imm10_1 = (imm >> 1) & 0x3ff;
    let imm11 = (imm >> 11) & 1;
    let imm19_12 = (imm >> 12) & 0xff;
    (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12) | (rd << 7) | 0x6f
}

/// `jal rd, +offset`.
pub fn jal_word(rd: u32, offset: i32) -> u32 {
    j_type_word(rd, offset)
}

fn b_type_word(funct3: u32, rs1: u32, rs2: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    let imm12 = (imm >> 12) & 1;
    let imm11 = (imm >> 11) & 1;
    let imm10_5 = (imm >> 5) & 0x3f;
    let imm4_1 = (imm >> 1) & 0xf;
    (imm12 << 31) | (imm11 << 7) | (imm10_5 << 25) | (imm4_1 << 8) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | 0x63
}

/// `beq rs1, rs2, +offset`.
pub fn beq_word(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type_word(0, rs1, rs2, offset)
}

/// `ecall`.
pub fn ecall_word() -> u32 {
    0x73
}
