//! A minimal RISC-V disassembler covering the instruction classes this
//! decoder actually needs to label in its output: branches, jumps, calls,
//! returns and system instructions. Anything else prints as `.word`/
//! `.half` with the raw encoding; this is not meant to replace a real
//! disassembler for arbitrary binaries.

use nexus_trace_core::instr_decode::{self, ArchSize, InstrClass, VectorOp};
use nexus_trace_core::Disassembler;

pub struct MinimalRiscVDisassembler {
    pub arch: ArchSize,
}

impl Disassembler for MinimalRiscVDisassembler {
    fn disassemble(&self, bytes: &[u8], pc: u64) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let raw16 = u16::from_le_bytes([bytes[0], *bytes.get(1).unwrap_or(&0)]) as u32;
        let is_compressed = raw16 & 0b11 != 0b11;
        let raw = if is_compressed {
            raw16
        } else if bytes.len() >= 4 {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            return None;
        };
        let decoded = instr_decode::decode(raw, self.arch);
        let mnemonic = match decoded.class {
            InstrClass::DirectBranch => {
                let offset = instr_decode::direct_branch_offset(raw, decoded.size);
                format!("b.. 0x{:x}", (pc as i64 + offset) as u64)
            }
            InstrClass::DirectJump => {
                let offset = instr_decode::direct_branch_offset(raw, decoded.size);
                format!("j 0x{:x}", (pc as i64 + offset) as u64)
            }
            InstrClass::Call => {
                let offset = instr_decode::direct_branch_offset(raw, decoded.size);
                format!("call 0x{:x}", (pc as i64 + offset) as u64)
            }
            InstrClass::IndirectCall => "jalr <ra>".to_string(),
            InstrClass::Return => "ret".to_string(),
            InstrClass::IndirectJump => "jr <unknown>".to_string(),
            InstrClass::Ecall => "ecall".to_string(),
            InstrClass::Ebreak => "ebreak".to_string(),
            InstrClass::TrapReturn => "xret".to_string(),
            InstrClass::Vector(VectorOp::Load) => "vload".to_string(),
            InstrClass::Vector(VectorOp::Store) => "vstore".to_string(),
            InstrClass::Vector(VectorOp::Arith) => "vop".to_string(),
            InstrClass::Vector(VectorOp::ConfigStart) => "vsetvl".to_string(),
            InstrClass::Other if decoded.size == 2 => format!(".half 0x{raw16:04x}"),
            InstrClass::Other => format!(".word 0x{raw:08x}"),
        };
        Some(mnemonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_unconditional_jump() {
        let disasm = MinimalRiscVDisassembler { arch: ArchSize::Rv64 };
        let raw: u32 = 0x6f; // jal x0, 0
        let text = disasm.disassemble(&raw.to_le_bytes(), 0x1000).unwrap();
        assert_eq!(text, "j 0x1000");
    }

    #[test]
    fn falls_back_to_word_for_unclassified() {
        let disasm = MinimalRiscVDisassembler { arch: ArchSize::Rv64 };
        let raw: u32 = 0x0000_0013; // addi x0, x0, 0
        let text = disasm.disassemble(&raw.to_le_bytes(), 0x1000).unwrap();
        assert_eq!(text, ".word 0x00000013");
    }
}
