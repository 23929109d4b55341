//! Structural RISC-V instruction classification: just enough decode to
//! drive PC reconstruction ([`crate::address_walker`]) and cycle-accurate
//! vector correlation ([`crate::ca_engine`]). This is not a disassembler;
//! it never produces a mnemonic, only a control-flow class and size.

/// Target register width. Only affects a handful of RV64-only compressed
/// encodings (`C.LD`/`C.SD`, `C.ADDIW`) that this classifier does not need
/// to distinguish from their RV32 neighbors, but is threaded through for
/// completeness and to size immediate fields correctly in callers that
/// need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchSize {
    Rv32,
    Rv64,
}

/// Vector-extension instruction sub-class, mirrored directly onto the
/// cycle-accurate trace's preserved bit positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Load,
    Store,
    Arith,
    /// `vset{i}vli`/`vsetvl`: starts a new vector instruction group.
    ConfigStart,
}

/// Control-flow class of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrClass {
    /// No effect on control flow; retires to `pc + size`.
    Other,
    /// Conditional branch (`beq`/`bne`/.../`c.beqz`/`c.bnez`): direct,
    /// PC-relative target, taken/not-taken resolved from trace counts.
    DirectBranch,
    /// Unconditional direct jump (`jal`/`c.j`) that is not a call by
    /// RISC-V calling-convention heuristic (link register is not `x1`/`x5`).
    DirectJump,
    /// Unconditional direct jump recognized as a call (`jal`/`c.jal` with
    /// link register `x1` or `x5`).
    Call,
    /// Indirect jump (`jalr`/`c.jr`/`c.jalr`) recognized as a call.
    IndirectCall,
    /// Indirect jump recognized as a return (`jalr x0, x1, 0` and its
    /// compressed form `c.jr x1`/`c.jr x5`).
    Return,
    /// Any other indirect jump: target comes from the trace's `u_addr`.
    IndirectJump,
    /// `jalr rd, rs1, 0` where `rd` and `rs1` are both link registers but
    /// distinct: pops the return stack for the old frame, then pushes a
    /// new return address for the new one, in the same retirement.
    Swap,
    Ecall,
    Ebreak,
    /// Trap return (`mret`/`sret`/`uret`).
    TrapReturn,
    Vector(VectorOp),
}

impl InstrClass {
    pub fn is_branch(self) -> bool {
        matches!(self, InstrClass::DirectBranch)
    }

    /// True for any class whose target is not `pc + size` and is not
    /// carried in the trace as an explicit `u_addr` (i.e. computable from
    /// the instruction encoding alone).
    pub fn is_direct_transfer(self) -> bool {
        matches!(
            self,
            InstrClass::DirectBranch | InstrClass::DirectJump | InstrClass::Call
        )
    }

    pub fn is_indirect_transfer(self) -> bool {
        matches!(
            self,
            InstrClass::IndirectCall
                | InstrClass::Return
                | InstrClass::IndirectJump
                | InstrClass::TrapReturn
                | InstrClass::Swap
        )
    }
}

/// Result of [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub size: u8,
    pub class: InstrClass,
}

const LINK_REGISTERS: [u32; 2] = [1, 5];

/// Classifies an instruction from its raw encoding. `raw` must have its
/// low 16 (compressed) or 32 (base/vector) bits populated; bits above the
/// instruction's actual size are ignored.
pub fn decode(raw: u32, _arch: ArchSize) -> Decoded {
    if raw & 0b11 != 0b11 {
        decode_compressed(raw as u16)
    } else {
        decode_base(raw)
    }
}

fn decode_compressed(hw: u16) -> Decoded {
    let quadrant = hw & 0b11;
    let funct3 = (hw >> 13) & 0b111;

    let class = match quadrant {
        0b01 => match funct3 {
            0b001 => InstrClass::Call, // C.JAL (RV32-only, rd = x1 implied)
            0b101 => InstrClass::DirectJump, // C.J
            0b110 | 0b111 => InstrClass::DirectBranch, // C.BEQZ / C.BNEZ
            _ => InstrClass::Other,
        },
        0b10 => {
            if funct3 == 0b100 {
                let bit12 = (hw >> 12) & 1;
                let rs1 = ((hw >> 7) & 0x1f) as u32;
                let rs2 = ((hw >> 2) & 0x1f) as u32;
                if bit12 == 0 {
                    if rs2 == 0 && rs1 != 0 {
                        if LINK_REGISTERS.contains(&rs1) {
                            InstrClass::Return // C.JR x1 / C.JR x5
                        } else {
                            InstrClass::IndirectJump // C.JR
                        }
                    } else {
                        InstrClass::Other // C.MV
                    }
                } else if rs2 == 0 {
                    if rs1 == 0 {
                        InstrClass::Ebreak // C.EBREAK
                    } else {
                        InstrClass::IndirectCall // C.JALR, rd = x1 implied
                    }
                } else {
                    InstrClass::Other // C.ADD
                }
            } else {
                InstrClass::Other
            }
        }
        _ => InstrClass::Other, // quadrant 0b00, or 0b11 handled by caller
    };

    Decoded { size: 2, class }
}

fn decode_base(raw: u32) -> Decoded {
    let opcode = raw & 0x7f;
    let rd = (raw >> 7) & 0x1f;
    let rs1 = (raw >> 15) & 0x1f;
    let funct3 = (raw >> 12) & 0x7;

    let class = match opcode {
        0x63 => InstrClass::DirectBranch,
        0x6f => {
            if LINK_REGISTERS.contains(&rd) {
                InstrClass::Call
            } else {
                InstrClass::DirectJump
            }
        }
        0x67 => {
            let imm11_0 = (raw as i32) >> 20;
            let rd_is_link = LINK_REGISTERS.contains(&rd);
            let rs1_is_link = LINK_REGISTERS.contains(&rs1);
            if rd == 0 && rs1 == 1 && imm11_0 == 0 {
                InstrClass::Return
            } else if rd_is_link && rs1_is_link && rd != rs1 {
                // rd and rs1 are both link registers but different: the old
                // return address is overwritten before the new one is
                // pushed, so the walk must pop then push, not just push.
                InstrClass::Swap
            } else if rd_is_link {
                InstrClass::IndirectCall
            } else if rd == 0 && rs1_is_link {
                InstrClass::Return
            } else {
                InstrClass::IndirectJump
            }
        }
        0x73 if funct3 == 0 => {
            let funct12 = raw >> 20;
            match funct12 {
                0x000 => InstrClass::Ecall,
                0x001 => InstrClass::Ebreak,
                0x002 | 0x102 | 0x302 => InstrClass::TrapReturn, // uret/sret/mret
                _ => InstrClass::Other,
            }
        }
        0x57 => {
            if funct3 == 0b111 {
                InstrClass::Vector(VectorOp::ConfigStart)
            } else {
                InstrClass::Vector(VectorOp::Arith)
            }
        }
        0x07 => InstrClass::Vector(VectorOp::Load),
        0x27 => InstrClass::Vector(VectorOp::Store),
        _ => InstrClass::Other,
    };

    Decoded { size: 4, class }
}

/// PC-relative byte offset for a [`InstrClass::is_direct_transfer`]
/// instruction, decoded from its raw encoding. Returns `0` for anything
/// else (callers only call this on direct transfers).
pub fn direct_branch_offset(raw: u32, size: u8) -> i64 {
    if size == 2 {
        let hw = raw as u16;
        let quadrant = hw & 0b11;
        let funct3 = (hw >> 13) & 0b111;
        if quadrant == 0b01 && (funct3 == 0b101 || funct3 == 0b001) {
            // CJ-type (C.J / C.JAL): 11-bit signed offset, scrambled bit order.
            let imm_bits = (hw >> 2) & 0x7ff;
            let mut imm: i32 = 0;
            let set = |imm: &mut i32, bit: u32, src_bit: u32| {
                if (imm_bits >> src_bit) & 1 != 0 {
                    *imm |= 1 << bit;
                }
            };
            set(&mut imm, 5, 0);
            set(&mut imm, 3, 1);
            set(&mut imm, 7, 2);
            set(&mut imm, 6, 3);
            set(&mut imm, 10, 4);
            set(&mut imm, 8, 5);
            set(&mut imm, 9, 6);
            set(&mut imm, 1, 7);
            set(&mut imm, 2, 8);
            set(&mut imm, 11, 9);
            set(&mut imm, 4, 10);
            // sign-extend from bit 11
            ((imm << 20) >> 20) as i64
        } else if quadrant == 0b01 && (funct3 == 0b110 || funct3 == 0b111) {
            // CB-type (C.BEQZ / C.BNEZ): 8-bit signed offset, scrambled bit order.
            let imm_bits = ((hw >> 2) & 0x1f) | (((hw >> 10) & 0x7) << 5);
            let mut imm: i32 = 0;
            let set = |imm: &mut i32, bit: u32, src_bit: u32| {
                if (imm_bits >> src_bit) & 1 != 0 {
                    *imm |= 1 << bit;
                }
            };
            set(&mut imm, 5, 0);
            set(&mut imm, 1, 1);
            set(&mut imm, 2, 2);
            set(&mut imm, 6, 3);
            set(&mut imm, 7, 4);
            set(&mut imm, 3, 5);
            set(&mut imm, 4, 6);
            set(&mut imm, 8, 7);
            ((imm << 23) >> 23) as i64
        } else {
            0
        }
    } else if (raw & 0x7f) == 0x63 {
        // B-type
        let imm = ((raw >> 31) & 1) << 12
            | ((raw >> 7) & 1) << 11
            | ((raw >> 25) & 0x3f) << 5
            | ((raw >> 8) & 0xf) << 1;
        (((imm as i32) << 19) >> 19) as i64
    } else if (raw & 0x7f) == 0x6f {
        // J-type
        let imm = ((raw >> 31) & 1) << 20
            | ((raw >> 12) & 0xff) << 12
            | ((raw >> 20) & 1) << 11
            | ((raw >> 21) & 0x3ff) << 1;
        (((imm as i32) << 11) >> 11) as i64
    } else {
        0
    }
}
