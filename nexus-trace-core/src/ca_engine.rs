//! Cycle-accurate (CA) companion-trace correlation.
//!
//! A CA trace runs alongside the main instruction trace and reports a
//! cycle count per retired beat, optionally broken down by vector-unit
//! activity. Vector instructions can retire over several beats (one per
//! register group processed), so a CA record only starts a *new*
//! instruction's cycle count when its `VISTART` bit is set; otherwise its
//! cycles fold into the instruction already in flight.
//!
//! The vector status bit positions below come from the hardware's CA
//! packet layout and are a wire-format constant, not an internal choice:
//! changing them would desynchronize against the actual companion trace.
//!
//! [`CaBlockReader`] sits below [`CaEngine`] and turns the raw companion
//! byte stream into [`CaRecord`]s: the stream is a sequence of 128-byte
//! blocks (32 little-endian words), each word's top 2 bits a
//! block-relative PC correction and its low 30 bits a mode-dependent
//! payload. `Instruction` mode packs a 22-bit pipe-finish bitmap plus an
//! 8-bit cycle offset into that payload; `Vector` mode packs five 6-bit
//! depth-delta records feeding a 512-deep per-core queue. The reader must
//! be aligned to the instruction trace's first sync point before its
//! records mean anything, via [`CaBlockReader::sync`].

use std::collections::VecDeque;
use std::io::Read;

use bitflags::bitflags;

use crate::MAX_CORES;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CaVectorFlags: u8 {
        const VILOAD   = 0x01;
        const VISTORE  = 0x02;
        const VIARITH  = 0x04;
        const VISTART  = 0x08;
        const V1       = 0x10;
        const V0       = 0x20;
    }
}

/// What level of CA detail the trace carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaMode {
    /// No companion trace; [`CaEngine`] is unused.
    None,
    /// One cycle count per retired instruction, no vector breakdown.
    Instruction,
    /// Cycle counts plus per-beat vector status flags.
    Vector,
}

/// One raw record from the CA companion stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaRecord {
    pub cycles: u64,
    pub flags: CaVectorFlags,
    /// `Instruction`-mode pipe-finish bitmap; unused in other modes.
    pub pipe_mask: u32,
}

/// Result of folding one [`CaRecord`] into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaCorrelation {
    /// Total cycles attributed to the instruction now completing, or
    /// accumulated so far if it is still in flight.
    pub cycles: u64,
    /// `true` once this instruction has seen all its beats and its cycle
    /// count is final.
    pub completes_instruction: bool,
}

#[derive(Default, Clone, Copy)]
struct CorePending {
    cycles: u64,
    in_flight: bool,
}

/// Correlates CA records with retired instructions, per core.
pub struct CaEngine {
    mode: CaMode,
    pending: [CorePending; MAX_CORES],
}

impl CaEngine {
    pub fn new(mode: CaMode) -> Self {
        CaEngine {
            mode,
            pending: [CorePending::default(); MAX_CORES],
        }
    }

    pub fn mode(&self) -> CaMode {
        self.mode
    }

    /// Folds one CA record for `core`. In [`CaMode::Instruction`] every
    /// record completes its instruction immediately; in [`CaMode::Vector`]
    /// a record only completes one when `VISTART` is set in the *next*
    /// record (or the stream ends), since a vector instruction's beats
    /// share a single retirement.
    pub fn correlate(&mut self, core: u8, record: CaRecord) -> CaCorrelation {
        let slot = &mut self.pending[core as usize % MAX_CORES];
        match self.mode {
            CaMode::None => CaCorrelation {
                cycles: record.cycles,
                completes_instruction: true,
            },
            CaMode::Instruction => CaCorrelation {
                cycles: record.cycles,
                completes_instruction: true,
            },
            CaMode::Vector => {
                let starts_new = !slot.in_flight || record.flags.contains(CaVectorFlags::VISTART);
                if starts_new && slot.in_flight {
                    // the in-flight instruction's beats are done; this
                    // record belongs to the next one, so flush first.
                    let finished = CaCorrelation {
                        cycles: slot.cycles,
                        completes_instruction: true,
                    };
                    slot.cycles = record.cycles;
                    slot.in_flight = true;
                    return finished;
                }
                slot.cycles += record.cycles;
                slot.in_flight = true;
                CaCorrelation {
                    cycles: slot.cycles,
                    completes_instruction: false,
                }
            }
        }
    }

    /// Flushes any in-flight vector instruction at end of trace.
    pub fn flush(&mut self, core: u8) -> Option<CaCorrelation> {
        let slot = &mut self.pending[core as usize % MAX_CORES];
        if slot.in_flight {
            slot.in_flight = false;
            Some(CaCorrelation {
                cycles: std::mem::take(&mut slot.cycles),
                completes_instruction: true,
            })
        } else {
            None
        }
    }
}

pub const CA_BLOCK_WORDS: usize = 32;
pub const CA_BLOCK_BYTES: usize = CA_BLOCK_WORDS * 4;
pub const VECTOR_QUEUE_DEPTH: usize = 512;
pub const RESYNC_WINDOW: usize = 16;

/// One decoded CA word: a block-relative PC correction and its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CaWord {
    pc_correction: u8,
    payload: u32,
}

fn split_word(raw: u32) -> CaWord {
    CaWord {
        pc_correction: (raw >> 30) as u8,
        payload: raw & 0x3FFF_FFFF,
    }
}

/// The companion stream desynchronized from the instruction trace and
/// could not recover within [`RESYNC_WINDOW`] instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("CA companion stream desynchronized for core {core} after {attempted} instructions")]
pub struct CaSyncError {
    pub core: u8,
    pub attempted: usize,
}

/// Reads raw CA blocks from a byte stream and decodes them into
/// [`CaRecord`]s for one core, tracking the vector queue's per-slot depth
/// and the block-relative PC correction used to detect desync.
pub struct CaBlockReader<R> {
    reader: R,
    mode: CaMode,
    vector_depth: Vec<u16>,
    vector_cursor: usize,
    synced: bool,
    resync_window: VecDeque<u8>,
    instructions_since_sync: u64,
}

impl<R: Read> CaBlockReader<R> {
    pub fn new(reader: R, mode: CaMode) -> Self {
        CaBlockReader {
            reader,
            mode,
            vector_depth: vec![0; VECTOR_QUEUE_DEPTH],
            vector_cursor: 0,
            synced: false,
            resync_window: VecDeque::with_capacity(RESYNC_WINDOW),
            instructions_since_sync: 0,
        }
    }

    fn read_block(&mut self) -> std::io::Result<Option<[u32; CA_BLOCK_WORDS]>> {
        let mut buf = [0u8; CA_BLOCK_BYTES];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                let mut words = [0u32; CA_BLOCK_WORDS];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
                }
                Ok(Some(words))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Aligns the block stream to the instruction trace's first sync PC.
    /// Fast-forwards whole blocks while their lead word's PC correction
    /// doesn't match `anchor_pc`'s low 2 instruction-size bits, then
    /// requires [`RESYNC_WINDOW`] consecutive matching instructions before
    /// considering the stream synced. A block whose correction never lines
    /// up is a fatal desync: the companion stream is useless from there.
    pub fn sync(&mut self, core: u8, anchor_pc: u64) -> Result<(), CaSyncError> {
        let expected = ((anchor_pc / 4) & 0x3) as u8;
        let mut attempts = 0;
        loop {
            let words = match self.read_block() {
                Ok(Some(w)) => w,
                _ => return Err(CaSyncError { core, attempted: attempts }),
            };
            let lead = split_word(words[0]);
            if lead.pc_correction == expected {
                self.synced = true;
                self.resync_window.clear();
                self.instructions_since_sync = 0;
                return Ok(());
            }
            attempts += 1;
            if attempts > RESYNC_WINDOW {
                return Err(CaSyncError { core, attempted: attempts });
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Decodes the next block into per-word [`CaRecord`]s. Returns `None`
    /// at end of stream.
    pub fn next_records(&mut self) -> std::io::Result<Option<Vec<CaRecord>>> {
        let words = match self.read_block()? {
            Some(w) => w,
            None => return Ok(None),
        };
        let mut records = Vec::with_capacity(CA_BLOCK_WORDS);
        for raw in words {
            let word = split_word(raw);
            self.resync_window.push_back(word.pc_correction);
            if self.resync_window.len() > RESYNC_WINDOW {
                self.resync_window.pop_front();
            }
            self.instructions_since_sync += 1;

            let record = match self.mode {
                CaMode::None => continue,
                CaMode::Instruction => {
                    let cycle_offset = (word.payload & 0xff) as u64;
                    let pipe_mask = word.payload >> 8;
                    CaRecord {
                        cycles: cycle_offset,
                        flags: CaVectorFlags::empty(),
                        pipe_mask,
                    }
                }
                CaMode::Vector => {
                    let mut flags = CaVectorFlags::empty();
                    for slot in 0..5 {
                        let six = (word.payload >> (slot * 6)) & 0x3f;
                        let magnitude = (six & 0x1f) as i32;
                        let delta = if six & 0x20 != 0 { -magnitude } else { magnitude };
                        let idx = self.vector_cursor % VECTOR_QUEUE_DEPTH;
                        self.vector_depth[idx] =
                            (self.vector_depth[idx] as i32 + delta).max(0) as u16;
                        self.vector_cursor += 1;
                        if slot == 0 && six & 0x08 != 0 {
                            flags |= CaVectorFlags::VISTART;
                        }
                    }
                    CaRecord {
                        cycles: (word.payload & 0xff) as u64,
                        flags,
                        pipe_mask: 0,
                    }
                }
            };
            records.push(record);
        }
        Ok(Some(records))
    }

    /// Current occupancy of a vector queue slot, for diagnostics.
    pub fn vector_queue_depth(&self, slot: usize) -> u16 {
        self.vector_depth[slot % VECTOR_QUEUE_DEPTH]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_bit_positions_are_pinned() {
        assert_eq!(CaVectorFlags::VILOAD.bits(), 0x01);
        assert_eq!(CaVectorFlags::VISTORE.bits(), 0x02);
        assert_eq!(CaVectorFlags::VIARITH.bits(), 0x04);
        assert_eq!(CaVectorFlags::VISTART.bits(), 0x08);
        assert_eq!(CaVectorFlags::V1.bits(), 0x10);
        assert_eq!(CaVectorFlags::V0.bits(), 0x20);
    }

    #[test]
    fn instruction_mode_completes_every_record() {
        let mut engine = CaEngine::new(CaMode::Instruction);
        let result = engine.correlate(
            0,
            CaRecord {
                cycles: 3,
                flags: CaVectorFlags::empty(),
                pipe_mask: 0,
            },
        );
        assert_eq!(result.cycles, 3);
        assert!(result.completes_instruction);
    }

    #[test]
    fn vector_mode_accumulates_beats_until_next_vistart() {
        let mut engine = CaEngine::new(CaMode::Vector);
        let first = engine.correlate(
            0,
            CaRecord {
                cycles: 2,
                flags: CaVectorFlags::VISTART | CaVectorFlags::VILOAD,
                pipe_mask: 0,
            },
        );
        assert!(!first.completes_instruction);
        assert_eq!(first.cycles, 2);

        let second = engine.correlate(
            0,
            CaRecord {
                cycles: 3,
                flags: CaVectorFlags::VIARITH,
                pipe_mask: 0,
            },
        );
        assert!(!second.completes_instruction);
        assert_eq!(second.cycles, 5);

        let third = engine.correlate(
            0,
            CaRecord {
                cycles: 1,
                flags: CaVectorFlags::VISTART | CaVectorFlags::VISTORE,
                pipe_mask: 0,
            },
        );
        assert!(third.completes_instruction);
        assert_eq!(third.cycles, 5); // flushed the prior instruction's total

        let flushed = engine.flush(0).unwrap();
        assert_eq!(flushed.cycles, 1);
    }

    fn block_bytes(lead_correction: u8) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CA_BLOCK_BYTES);
        for i in 0..CA_BLOCK_WORDS {
            let correction = if i == 0 { lead_correction } else { 0 };
            let word = ((correction as u32) << 30) | 0x10; // a harmless payload
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn sync_fast_forwards_to_matching_correction() {
        let mut data = block_bytes(1); // mismatched lead block
        data.extend_from_slice(&block_bytes(2)); // matches anchor_pc % 16 == 2*4
        let mut reader = CaBlockReader::new(&data[..], CaMode::Instruction);
        assert!(reader.sync(0, 8).is_ok());
        assert!(reader.is_synced());
    }

    #[test]
    fn next_records_decodes_instruction_mode_payload() {
        let mut word = 0u32;
        word |= 0x12; // cycle_offset low byte
        word |= 0x3 << 8; // pipe_mask bits
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&word.to_le_bytes());
        for _ in 1..CA_BLOCK_WORDS {
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        let mut reader = CaBlockReader::new(&bytes[..], CaMode::Instruction);
        let records = reader.next_records().unwrap().unwrap();
        assert_eq!(records[0].cycles, 0x12);
        assert_eq!(records[0].pipe_mask, 0x3);
    }

    #[test]
    fn vector_mode_tracks_queue_depth() {
        // first 6-bit record: magnitude 4, positive (adds to slot 0).
        let word: u32 = 4;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&word.to_le_bytes());
        for _ in 1..CA_BLOCK_WORDS {
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        let mut reader = CaBlockReader::new(&bytes[..], CaMode::Vector);
        reader.next_records().unwrap().unwrap();
        assert_eq!(reader.vector_queue_depth(0), 4);
    }
}
