//! End-to-end decode scenarios driving [`nexus_trace_core::fsm::Decoder`]
//! the way a real trace capture would: bytes in, retired instructions and
//! side events out. One test per trace-message family this decoder
//! implements.

mod common;

use common::{beq_word, ecall_word, jal_word, jalr_word, nop_word, FlatImage, MessageEncoder};

use nexus_trace_core::fsm::{Decoder, DecoderConfig};
use nexus_trace_core::itc_router::ItcPrintOpts;
use nexus_trace_core::message::{BranchType, HistoryField, IctSource, SyncReason};
use nexus_trace_core::sink::{CrFlag, DecodeWarning, DecodedEvent, StepOutcome};

fn image_from_words(base: u64, words: &[u32]) -> FlatImage {
    let mut bytes = Vec::new();
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    FlatImage { base, bytes }
}

fn expect_retired(decoder: &mut Decoder<&[u8], FlatImage>, pc: u64, flags: CrFlag) {
    match decoder.next_instruction().unwrap() {
        StepOutcome::Retired(instr) => {
            assert_eq!(instr.pc, pc, "unexpected retired pc");
            assert_eq!(instr.flags, flags, "unexpected flags at pc {pc:#x}");
        }
        other => panic!("expected a retired instruction at {pc:#x}, got {other:?}"),
    }
}

fn expect_trace_enabled(decoder: &mut Decoder<&[u8], FlatImage>) {
    match decoder.next_instruction().unwrap() {
        StepOutcome::Event(DecodedEvent::TraceEnabled { core }) => assert_eq!(core, 0),
        other => panic!("expected TraceEnabled, got {other:?}"),
    }
}

fn expect_eof(decoder: &mut Decoder<&[u8], FlatImage>) {
    assert_eq!(decoder.next_instruction().unwrap(), StepOutcome::Eof);
}

/// BTM, direct branch: a `Sync` anchor followed by a `DirectBranch` message
/// whose i_cnt-th (and only) instruction is an unconditional jump resolved
/// from the instruction encoding itself, no `u_addr` involved.
#[test]
fn s1_btm_direct_branch() {
    let image = image_from_words(0x1_0000, &[nop_word(), jal_word(0, 8)]);
    let mut enc = MessageEncoder::new();
    enc.sync(0x1_0000, SyncReason::TraceEnable);
    enc.direct_branch(1);
    let trace = enc.finish();

    let mut decoder = Decoder::new(&trace[..], image, DecoderConfig::default());
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x1_0000, CrFlag::SYNC_POINT);
    expect_retired(&mut decoder, 0x1_0004, CrFlag::empty());
    expect_eof(&mut decoder);
}

/// HTM, a history-carrying message promoting the core off BTM: a
/// conditional branch mid-walk resolved from a consumed history bit, and
/// the walk's final instruction resolved indirectly via XOR delta.
#[test]
fn s2_htm_history_branch() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&nop_word().to_le_bytes()); // 0x20000: sync anchor
    bytes.extend_from_slice(&beq_word(1, 2, 12).to_le_bytes()); // 0x20004: taken via history bit
    bytes.resize((0x2_0010 - 0x2_0000) as usize, 0);
    bytes.extend_from_slice(&nop_word().to_le_bytes()); // 0x20010: branch target, fallthrough
    bytes.extend_from_slice(&jalr_word(0, 6).to_le_bytes()); // 0x20014: indirect, target from u_addr
    let image = FlatImage { base: 0x2_0000, bytes };

    let u_addr = 0x2_0014 ^ 0x3_0000;
    let mut enc = MessageEncoder::new();
    enc.sync(0x2_0000, SyncReason::ExitDebug);
    enc.indirect_branch_history(
        3,
        u_addr,
        BranchType::Indirect,
        HistoryField { bits: 0b1, width: 1 },
    );
    let trace = enc.finish();

    let mut decoder = Decoder::new(&trace[..], image, DecoderConfig::default());
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x2_0000, CrFlag::SYNC_POINT);
    expect_retired(&mut decoder, 0x2_0004, CrFlag::empty());
    expect_retired(&mut decoder, 0x2_0010, CrFlag::empty());
    expect_retired(&mut decoder, 0x2_0014, CrFlag::empty());
    expect_eof(&mut decoder);
}

/// Indirect branch with XOR-delta resolution, including the `jalr`
/// rd/rs1-both-link "swap" case: pops the (empty) return stack, then
/// pushes a fresh return address that a later `Return` successfully pops.
#[test]
fn s3_indirect_xor_delta() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&nop_word().to_le_bytes()); // 0x30000: sync anchor
    bytes.extend_from_slice(&jalr_word(5, 1).to_le_bytes()); // 0x30004: swap (x5, x1, both link, distinct)
    bytes.resize((0x3_0100 - 0x3_0000) as usize, 0);
    bytes.extend_from_slice(&jalr_word(0, 1).to_le_bytes()); // 0x30100: return
    let image = FlatImage { base: 0x3_0000, bytes };

    let swap_u_addr = 0x3_0004 ^ 0x3_0100;
    let return_u_addr = 0x3_0100 ^ 0x4_0000;
    let mut enc = MessageEncoder::new();
    enc.sync(0x3_0000, SyncReason::TraceEnable);
    enc.indirect_branch(1, swap_u_addr, BranchType::Indirect);
    enc.indirect_branch(1, return_u_addr, BranchType::Indirect);
    let trace = enc.finish();

    let mut decoder = Decoder::new(&trace[..], image, DecoderConfig::default());
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x3_0000, CrFlag::SYNC_POINT);
    // The swap's own pop finds the stack empty; the warning for that pop
    // is queued ahead of the swap's own retirement.
    match decoder.next_instruction().unwrap() {
        StepOutcome::Warning(DecodeWarning::ReturnStackUnderflow { core, pc }) => {
            assert_eq!(core, 0);
            assert_eq!(pc, 0x3_0004);
        }
        other => panic!("expected a return-stack underflow on the swap's own pop, got {other:?}"),
    }
    expect_retired(
        &mut decoder,
        0x3_0004,
        CrFlag::CALL | CrFlag::RETURN | CrFlag::SWAP,
    );
    // The swap unconditionally pushed 0x30008 (its own fall-through) even
    // though its pop came up empty, so the later return finds it and pops
    // clean: no second underflow warning.
    expect_retired(&mut decoder, 0x3_0100, CrFlag::RETURN);
    expect_eof(&mut decoder);
}

/// An in-circuit-trace exception record retires the faulting instruction
/// with the exception flag and re-anchors `lastFaddr` via XOR delta, the
/// same mechanism an indirect branch's `u_addr` uses.
#[test]
fn s4_ict_exception() {
    let image = image_from_words(0x4_0000, &[nop_word(), ecall_word()]);
    let ict_delta = 0x4_0004 ^ 0x8_0000;
    let mut enc = MessageEncoder::new();
    enc.sync(0x4_0000, SyncReason::TraceEnable);
    enc.in_circuit_trace(IctSource::Exception, ict_delta);
    enc.direct_branch(1);
    let trace = enc.finish();

    let mut decoder = Decoder::new(&trace[..], image, DecoderConfig::default());
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x4_0000, CrFlag::SYNC_POINT);
    expect_retired(&mut decoder, 0x4_0004, CrFlag::EXCEPTION);
    // lastFaddr became 0x80000: the following direct-branch walk starts there.
    expect_retired(&mut decoder, 0x8_0000, CrFlag::empty());
    expect_eof(&mut decoder);
}

/// An `Error` tcode resets a core's counts, return stack and PC back to
/// `GetFirstSync`: a call pushed before the error must not still be on the
/// stack for a return retired after the resync.
#[test]
fn s5_error_resync() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&nop_word().to_le_bytes()); // 0x50000: first anchor
    bytes.extend_from_slice(&jalr_word(1, 1).to_le_bytes()); // 0x50004: call, pre-error
    bytes.resize((0x5_0100 - 0x5_0000) as usize, 0);
    bytes.extend_from_slice(&nop_word().to_le_bytes()); // 0x50100: post-resync anchor
    bytes.extend_from_slice(&jalr_word(0, 1).to_le_bytes()); // 0x50104: return, post-error
    let image = FlatImage { base: 0x5_0000, bytes };

    let call_u_addr = 0x5_0004 ^ 0x6_0000;
    let return_u_addr = 0x5_0104 ^ 0x7_0000;
    let mut enc = MessageEncoder::new();
    enc.sync(0x5_0000, SyncReason::TraceEnable);
    enc.indirect_branch(1, call_u_addr, BranchType::Indirect);
    enc.error();
    enc.sync(0x5_0100, SyncReason::TraceEnable);
    enc.indirect_branch(1, return_u_addr, BranchType::Indirect);
    let trace = enc.finish();

    let mut decoder = Decoder::new(&trace[..], image, DecoderConfig::default());
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x5_0000, CrFlag::SYNC_POINT);
    expect_retired(&mut decoder, 0x5_0004, CrFlag::CALL);
    assert!(matches!(
        decoder.next_instruction().unwrap(),
        StepOutcome::Event(DecodedEvent::MissedMessages { core: 0 })
    ));
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x5_0100, CrFlag::SYNC_POINT);
    // The pre-error call's return address did not survive the resync.
    match decoder.next_instruction().unwrap() {
        StepOutcome::Warning(DecodeWarning::ReturnStackUnderflow { core, pc }) => {
            assert_eq!(core, 0);
            assert_eq!(pc, 0x5_0104);
        }
        other => panic!(
            "expected the pre-error call's return address to be gone after the resync, got {other:?}"
        ),
    }
    expect_retired(&mut decoder, 0x5_0104, CrFlag::RETURN);
    expect_eof(&mut decoder);
}

/// ITC print: bytes written to the default print channel (channel 0)
/// assemble into one `ItcPrint` event per completed line.
#[test]
fn s6_itc_print() {
    let image = image_from_words(0x6_0000, &[nop_word()]);
    let mut enc = MessageEncoder::new();
    enc.sync(0x6_0000, SyncReason::TraceEnable);
    enc.aux_access_write(0, 0b11, b'H' as u64);
    enc.aux_access_write(0, 0b11, b'i' as u64);
    enc.aux_access_write(0, 0b11, b'\n' as u64);
    let trace = enc.finish();

    let config = DecoderConfig {
        itc_print_opts: ItcPrintOpts::Print,
        ..DecoderConfig::default()
    };
    let mut decoder = Decoder::new(&trace[..], image, config);
    expect_trace_enabled(&mut decoder);
    expect_retired(&mut decoder, 0x6_0000, CrFlag::SYNC_POINT);
    match decoder.next_instruction().unwrap() {
        StepOutcome::Event(DecodedEvent::ItcPrint { core, channel, text }) => {
            assert_eq!(core, 0);
            assert_eq!(channel, 0);
            assert_eq!(text, b"Hi\n");
        }
        other => panic!("expected an ItcPrint event, got {other:?}"),
    }
    expect_eof(&mut decoder);
}
