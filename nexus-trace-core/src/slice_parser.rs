//! Variable-length MDO/MSEO slice parser.
//!
//! Wire format: a sequence of bytes. Per byte, bits\[1:0\] are the MSEO tag
//! (`00` = MDO continuation, `01` = end-of-field, `11` = end-of-message,
//! `10` reserved) and bits\[7:2\] are a little-endian 6-bit MDO payload
//! slice. A variable-width field accumulates MDO slices, low slice first,
//! until a byte tagged end-of-field or end-of-message. The first field of
//! every message is the `tcode`; later fields are tcode-specific.
//!
//! The exact per-tcode sub-field layout is not pinned down by the Nexus
//! subset this decoder implements beyond the framing above, so this
//! parser fixes a concrete, self-consistent layout (documented per
//! variant below and in `DESIGN.md`) rather than guessing at a specific
//! vendor's bit assignment.

use std::io::Read;

use crate::message::{
    BranchType, HistoryField, IctControl, IctSource, ItcWidth, MessagePayload, ResourceFullPayload,
    SyncReason, TimestampField, TraceMessage,
};

const TAG_CONTINUE: u8 = 0b00;
const TAG_END_OF_FIELD: u8 = 0b01;
const TAG_END_OF_MESSAGE: u8 = 0b11;
const TAG_RESERVED: u8 = 0b10;

mod tcode {
    pub const DEBUG_STATUS: u8 = 0;
    pub const DEVICE_ID: u8 = 1;
    pub const OWNERSHIP_TRACE: u8 = 2;
    pub const DIRECT_BRANCH: u8 = 3;
    pub const INDIRECT_BRANCH: u8 = 4;
    pub const DATA_ACQUISITION: u8 = 7;
    pub const ERROR: u8 = 8;
    pub const SYNC: u8 = 9;
    pub const CORRELATION: u8 = 10;
    pub const DIRECT_BRANCH_WS: u8 = 11;
    pub const INDIRECT_BRANCH_WS: u8 = 12;
    pub const AUXACCESS_WRITE: u8 = 23;
    pub const RESOURCE_FULL: u8 = 27;
    pub const INDIRECT_BRANCH_HISTORY: u8 = 28;
    pub const INDIRECT_BRANCH_HISTORY_WS: u8 = 29;
    pub const INCIRCUIT_TRACE: u8 = 34;
    pub const INCIRCUIT_TRACE_WS: u8 = 35;
}

/// Outcome of [`SliceParser::read_next_trace_msg`].
#[derive(Debug)]
pub enum ParseOutcome {
    Message(TraceMessage),
    /// Clean end of stream: no bytes remained at a message boundary.
    Eof,
}

/// Parser-local error. Malformed framing is recoverable (the parser
/// resynchronizes at the next end-of-message tag); only an I/O failure or
/// a truncated final message is reported up as something the caller must
/// act on.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("I/O error reading trace stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended mid-message")]
    TruncatedMessage,
}

struct FieldRead {
    value: u64,
    is_end_of_message: bool,
}

/// Reads [`TraceMessage`]s out of a byte stream.
pub struct SliceParser<R> {
    reader: R,
    /// Width in bits (0-8) of the core-id field stripped from every
    /// message prefix when funnel demultiplexing is in use.
    srcbits: u8,
    offset: u64,
    total_size: Option<u64>,
}

impl<R: Read> SliceParser<R> {
    pub fn new(reader: R, srcbits: u8) -> Self {
        assert!(srcbits <= 8, "srcbits must be 0..=8");
        SliceParser {
            reader,
            srcbits,
            offset: 0,
            total_size: None,
        }
    }

    pub fn with_known_size(reader: R, srcbits: u8, total_size: u64) -> Self {
        let mut parser = Self::new(reader, srcbits);
        parser.total_size = Some(total_size);
        parser
    }

    /// `(total_size, current_offset)`, for streaming UIs.
    pub fn get_file_offset(&self) -> (Option<u64>, u64) {
        (self.total_size, self.offset)
    }

    /// Bytes buffered but not yet dispatched. This parser has no internal
    /// read-ahead buffer, so it is always zero; kept for API parity with a
    /// streaming front end.
    pub fn get_num_bytes_in_swtq(&self) -> u64 {
        0
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ParseError> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte)? {
            0 => Ok(None),
            _ => {
                self.offset += 1;
                Ok(Some(byte[0]))
            }
        }
    }

    /// Reads one MDO-slice field, accumulating 6-bit slices until a
    /// field-end or message-end tag. Returns `Ok(None)` only if EOF is hit
    /// before any slice of this field was read; a truncated field (EOF
    /// mid-accumulation) is [`ParseError::TruncatedMessage`].
    fn read_field(&mut self) -> Result<Option<FieldRead>, ParseError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        let mut got_any = false;
        loop {
            let byte = match self.read_byte()? {
                Some(b) => b,
                None if got_any => return Err(ParseError::TruncatedMessage),
                None => return Ok(None),
            };
            got_any = true;
            let tag = byte & 0b11;
            let slice = (byte >> 2) as u64;
            match tag {
                TAG_CONTINUE => {
                    value |= slice << shift;
                    shift += 6;
                }
                TAG_END_OF_FIELD => {
                    value |= slice << shift;
                    return Ok(Some(FieldRead {
                        value,
                        is_end_of_message: false,
                    }));
                }
                TAG_END_OF_MESSAGE => {
                    value |= slice << shift;
                    return Ok(Some(FieldRead {
                        value,
                        is_end_of_message: true,
                    }));
                }
                TAG_RESERVED => {
                    log::warn!("reserved MSEO tag encountered; resynchronizing");
                    self.skip_to_message_end()?;
                    return Ok(Some(FieldRead {
                        value: 0,
                        is_end_of_message: true,
                    }));
                }
                _ => unreachable!("tag is 2 bits"),
            }
        }
    }

    fn skip_to_message_end(&mut self) -> Result<(), ParseError> {
        loop {
            match self.read_byte()? {
                None => return Ok(()),
                Some(byte) if byte & 0b11 == TAG_END_OF_MESSAGE => return Ok(()),
                Some(_) => continue,
            }
        }
    }

    /// Reads required fields one at a time. Returns the parsed value and
    /// whether the message ended here; a message-end on a field other
    /// than the last required one is treated as malformed and the
    /// remaining required fields default to zero.
    fn read_required(&mut self) -> Result<(u64, bool), ParseError> {
        match self.read_field()? {
            Some(f) => Ok((f.value, f.is_end_of_message)),
            None => Err(ParseError::TruncatedMessage),
        }
    }

    /// After the known payload fields for a tcode have been consumed,
    /// reads the optional trailing timestamp field if the message has not
    /// already ended.
    fn read_optional_timestamp(
        &mut self,
        already_ended: bool,
        is_sync_like: bool,
    ) -> Result<Option<TimestampField>, ParseError> {
        if already_ended {
            return Ok(None);
        }
        let (value, ended) = self.read_required()?;
        if !ended {
            // Extra trailing junk in the message body: resynchronize but
            // still report the timestamp value we already parsed.
            log::warn!("trace message had unexpected trailing fields; resynchronizing");
            self.skip_to_message_end()?;
        }
        Ok(Some(if is_sync_like {
            TimestampField::Full(value)
        } else {
            TimestampField::Relative(value)
        }))
    }

    fn decode_branch_type(raw: u64) -> BranchType {
        match raw {
            0 => BranchType::Indirect,
            1 => BranchType::Exception,
            other => BranchType::Other(other as u8),
        }
    }

    fn decode_ict_source(raw: u64) -> IctSource {
        match raw {
            0 => IctSource::ExtTrig,
            1 => IctSource::Watchpoint,
            2 => IctSource::InferableCall,
            3 => IctSource::Exception,
            4 => IctSource::Interrupt,
            5 => IctSource::Context,
            6 => IctSource::PcSample,
            _ => IctSource::Control,
        }
    }

    fn decode_ict_control(raw: u64) -> IctControl {
        match raw {
            0 => IctControl::TraceOn,
            1 => IctControl::ExitDebug,
            other => IctControl::Other(other),
        }
    }

    /// Reads the next trace message, or `Eof` at a clean stream boundary.
    pub fn read_next_trace_msg(&mut self) -> Result<ParseOutcome, ParseError> {
        let core = if self.srcbits > 0 {
            match self.read_field()? {
                Some(f) => (f.value as u64 & ((1u64 << self.srcbits) - 1)) as u8,
                None => return Ok(ParseOutcome::Eof),
            }
        } else {
            0
        };

        let (tcode_value, tcode_ended) = match self.read_field()? {
            Some(f) => (f.value, f.is_end_of_message),
            None => {
                if self.srcbits > 0 {
                    return Err(ParseError::TruncatedMessage);
                }
                return Ok(ParseOutcome::Eof);
            }
        };
        let tcode = tcode_value as u8;

        let (payload, ended, is_sync_like) = self.parse_payload(tcode, tcode_ended)?;
        let timestamp = self.read_optional_timestamp(ended, is_sync_like)?;

        Ok(ParseOutcome::Message(TraceMessage {
            core,
            timestamp,
            payload,
        }))
    }

    /// Parses the tcode-specific fields. Returns the payload, whether the
    /// message ended on the last field read, and whether this message
    /// uses full (vs. relative) timestamp encoding.
    fn parse_payload(
        &mut self,
        tc: u8,
        tcode_ended: bool,
    ) -> Result<(MessagePayload, bool, bool), ParseError> {
        if tcode_ended {
            // tcode alone filled the message; only Error legitimately does this.
            return Ok((
                if tc == tcode::ERROR {
                    MessagePayload::Error
                } else {
                    MessagePayload::Unsupported(tc)
                },
                true,
                false,
            ));
        }

        match tc {
            tcode::SYNC => {
                let (reason_raw, e1) = self.read_required()?;
                let (f_addr, e2) = if e1 { (0, true) } else { self.read_required()? };
                let reason = match reason_raw {
                    0 => SyncReason::ExitDebug,
                    1 => SyncReason::TraceEnable,
                    2 => SyncReason::Evti,
                    3 => SyncReason::PcSample,
                    4 => SyncReason::Watchpoint,
                    5 => SyncReason::Overflow,
                    other => SyncReason::Other(other as u8),
                };
                Ok((MessagePayload::Sync { f_addr, reason }, e2, true))
            }
            tcode::DIRECT_BRANCH => {
                let (i_cnt, ended) = self.read_required()?;
                Ok((MessagePayload::DirectBranch { i_cnt }, ended, false))
            }
            tcode::DIRECT_BRANCH_WS => {
                let (f_addr, e1) = self.read_required()?;
                let (flags, e2) = if e1 { (0, true) } else { self.read_required()? };
                let has_icnt = flags & 0b01 != 0;
                let has_btype = flags & 0b10 != 0;
                let mut ended = e2;
                let i_cnt = if has_icnt && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(v)
                } else {
                    None
                };
                let b_type = if has_btype && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(Self::decode_branch_type(v))
                } else {
                    None
                };
                Ok((
                    MessagePayload::DirectBranchWs {
                        f_addr,
                        i_cnt,
                        b_type,
                    },
                    ended,
                    true,
                ))
            }
            tcode::INDIRECT_BRANCH => {
                let (i_cnt, e1) = self.read_required()?;
                let (u_addr, e2) = if e1 { (0, true) } else { self.read_required()? };
                let (b_type_raw, e3) = if e2 { (0, true) } else { self.read_required()? };
                Ok((
                    MessagePayload::IndirectBranch {
                        i_cnt,
                        u_addr,
                        b_type: Self::decode_branch_type(b_type_raw),
                    },
                    e3,
                    false,
                ))
            }
            tcode::INDIRECT_BRANCH_WS => {
                let (f_addr, e1) = self.read_required()?;
                let (flags, e2) = if e1 { (0, true) } else { self.read_required()? };
                let has_icnt = flags & 0b001 != 0;
                let has_btype = flags & 0b010 != 0;
                let has_uaddr = flags & 0b100 != 0;
                let mut ended = e2;
                let i_cnt = if has_icnt && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(v)
                } else {
                    None
                };
                let b_type = if has_btype && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(Self::decode_branch_type(v))
                } else {
                    None
                };
                let u_addr = if has_uaddr && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(v)
                } else {
                    None
                };
                Ok((
                    MessagePayload::IndirectBranchWs {
                        f_addr,
                        i_cnt,
                        b_type,
                        u_addr,
                    },
                    ended,
                    true,
                ))
            }
            tcode::INDIRECT_BRANCH_HISTORY => {
                let (i_cnt, e1) = self.read_required()?;
                let (u_addr, e2) = if e1 { (0, true) } else { self.read_required()? };
                let (b_type_raw, e3) = if e2 { (0, true) } else { self.read_required()? };
                let (width, e4) = if e3 { (0, true) } else { self.read_required()? };
                let (bits, e5) = if e4 { (0, true) } else { self.read_required()? };
                Ok((
                    MessagePayload::IndirectBranchHistory {
                        i_cnt,
                        u_addr,
                        b_type: Self::decode_branch_type(b_type_raw),
                        history: HistoryField {
                            bits,
                            width: width as u8,
                        },
                    },
                    e5,
                    false,
                ))
            }
            tcode::INDIRECT_BRANCH_HISTORY_WS => {
                let (f_addr, e1) = self.read_required()?;
                let (flags, e2) = if e1 { (0, true) } else { self.read_required()? };
                let has_icnt = flags & 0b01 != 0;
                let has_btype = flags & 0b10 != 0;
                let mut ended = e2;
                let i_cnt = if has_icnt && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(v)
                } else {
                    None
                };
                let b_type = if has_btype && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    Some(Self::decode_branch_type(v))
                } else {
                    None
                };
                let (width, e6) = if ended { (0, true) } else { self.read_required()? };
                let (bits, e7) = if e6 { (0, true) } else { self.read_required()? };
                Ok((
                    MessagePayload::IndirectBranchHistoryWs {
                        f_addr,
                        i_cnt,
                        b_type,
                        history: HistoryField {
                            bits,
                            width: width as u8,
                        },
                    },
                    e7,
                    true,
                ))
            }
            tcode::RESOURCE_FULL => {
                let (subtype, e1) = self.read_required()?;
                match subtype {
                    0 => {
                        let (width, e2) = if e1 { (0, true) } else { self.read_required()? };
                        let (bits, e3) = if e2 { (0, true) } else { self.read_required()? };
                        Ok((
                            MessagePayload::ResourceFull(ResourceFullPayload::HistoryContinuation(
                                HistoryField {
                                    bits,
                                    width: width as u8,
                                },
                            )),
                            e3,
                            false,
                        ))
                    }
                    1 => {
                        let (v, e2) = if e1 { (0, true) } else { self.read_required()? };
                        Ok((
                            MessagePayload::ResourceFull(ResourceFullPayload::TakenCount(v)),
                            e2,
                            false,
                        ))
                    }
                    2 => {
                        let (v, e2) = if e1 { (0, true) } else { self.read_required()? };
                        Ok((
                            MessagePayload::ResourceFull(ResourceFullPayload::NotTakenCount(v)),
                            e2,
                            false,
                        ))
                    }
                    _ => {
                        let (v, e2) = if e1 { (0, true) } else { self.read_required()? };
                        Ok((
                            MessagePayload::ResourceFull(ResourceFullPayload::ICount(v)),
                            e2,
                            false,
                        ))
                    }
                }
            }
            tcode::CORRELATION => {
                let (i_cnt, e1) = self.read_required()?;
                let (cdf, e2) = if e1 { (0, true) } else { self.read_required()? };
                Ok((
                    MessagePayload::Correlation {
                        i_cnt,
                        cdf: cdf != 0,
                    },
                    e2,
                    false,
                ))
            }
            tcode::OWNERSHIP_TRACE => {
                let (process_tag, ended) = self.read_required()?;
                Ok((MessagePayload::OwnershipTrace { process_tag }, ended, false))
            }
            tcode::AUXACCESS_WRITE | tcode::DATA_ACQUISITION => {
                let (chan_and_width, e1) = self.read_required()?;
                let (data, e2) = if e1 { (0, true) } else { self.read_required()? };
                let width = ItcWidth::from_low_bits(chan_and_width as u8);
                let channel = (chan_and_width >> 2) as u32;
                let payload = if tc == tcode::AUXACCESS_WRITE {
                    MessagePayload::AuxAccessWrite {
                        channel,
                        width,
                        data,
                    }
                } else {
                    MessagePayload::DataAcquisition {
                        channel,
                        width,
                        data,
                    }
                };
                Ok((payload, e2, false))
            }
            tcode::INCIRCUIT_TRACE | tcode::INCIRCUIT_TRACE_WS => {
                let is_ws = tc == tcode::INCIRCUIT_TRACE_WS;
                let (f_addr, e0) = if is_ws {
                    self.read_required()?
                } else {
                    (0, false)
                };
                let (cksrc_raw, e1) = if e0 { (0, true) } else { self.read_required()? };
                let cksrc = Self::decode_ict_source(cksrc_raw);
                let (ckdf_raw, e2) = if e1 { (0, true) } else { self.read_required()? };
                let ckdf = ckdf_raw != 0;
                let (slot0, e3) = if e2 { (0, true) } else { self.read_required()? };
                let mut ended = e3;
                let slot1 = if ckdf && !ended {
                    let (v, e) = self.read_required()?;
                    ended = e;
                    v
                } else {
                    0
                };
                let data_len: u8 = if ckdf { 2 } else { 1 };
                let control = if cksrc == IctSource::Control {
                    Some(Self::decode_ict_control(slot0))
                } else {
                    None
                };
                let payload = if is_ws {
                    MessagePayload::InCircuitTraceWs {
                        f_addr,
                        cksrc,
                        control,
                        ckdf,
                        data: [slot0, slot1],
                        data_len,
                    }
                } else {
                    MessagePayload::InCircuitTrace {
                        cksrc,
                        control,
                        ckdf,
                        data: [slot0, slot1],
                        data_len,
                    }
                };
                Ok((payload, ended, is_ws))
            }
            tcode::ERROR => Ok((MessagePayload::Error, true, false)),
            tcode::DEBUG_STATUS | tcode::DEVICE_ID => {
                // Single opaque value, not otherwise modeled.
                let (_, ended) = self.read_required()?;
                Ok((MessagePayload::Unsupported(tc), ended, false))
            }
            other => {
                log::warn!("unsupported tcode {other}; skipping message");
                self.skip_to_message_end()?;
                Ok((MessagePayload::Unsupported(other), true, false))
            }
        }
    }
}
