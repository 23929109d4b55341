//! Common Trace Format output: a binary event stream plus a JSON metadata
//! sidecar describing its event classes, closely modeled on CTF's own
//! packet-header/event-header split.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use nexus_trace_core::{DecodedEvent, StepOutcome};
use serde::Serialize;

use crate::error::Result;
use crate::EventSink;

const CTF_MAGIC: u32 = 0xc1fc_1fc1;

/// Compact (single-byte) event-class ids. A real CTF metadata stream would
/// assign these dynamically; fixing them here keeps the writer and the
/// metadata descriptor trivially in sync.
mod event_id {
    pub const RETIRED: u8 = 1;
    pub const ITC_PRINT: u8 = 2;
    pub const ITC_PERF_SAMPLE: u8 = 3;
    pub const OWNERSHIP: u8 = 4;
    pub const CORRELATION: u8 = 5;
    pub const WATCHPOINT: u8 = 6;
    pub const TRACE_ENABLED: u8 = 7;
    pub const TRACE_DISABLED: u8 = 8;
    pub const WARNING: u8 = 9;
    pub const COUNTER_DEF: u8 = 10;
    pub const SYNC_OBSERVED: u8 = 11;
    pub const MISSED_MESSAGES: u8 = 12;
}

#[derive(Serialize)]
struct EventClassDescriptor {
    id: u8,
    name: &'static str,
    fields: &'static [&'static str],
}

#[derive(Serialize)]
struct MetadataDescriptor {
    stream_id: u32,
    magic: u32,
    event_classes: Vec<EventClassDescriptor>,
}

fn event_classes() -> Vec<EventClassDescriptor> {
    vec![
        EventClassDescriptor {
            id: event_id::RETIRED,
            name: "instr_retired",
            fields: &["core", "pc", "size", "flags", "timestamp"],
        },
        EventClassDescriptor {
            id: event_id::ITC_PRINT,
            name: "itc_print",
            fields: &["core", "channel", "text"],
        },
        EventClassDescriptor {
            id: event_id::ITC_PERF_SAMPLE,
            name: "itc_perf_sample",
            fields: &["core", "channel", "address", "value", "call_site"],
        },
        EventClassDescriptor {
            id: event_id::OWNERSHIP,
            name: "ownership",
            fields: &["core", "process_tag"],
        },
        EventClassDescriptor {
            id: event_id::CORRELATION,
            name: "correlation",
            fields: &["core", "cdf"],
        },
        EventClassDescriptor {
            id: event_id::WATCHPOINT,
            name: "watchpoint",
            fields: &["core", "pc"],
        },
        EventClassDescriptor {
            id: event_id::TRACE_ENABLED,
            name: "trace_enabled",
            fields: &["core"],
        },
        EventClassDescriptor {
            id: event_id::TRACE_DISABLED,
            name: "trace_disabled",
            fields: &["core"],
        },
        EventClassDescriptor {
            id: event_id::WARNING,
            name: "decode_warning",
            fields: &["core", "kind"],
        },
        EventClassDescriptor {
            id: event_id::COUNTER_DEF,
            name: "counter_def",
            fields: &["core", "channel"],
        },
        EventClassDescriptor {
            id: event_id::SYNC_OBSERVED,
            name: "sync_observed",
            fields: &["core", "f_addr"],
        },
        EventClassDescriptor {
            id: event_id::MISSED_MESSAGES,
            name: "missed_messages",
            fields: &["core"],
        },
    ]
}

/// Writes a CTF-style binary event stream to `W`.
pub struct CtfWriter<W: Write> {
    writer: W,
    stream_id: u32,
    packet_open: bool,
}

impl<W: Write> CtfWriter<W> {
    pub fn new(writer: W, stream_id: u32) -> Self {
        CtfWriter {
            writer,
            stream_id,
            packet_open: false,
        }
    }

    /// Serializes the metadata descriptor (event-class layout) as JSON.
    /// Written once per stream, alongside the binary packet data, the way
    /// a `metadata` CTF stream is kept separate from its data streams.
    pub fn write_metadata<MW: Write>(&self, meta_writer: MW) -> Result<()> {
        let descriptor = MetadataDescriptor {
            stream_id: self.stream_id,
            magic: CTF_MAGIC,
            event_classes: event_classes(),
        };
        serde_json::to_writer_pretty(meta_writer, &descriptor)?;
        Ok(())
    }

    fn ensure_packet_open(&mut self) -> Result<()> {
        if !self.packet_open {
            self.writer.write_u32::<LittleEndian>(CTF_MAGIC)?;
            self.writer.write_u32::<LittleEndian>(self.stream_id)?;
            self.packet_open = true;
        }
        Ok(())
    }

    fn write_compact_header(&mut self, id: u8, core: u8) -> Result<()> {
        self.writer.write_u8(id)?;
        self.writer.write_u8(core)?;
        Ok(())
    }

    fn write_timestamp(&mut self, timestamp: Option<u64>) -> Result<()> {
        match timestamp {
            Some(ts) => {
                self.writer.write_u8(1)?;
                self.writer.write_u64::<LittleEndian>(ts)?;
            }
            None => self.writer.write_u8(0)?,
        }
        Ok(())
    }

    fn write_bytes_field(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.writer.write_all(bytes)?;
        Ok(())
    }
}

impl<W: Write> EventSink for CtfWriter<W> {
    fn accept(&mut self, outcome: &StepOutcome) -> Result<()> {
        self.ensure_packet_open()?;
        match outcome {
            StepOutcome::Retired(instr) => {
                self.write_compact_header(event_id::RETIRED, instr.core)?;
                self.writer.write_u64::<LittleEndian>(instr.pc)?;
                self.writer.write_u8(instr.size)?;
                self.writer.write_u16::<LittleEndian>(instr.flags.bits())?;
                self.write_timestamp(instr.timestamp)?;
            }
            StepOutcome::Event(DecodedEvent::ItcPrint { core, channel, text }) => {
                self.write_compact_header(event_id::ITC_PRINT, *core)?;
                self.writer.write_u32::<LittleEndian>(*channel)?;
                self.write_bytes_field(text)?;
            }
            StepOutcome::Event(DecodedEvent::ItcPerfSample {
                core,
                channel,
                address,
                value,
                call_site,
            }) => {
                self.write_compact_header(event_id::ITC_PERF_SAMPLE, *core)?;
                self.writer.write_u32::<LittleEndian>(*channel)?;
                self.writer.write_u64::<LittleEndian>(*address)?;
                self.writer.write_u64::<LittleEndian>(*value)?;
                self.writer.write_u64::<LittleEndian>(*call_site)?;
            }
            StepOutcome::Event(DecodedEvent::CounterDef { core, channel, .. }) => {
                self.write_compact_header(event_id::COUNTER_DEF, *core)?;
                self.writer.write_u32::<LittleEndian>(*channel)?;
            }
            StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }) => {
                self.write_compact_header(event_id::SYNC_OBSERVED, *core)?;
                self.writer.write_u64::<LittleEndian>(*f_addr)?;
            }
            StepOutcome::Event(DecodedEvent::MissedMessages { core }) => {
                self.write_compact_header(event_id::MISSED_MESSAGES, *core)?;
            }
            StepOutcome::Event(DecodedEvent::Ownership { core, process_tag }) => {
                self.write_compact_header(event_id::OWNERSHIP, *core)?;
                self.writer.write_u64::<LittleEndian>(*process_tag)?;
            }
            StepOutcome::Event(DecodedEvent::Correlation { core, cdf }) => {
                self.write_compact_header(event_id::CORRELATION, *core)?;
                self.writer.write_u8(*cdf as u8)?;
            }
            StepOutcome::Event(DecodedEvent::Watchpoint { core, pc }) => {
                self.write_compact_header(event_id::WATCHPOINT, *core)?;
                self.writer.write_u64::<LittleEndian>(*pc)?;
            }
            StepOutcome::Event(DecodedEvent::TraceEnabled { core }) => {
                self.write_compact_header(event_id::TRACE_ENABLED, *core)?;
            }
            StepOutcome::Event(DecodedEvent::TraceDisabled { core }) => {
                self.write_compact_header(event_id::TRACE_DISABLED, *core)?;
            }
            StepOutcome::Warning(warning) => {
                let core = warning_core(warning);
                self.write_compact_header(event_id::WARNING, core)?;
                self.write_bytes_field(format!("{warning:?}").as_bytes())?;
            }
            StepOutcome::NeedMoreData | StepOutcome::Eof => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn warning_core(warning: &nexus_trace_core::DecodeWarning) -> u8 {
    use nexus_trace_core::DecodeWarning::*;
    match *warning {
        UnknownNextAddress { core, .. }
        | CountExhaustedEarly { core, .. }
        | MalformedMessage { core }
        | UnsupportedMessage { core, .. }
        | ReturnStackUnderflow { core, .. } => core,
    }
}
