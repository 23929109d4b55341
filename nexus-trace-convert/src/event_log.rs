//! Human-readable rendering of the decode stream into the line-oriented
//! text files a downstream viewer or `grep` session expects: one file per
//! [`EventKind`], each line `[core] ts [EventKind] PC=0x… Key=[value]
//! ffl:file:function:line`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use nexus_trace_core::{CrFlag, DecodedEvent, RetiredInstruction, StepOutcome};

use crate::error::Result;
use crate::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EventKind {
    Control,
    Interrupt,
    Exception,
    CallRet,
    Watchpoint,
    /// Catch-all for everything the named kinds above don't cover:
    /// plain retirements, ITC print/perf, ownership, correlation, and
    /// decode warnings.
    Events,
}

impl EventKind {
    /// Both the `<elfbase>.<name>` file suffix and the `[name]` tag inside
    /// each line share this string.
    fn name(self) -> &'static str {
        match self {
            EventKind::Control => "control",
            EventKind::Interrupt => "interrupt",
            EventKind::Exception => "exception",
            EventKind::CallRet => "callret",
            EventKind::Watchpoint => "watchpoint",
            EventKind::Events => "events",
        }
    }
}

fn event_kind_for_flags(flags: CrFlag) -> EventKind {
    if flags.intersects(CrFlag::EXCEPTION | CrFlag::EXCEPTION_RETURN) {
        EventKind::Exception
    } else if flags.intersects(CrFlag::INTERRUPT) {
        EventKind::Interrupt
    } else if flags.intersects(CrFlag::CALL | CrFlag::RETURN | CrFlag::SWAP) {
        EventKind::CallRet
    } else {
        EventKind::Events
    }
}

/// Writes `<elfbase>.<kind>` files, one per [`EventKind`], opening each
/// lazily on its first line so a run that never emits, say, an exception
/// doesn't leave an empty `.exception` file behind.
pub struct EventLogWriter {
    elfbase: PathBuf,
    files: HashMap<EventKind, BufWriter<File>>,
}

impl EventLogWriter {
    pub fn new(elfbase: impl Into<PathBuf>) -> Self {
        EventLogWriter {
            elfbase: elfbase.into(),
            files: HashMap::new(),
        }
    }

    fn file_for(&mut self, kind: EventKind) -> Result<&mut BufWriter<File>> {
        if !self.files.contains_key(&kind) {
            let path: PathBuf = format!("{}.{}", self.elfbase.display(), kind.name()).into();
            let file = File::create(&path)?;
            self.files.insert(kind, BufWriter::new(file));
        }
        Ok(self.files.get_mut(&kind).unwrap())
    }

    fn write_line(
        &mut self,
        kind: EventKind,
        core: u8,
        ts: Option<u64>,
        pc: u64,
        key_value: &str,
        ffl: &str,
    ) -> Result<()> {
        let ts = ts.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
        let writer = self.file_for(kind)?;
        writeln!(writer, "[{core}] {ts} [{}] PC=0x{pc:x} {key_value} ffl:{ffl}", kind.name())?;
        Ok(())
    }

    fn ffl(instr: &RetiredInstruction) -> String {
        match &instr.source {
            Some(loc) => format!(
                "{}:{}:{}",
                loc.file,
                loc.function.as_deref().unwrap_or(""),
                loc.line
            ),
            None => String::new(),
        }
    }

    fn accept_retired(&mut self, instr: &RetiredInstruction) -> Result<()> {
        let kind = event_kind_for_flags(instr.flags);
        let key_value = format!("Flags=[{:?}]", instr.flags);
        self.write_line(kind, instr.core, instr.timestamp, instr.pc, &key_value, &Self::ffl(instr))
    }
}

impl EventSink for EventLogWriter {
    fn accept(&mut self, outcome: &StepOutcome) -> Result<()> {
        match outcome {
            StepOutcome::Retired(instr) => self.accept_retired(instr)?,
            StepOutcome::Event(DecodedEvent::ItcPrint { core, channel, text }) => {
                let key_value = format!(
                    "Channel=[{channel}] Text=[{}]",
                    String::from_utf8_lossy(text).trim_end()
                );
                self.write_line(EventKind::Events, *core, None, 0, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::ItcPerfSample {
                core,
                channel,
                address,
                value,
                call_site,
            }) => {
                let key_value = format!("Channel=[{channel}] Value=[{value}] CallSite=[0x{call_site:x}]");
                self.write_line(EventKind::Events, *core, None, *address, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::CounterDef { core, channel, def }) => {
                let key_value = format!("Channel=[{channel}] Def=[{def:?}]");
                self.write_line(EventKind::Events, *core, None, 0, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::Ownership { core, process_tag }) => {
                let key_value = format!("Owner=[{process_tag}]");
                self.write_line(EventKind::Events, *core, None, 0, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::Correlation { core, cdf }) => {
                let key_value = format!("Cdf=[{cdf}]");
                self.write_line(EventKind::Events, *core, None, 0, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::Watchpoint { core, pc }) => {
                self.write_line(EventKind::Watchpoint, *core, None, *pc, "Hit=[1]", "")?;
            }
            StepOutcome::Event(DecodedEvent::TraceEnabled { core }) => {
                self.write_line(EventKind::Control, *core, None, 0, "State=[enabled]", "")?;
            }
            StepOutcome::Event(DecodedEvent::TraceDisabled { core }) => {
                self.write_line(EventKind::Control, *core, None, 0, "State=[disabled]", "")?;
            }
            StepOutcome::Event(DecodedEvent::SyncObserved { core, f_addr }) => {
                let key_value = format!("FAddr=[0x{f_addr:x}]");
                self.write_line(EventKind::Events, *core, None, *f_addr, &key_value, "")?;
            }
            StepOutcome::Event(DecodedEvent::MissedMessages { core }) => {
                self.write_line(EventKind::Events, *core, None, 0, "MissedMessages=[1]", "")?;
            }
            StepOutcome::Warning(warning) => {
                let key_value = format!("Warning=[{warning:?}]");
                self.write_line(EventKind::Events, warning_core(warning), None, 0, &key_value, "")?;
            }
            StepOutcome::NeedMoreData | StepOutcome::Eof => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for writer in self.files.values_mut() {
            writer.flush()?;
        }
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
