//! Renders `ITCPerfFSM` counter events as `perf script`-style text: one
//! file per counter index plus a `.perf` aggregate carrying every sample
//! and definition in arrival order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use nexus_trace_core::{DecodedEvent, StepOutcome};

use crate::error::Result;
use crate::EventSink;

fn fmt_ts(ts: Option<u64>) -> String {
    ts.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Writes `<base>.perf` (every sample/def, interleaved) plus
/// `<base>.perf.<index>` (one per counter channel, lazily opened on that
/// channel's first sample).
pub struct PerfWriter {
    base: PathBuf,
    aggregate: BufWriter<File>,
    per_counter: HashMap<u32, BufWriter<File>>,
}

impl PerfWriter {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        let aggregate = BufWriter::new(File::create(format!("{}.perf", base.display()))?);
        Ok(PerfWriter {
            base,
            aggregate,
            per_counter: HashMap::new(),
        })
    }

    fn counter_file(&mut self, channel: u32) -> Result<&mut BufWriter<File>> {
        if !self.per_counter.contains_key(&channel) {
            let path = format!("{}.perf.{channel}", self.base.display());
            let file = File::create(path)?;
            self.per_counter.insert(channel, BufWriter::new(file));
        }
        Ok(self.per_counter.get_mut(&channel).unwrap())
    }

    fn write_both(&mut self, channel: u32, line: &str) -> Result<()> {
        writeln!(self.aggregate, "{line}")?;
        writeln!(self.counter_file(channel)?, "{line}")?;
        Ok(())
    }
}

impl EventSink for PerfWriter {
    fn accept(&mut self, outcome: &StepOutcome) -> Result<()> {
        match outcome {
            StepOutcome::Event(DecodedEvent::ItcPerfSample {
                core,
                channel,
                address,
                value,
                ..
            }) => {
                let line = format!(
                    "[{core}] {} PC=0x{address:x} [Perf Cntr] [Index={channel}] [Value={value}]",
                    fmt_ts(None)
                );
                self.write_both(*channel, &line)?;
            }
            StepOutcome::Event(DecodedEvent::CounterDef { core, channel, def }) => {
                let line = format!(
                    "[{core}] {} [Perf Cntr Def] [Index={channel}] [Type={}] [Mask=0x{:x}]",
                    fmt_ts(None),
                    def.cnt_type,
                    def.cntr_mask
                );
                self.write_both(*channel, &line)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.aggregate.flush()?;
        for writer in self.per_counter.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_trace_core::itc_perf_fsm::CounterDef;
    use tempfile::tempdir;

    #[test]
    fn sample_lands_in_both_aggregate_and_per_counter_file() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let mut writer = PerfWriter::new(&base).unwrap();
        writer
            .accept(&StepOutcome::Event(DecodedEvent::ItcPerfSample {
                core: 0,
                channel: 2,
                address: 0x4000,
                value: 99,
                call_site: 0,
            }))
            .unwrap();
        writer.finish().unwrap();

        let aggregate = std::fs::read_to_string(format!("{}.perf", base.display())).unwrap();
        assert!(aggregate.contains("[Perf Cntr] [Index=2] [Value=99]"));
        let per_counter = std::fs::read_to_string(format!("{}.perf.2", base.display())).unwrap();
        assert!(per_counter.contains("[Value=99]"));
    }

    #[test]
    fn counter_def_is_tagged_separately_from_samples() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let mut writer = PerfWriter::new(&base).unwrap();
        writer
            .accept(&StepOutcome::Event(DecodedEvent::CounterDef {
                core: 0,
                channel: 1,
                def: CounterDef {
                    cnt_type: 3,
                    ..Default::default()
                },
            }))
            .unwrap();
        writer.finish().unwrap();

        let aggregate = std::fs::read_to_string(format!("{}.perf", base.display())).unwrap();
        assert!(aggregate.contains("[Perf Cntr Def]"));
    }
}
