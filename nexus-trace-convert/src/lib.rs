//! Converts a [`nexus_trace_core::StepOutcome`] stream into the three
//! output formats the decoder targets: CTF, a human-readable event log,
//! and a `perf script`-style report.

pub mod ctf;
mod error;
pub mod event_log;
pub mod perf;

pub use ctf::CtfWriter;
pub use error::{Error, Result};
pub use event_log::EventLogWriter;
pub use perf::PerfWriter;

use nexus_trace_core::StepOutcome;

/// Something that consumes a decode stream one [`StepOutcome`] at a time.
pub trait EventSink {
    fn accept(&mut self, outcome: &StepOutcome) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}
