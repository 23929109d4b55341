use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "nexus-trace",
    version,
    about = "Decodes a Nexus-style RISC-V hardware instruction trace into CTF, a text event log, or a perf-script report."
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Decode a raw trace capture and write it in the requested format.
    Decode(DecodeArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Ctf,
    EventLog,
    Perf,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum TraceTypeArg {
    Htm,
    Btm,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum CaTypeArg {
    None,
    Instruction,
    Vector,
}

#[derive(Debug, clap::Args)]
pub struct DecodeArgs {
    /// Raw trace capture to decode. Equivalent to `--rtd`; give either one.
    pub trace: Option<PathBuf>,

    /// Raw trace data file, as an alternative to the positional argument.
    #[arg(long = "rtd")]
    pub rtd: Option<PathBuf>,

    /// ELF image the trace was captured against. Without it, retired
    /// instructions carry no raw encoding, source location, or computed
    /// branch targets.
    #[arg(long)]
    pub elf: Option<PathBuf>,

    /// `.properties` file with decoder settings (srcbits, itc print
    /// channels, CA file, ...).
    #[arg(long)]
    pub properties: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "event-log")]
    pub format: OutputFormat,

    /// Output path; defaults to stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Overrides `srcbits` from the properties file.
    #[arg(long)]
    pub srcbits: Option<u8>,

    /// Program-counter/correlation data file: the CA companion stream
    /// recorded alongside the raw trace. Overrides `caFile` from the
    /// properties file.
    #[arg(long = "pcd")]
    pub pcd: Option<PathBuf>,

    /// Overrides `caType` from the properties file.
    #[arg(long = "caType", value_enum)]
    pub ca_type: Option<CaTypeArg>,

    /// Forces BTM or HTM decoding regardless of what the stream's sync
    /// messages would otherwise select. Overrides `traceType` from the
    /// properties file.
    #[arg(long = "traceType", value_enum)]
    pub trace_type: Option<TraceTypeArg>,

    /// Source path rewrite rule, `from=to`. May be given multiple times.
    #[arg(long = "rewrite-path", value_parser = parse_rewrite_rule)]
    pub rewrite_paths: Vec<(String, String)>,

    /// CTF stream id (only used with `--format ctf`).
    #[arg(long, default_value_t = 0)]
    pub stream_id: u32,

    /// Increase log verbosity; repeat for more detail (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_rewrite_rule(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| format!("expected `from=to`, got `{s}`"))
}
