mod cli;
mod config;
mod error;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};

use clap::Parser;

use nexus_trace_convert::{CtfWriter, EventLogWriter, EventSink, PerfWriter};
use nexus_trace_core::address_walker::TraceType;
use nexus_trace_core::ca_engine::{CaBlockReader, CaMode, CaRecord};
use nexus_trace_core::fsm::Decoder;
use nexus_trace_core::{ExecutableLookup, SourceLocation, StepOutcome};
use nexus_trace_elf::{ElfImage, PathRewriteRule, PathRewriter};

use cli::{Action, CaTypeArg, DecodeArgs, OutputFormat, Opt, TraceTypeArg};
use error::Result;

/// Used when the caller didn't supply an ELF image: instructions still
/// retire, just without raw encoding, source info, or computed targets
/// for direct transfers.
struct NullLookup;

impl ExecutableLookup for NullLookup {
    fn read_instruction_bytes(&self, _core: u8, _pc: u64) -> Option<[u8; 4]> {
        None
    }

    fn resolve_source(&self, _pc: u64) -> Option<SourceLocation> {
        None
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let verbosity = match &opt.action {
        Action::Decode(args) => args.verbose,
    };
    init_logging(verbosity);
    match opt.action {
        Action::Decode(args) => run_decode(args),
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn run_decode(args: DecodeArgs) -> Result<()> {
    let properties = match &args.properties {
        Some(path) => config::load_properties(path)?,
        None => Default::default(),
    };
    let mut decoder_config = config::decoder_config_from_properties(&properties);
    let mut trace_settings = config::trace_settings_from_properties(&properties);
    if let Some(bits) = args.srcbits {
        decoder_config.srcbits = bits;
    }
    if let Some(ca_type) = args.ca_type {
        decoder_config.ca_mode = match ca_type {
            CaTypeArg::None => CaMode::None,
            CaTypeArg::Instruction => CaMode::Instruction,
            CaTypeArg::Vector => CaMode::Vector,
        };
    }
    if let Some(trace_type) = args.trace_type {
        decoder_config.force_trace_type = Some(match trace_type {
            TraceTypeArg::Htm => TraceType::Htm,
            TraceTypeArg::Btm => TraceType::Btm,
        });
    }
    if let Some(pcd) = &args.pcd {
        trace_settings.ca_file = Some(pcd.clone());
    }

    let trace_path = args.trace.or(args.rtd).ok_or(error::Error::MissingTraceInput)?;
    let trace_file = File::open(&trace_path).map_err(|source| error::Error::Io {
        path: trace_path.display().to_string(),
        source,
    })?;

    let rewriter = PathRewriter::new(
        args.rewrite_paths
            .iter()
            .map(|(from, to)| PathRewriteRule {
                from: from.clone(),
                to: to.clone(),
            })
            .collect(),
    );

    // `EventLog`/`Perf` open their own `<base>.<kind>` files rather than
    // writing to a single stream; `--output` (or, failing that, the ELF
    // image's path, or the raw trace's) supplies that base.
    let base_path = args
        .output
        .clone()
        .or_else(|| args.elf.clone())
        .unwrap_or_else(|| trace_path.clone());

    let mut sink: Box<dyn EventSink> = match args.format {
        OutputFormat::Ctf => {
            let output: Box<dyn Write> = match &args.output {
                Some(path) => Box::new(BufWriter::new(File::create(path).map_err(|source| {
                    error::Error::Io {
                        path: path.display().to_string(),
                        source,
                    }
                })?)),
                None => Box::new(BufWriter::new(std::io::stdout())),
            };
            Box::new(CtfWriter::new(output, args.stream_id))
        }
        OutputFormat::EventLog => Box::new(EventLogWriter::new(base_path)),
        OutputFormat::Perf => Box::new(PerfWriter::new(&base_path)?),
    };

    let ca_reader = match (decoder_config.ca_mode, &trace_settings.ca_file) {
        (CaMode::None, _) | (_, None) => None,
        (mode, Some(path)) => {
            let file = File::open(path).map_err(|source| error::Error::Io {
                path: path.display().to_string(),
                source,
            })?;
            Some(CaBlockReader::new(file, mode))
        }
    };

    match args.elf {
        Some(path) => {
            let image = ElfImage::open(&path.display().to_string(), rewriter)?;
            decode_loop(trace_file, image, decoder_config, ca_reader, sink.as_mut())
        }
        None => decode_loop(trace_file, NullLookup, decoder_config, ca_reader, sink.as_mut()),
    }?;
    sink.finish()?;
    Ok(())
}

/// Feeds the instruction trace through the decoder, pulling correlation
/// records from the CA companion stream one per retirement once the
/// companion reader has locked onto the first sync's anchor PC. Only
/// core 0's stream is wired up; multi-core companion correlation isn't
/// exposed by this CLI yet.
fn decode_loop<R: std::io::Read, L: ExecutableLookup>(
    reader: R,
    lookup: L,
    config: nexus_trace_core::fsm::DecoderConfig,
    mut ca_reader: Option<CaBlockReader<File>>,
    sink: &mut dyn EventSink,
) -> Result<()> {
    let mut decoder = Decoder::new(reader, lookup, config);
    let mut ca_queue: VecDeque<CaRecord> = VecDeque::new();
    let mut ca_synced = false;
    loop {
        let outcome = decoder.next_instruction()?;
        if let StepOutcome::Retired(ref retired) = outcome {
            if retired.core == 0 {
                if let Some(reader) = ca_reader.as_mut() {
                    if !ca_synced {
                        if reader.sync(0, retired.pc).is_ok() {
                            ca_synced = true;
                        }
                    }
                    if ca_synced {
                        if ca_queue.is_empty() {
                            if let Ok(Some(records)) = reader.next_records() {
                                ca_queue.extend(records);
                            }
                        }
                        if let Some(record) = ca_queue.pop_front() {
                            decoder.feed_ca_record(0, record);
                        }
                    }
                }
            }
        }
        match outcome {
            StepOutcome::Eof => break,
            outcome => sink.accept(&outcome)?,
        }
    }
    Ok(())
}
