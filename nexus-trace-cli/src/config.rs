//! `.properties`-file configuration, in the style of the `TraceSettings`
//! key/value files this decoder's source encoder ships alongside a
//! capture: one `key=value` pair per line, `#`-prefixed comments, blank
//! lines ignored. Key names match the documented property keys a capture
//! tool writes out, not an invented shorthand, so a settings file produced
//! by that tool loads here unmodified.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nexus_trace_core::address_walker::TraceType;
use nexus_trace_core::ca_engine::CaMode;
use nexus_trace_core::fsm::DecoderConfig;
use nexus_trace_core::instr_decode::ArchSize;
use nexus_trace_core::itc_perf_fsm::PerfValueMode;
use nexus_trace_core::itc_router::ItcPrintOpts;

use crate::error::{Error, Result};

pub fn load_properties(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_properties(&text)
}

fn parse_properties(text: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (i, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| Error::MalformedProperties {
            line: i + 1,
            text: raw_line.to_string(),
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn property_to_perf_mode(value: Option<&String>) -> PerfValueMode {
    match value.map(String::as_str) {
        Some("delta") => PerfValueMode::Delta,
        Some("deltaxor") => PerfValueMode::DeltaXor,
        _ => PerfValueMode::Raw,
    }
}

fn property_bool(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("true") | Some("1") | Some("yes"))
}

/// Settings this decoder reads but that live outside [`DecoderConfig`]:
/// source-path rewriting, the CA companion file, and output-format
/// metadata consumed by the converters rather than the core decoder.
#[derive(Debug, Clone, Default)]
pub struct TraceSettings {
    pub source_root: Option<PathBuf>,
    pub source_cutpath: Option<String>,
    pub ca_file: Option<PathBuf>,
    /// `TSSize`: width in bits of the timestamp field, for converters that
    /// render absolute wall-clock time from `starttime` + a tick count.
    pub ts_size: Option<u8>,
    pub path_type: Option<String>,
    /// `freq`: timestamp tick frequency in Hz.
    pub freq: Option<u64>,
    pub ctf_enable: bool,
    pub event_conversion_enable: bool,
    pub start_time: Option<u64>,
    pub hostname: Option<String>,
}

/// Builds a [`DecoderConfig`] from a properties map, falling back to
/// defaults for anything unset. CLI flags are applied on top of this by
/// the caller, so flags always win over the properties file.
pub fn decoder_config_from_properties(props: &HashMap<String, String>) -> DecoderConfig {
    let mut config = DecoderConfig::default();
    if let Some(bits) = props.get("srcbits").and_then(|v| v.parse().ok()) {
        config.srcbits = bits;
    }
    if let Some(arch) = props.get("arch") {
        config.arch = match arch.as_str() {
            "rv32" => ArchSize::Rv32,
            _ => ArchSize::Rv64,
        };
    }
    config.itc_print_opts = if property_bool(props.get("trace.config.boolean.enable.itc.print.processing")) {
        match props.get("trace.config.int.itc.print.buffersize").and_then(|v| v.parse::<u32>().ok()) {
            Some(0) | None => ItcPrintOpts::Print,
            Some(_) => ItcPrintOpts::Nls,
        }
    } else {
        ItcPrintOpts::None
    };
    if let Some(channel) = props
        .get("trace.config.int.itc.print.channel")
        .and_then(|v| v.parse::<u32>().ok())
    {
        config.itc_print_channel_mask = 1 << channel.min(31);
    }
    config.perf_address_mode = property_to_perf_mode(props.get("trace.config.int.itc.perf.address"));
    config.perf_value_mode = property_to_perf_mode(props.get("trace.config.int.itc.perf"));
    if let Some(marker) = props
        .get("trace.config.int.itc.perf.marker")
        .and_then(|v| v.parse().ok())
    {
        config.perf_marker = marker;
    }
    if let Some(caf) = props.get("caType") {
        config.ca_mode = match caf.as_str() {
            "instruction" => CaMode::Instruction,
            "vector" => CaMode::Vector,
            _ => CaMode::None,
        };
    }
    if let Some(tt) = props.get("traceType") {
        config.force_trace_type = match tt.as_str() {
            "htm" => Some(TraceType::Htm),
            "btm" => Some(TraceType::Btm),
            _ => None,
        };
    }
    config
}

/// Builds the non-[`DecoderConfig`] settings (source rewriting, CA file,
/// output metadata) from the same properties map.
pub fn trace_settings_from_properties(props: &HashMap<String, String>) -> TraceSettings {
    TraceSettings {
        source_root: props.get("source.root").map(PathBuf::from),
        source_cutpath: props.get("source.cutpath").cloned(),
        ca_file: props.get("caFile").map(PathBuf::from),
        ts_size: props.get("TSSize").and_then(|v| v.parse().ok()),
        path_type: props.get("pathType").cloned(),
        freq: props.get("freq").and_then(|v| v.parse().ok()),
        ctf_enable: property_bool(props.get("ctfenable")),
        event_conversion_enable: property_bool(props.get("eventConversionEnable")),
        start_time: props.get("starttime").and_then(|v| v.parse().ok()),
        hostname: props.get("hostname").cloned(),
    }
}
