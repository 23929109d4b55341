use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed properties file at line {line}: {text}")]
    MalformedProperties { line: usize, text: String },
    #[error("no trace input given: pass a path, `--rtd <path>`")]
    MissingTraceInput,
    #[error(transparent)]
    Elf(#[from] nexus_trace_elf::Error),
    #[error(transparent)]
    Convert(#[from] nexus_trace_convert::Error),
    #[error(transparent)]
    Decode(#[from] nexus_trace_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
