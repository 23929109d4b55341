use thiserror::Error;

/// The error type used by this crate.
///
/// Most malformed-stream conditions are *not* represented here — they are
/// recoverable and are surfaced through [`crate::StepOutcome`] instead, per
/// the decoder's error-handling design. This enum only covers conditions
/// that make the decoder itself unusable going forward.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("unreadable trace stream: {0}")]
    UnreadableStream(#[source] std::io::Error),

    #[error("end of stream reached before the first sync message")]
    EofBeforeFirstSync,

    #[error("count exhaustion at a non-count-exhausting boundary for core {core}")]
    CountExhaustionLogicError { core: u8 },

    #[error("core id {0} exceeds the maximum supported core count ({MAX_CORES})", MAX_CORES = crate::MAX_CORES)]
    CoreIdOutOfRange(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
