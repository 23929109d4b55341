use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error writing trace output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize CTF metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
