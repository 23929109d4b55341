use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read executable file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse object file: {0}")]
    Object(#[from] object::Error),
    #[error("failed to parse debug info: {0}")]
    Dwarf(#[source] gimli::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
