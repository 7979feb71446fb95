use ember_base::{CodecError, LinkError};

/// Car utility error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to parse CAR file: {0}")]
    Parsing(String),
    #[error("Invalid CAR file: {0}")]
    InvalidFile(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Ld read too large {0}")]
    LdReadTooLarge(usize),
}
