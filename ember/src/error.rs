//! The error type of the database core.

use std::sync::Arc;

use ember_base::{CodecError, Link, LinkError, MissingBlock};

/// Errors surfaced by the database core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A stored item does not exist. Usually recoverable.
    #[error("not found: {0}")]
    NotFound(String),
    /// A referenced block could not be resolved from any source.
    #[error("missing block {0}")]
    MissingBlock(Link),
    /// A second, different encryption key was supplied for the same database.
    #[error("encryption key mismatch")]
    KeyMismatch,
    /// A CAR file did not start with a valid header block.
    #[error("malformed car header")]
    MalformedHeader,
    /// Authenticated decryption failed.
    #[error("decryption failed")]
    Decrypt,
    /// A compaction is running and the operation cannot proceed.
    #[error("compaction in progress")]
    Compacting,
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("gateway error: {0:#}")]
    Gateway(anyhow::Error),
    #[error(transparent)]
    Car(#[from] ember_car::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Other(anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub(crate) fn gateway(err: impl Into<anyhow::Error>) -> Self {
        Error::Gateway(err.into())
    }
}

impl From<MissingBlock> for Error {
    fn from(value: MissingBlock) -> Self {
        Error::MissingBlock(value.0)
    }
}

/// Recovers typed errors that travelled through `anyhow`.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<Error>() {
            Ok(err) => return err,
            Err(err) => err,
        };
        let err = match err.downcast::<MissingBlock>() {
            Ok(missing) => return Error::MissingBlock(missing.0),
            Err(err) => err,
        };
        match err.downcast::<CodecError>() {
            Ok(err) => Error::Codec(err),
            Err(err) => Error::Other(err),
        }
    }
}

/// Errors shared between several waiters of one future.
impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(shared) => match shared.as_ref() {
                Error::NotFound(what) => Error::NotFound(what.clone()),
                Error::MissingBlock(link) => Error::MissingBlock(*link),
                Error::KeyMismatch => Error::KeyMismatch,
                Error::MalformedHeader => Error::MalformedHeader,
                Error::Decrypt => Error::Decrypt,
                Error::Compacting => Error::Compacting,
                Error::Consistency(msg) => Error::Consistency(msg.clone()),
                Error::Configuration(msg) => Error::Configuration(msg.clone()),
                other => Error::Other(anyhow::anyhow!("{other:#}")),
            },
        }
    }
}
