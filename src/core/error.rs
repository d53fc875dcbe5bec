use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    CorruptRecord,
    LockTimeout,
    KeyNotFound,
    BlobChainBroken,
    InvalidArgument,
    InvalidState,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    /// A record that cannot be decoded; fatal for the record, not the file.
    pub fn corrupt(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::CorruptRecord, context.into())
    }

    /// Non-exceptional miss for lookups by key.
    pub fn key_not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::KeyNotFound, context.into())
    }

    pub fn lock_timeout(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::LockTimeout, context.into())
    }

    pub fn blob_chain(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::BlobChainBroken, context.into())
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, context.into())
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, context.into())
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, context.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::CorruptRecord,
            context: format!("manifest error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
