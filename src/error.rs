use std::fmt::Display;

/// cinderdb errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Stored data failed validation: bad checksum, truncated record,
    /// malformed encoding, or an on-disk structure that violates an
    /// invariant.
    Corruption(String),
    /// The requested operation is not supported by this build or this
    /// database (for example an unknown compression type).
    NotSupported(String),
    /// Invalid user input, typically bad options or a malformed argument.
    InvalidArgument(String),
    /// An IO error from the underlying filesystem.
    Io(String),
    /// The database directory is locked by another process.
    LockHeld(String),
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    /// Whether this error denotes corrupted stored data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::LockHeld(msg) => write!(f, "lock held: {msg}"),
        }
    }
}

/// A cinderdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
