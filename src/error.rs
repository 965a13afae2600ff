use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Coppice errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The named stream is not stored in this log or store.
    NotFound,
    /// Invalid user input, typically an offset or length outside a stream's
    /// live range, or a malformed stream name.
    InvalidInput(String),
    /// A mutation was attempted on a sealed log.
    Finalized,
    /// On-disk state failed validation: trailer magic mismatch, dictionary
    /// offsets out of range, or a broken extent chain.
    Corruption(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "stream not found"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Finalized => write!(f, "log is finalized"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A coppice Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
