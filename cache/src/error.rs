//! Crate-wide error type.
//!
//! Mirrors the shape the rest of this codebase expects from
//! `crate::error::{CResult, Error}`: a plain enum, no `thiserror`, matching
//! the error taxonomy a corruption-sensitive cache needs (see the error
//! handling design notes in the module docs of [`crate::cache`]).

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The underlying serializer reported corrupt or inconsistent on-disk
    /// state (bad checksum, transaction id moving backwards). Fatal: the
    /// cache that observes this should shut down rather than keep serving.
    Corruption(String),

    /// The free list has no more block ids to hand out.
    OutOfSpace,

    /// An internal invariant was violated in a way that should have been
    /// caught by a `debug_assert!` but wasn't (e.g. a caller passed a
    /// block id that was never acquired through this transaction).
    Internal(String),

    /// Bad input from a caller (e.g. a zero-length range passed where a
    /// non-empty one was required).
    InvalidInput(String),

    /// Failure encoding or decoding a patch or patch-log record.
    Serialization(String),

    /// I/O failure talking to the serializer's backing store.
    IO(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption at rest: {msg}"),
            Error::OutOfSpace => write!(f, "free list exhausted"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Error::IO(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

pub type CResult<T> = std::result::Result<T, Error>;
