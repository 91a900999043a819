//! Crate-level convenience error.
//!
//! Not a "god error": a thin wrapper over the canonical capability
//! errors. Recoverable delivery conditions (stale records, missing
//! dependencies, duplicates) never surface here; they are dropped inside
//! the log/engine per policy. Only caller mistakes and wire corruption
//! reach the caller.

use thiserror::Error;

use crate::core::{CoreError, DecodeError, EncodeError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Malformed record or snapshot: fatal to the current replica.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
