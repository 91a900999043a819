//! Core capability errors (identity parsing, range validation, lookup).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details. Wire failures live in
//! `core::wire` next to the codec.

use thiserror::Error;

use super::identity::AnnotationId;

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("user id `{raw}` is invalid: {reason}")]
    User { raw: String, reason: String },
    #[error("sender id `{raw}` is invalid: {reason}")]
    Sender { raw: String, reason: String },
    #[error("record id `{raw}` is invalid: {reason}")]
    Record { raw: String, reason: String },
    #[error("annotation id `{raw}` is invalid: {reason}")]
    Annotation { raw: String, reason: String },
}

/// Caller-supplied index range out of bounds or inverted.
#[derive(Debug, Error, Clone)]
#[error("range {start}..{end} is invalid for document of length {len}")]
pub struct InvalidRange {
    pub start: usize,
    pub end: usize,
    pub len: usize,
}

/// Accept/decline/remove aimed at an id with no live annotation here.
#[derive(Debug, Error, Clone)]
#[error("no live annotation with id {id}")]
pub struct UnknownAnnotation {
    pub id: AnnotationId,
}

/// The live annotation exists but is not of the kind the operation needs
/// (e.g. `remove_comment` on a suggestion).
#[derive(Debug, Error, Clone)]
#[error("annotation {id} is not a {expected}")]
pub struct KindMismatch {
    pub id: AnnotationId,
    pub expected: &'static str,
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidRange(#[from] InvalidRange),
    #[error(transparent)]
    UnknownAnnotation(#[from] UnknownAnnotation),
    #[error(transparent)]
    KindMismatch(#[from] KindMismatch),
}
