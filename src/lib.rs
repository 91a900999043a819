#![forbid(unsafe_code)]

//! Track-changes (review mode) CRDT for plain text.
//!
//! Replicas hold independent copies of a document. Users edit text
//! directly, propose insertions and deletions as *suggestions* that stay
//! visible but unapplied until reviewed, accept or decline suggestions,
//! and attach comments to ranges. Replicas exchange causally tagged
//! annotation records and converge without coordination.
//!
//! The character-positioning text CRDT is consumed through the
//! [`core::text::TextBuffer`] trait; an in-memory reference
//! implementation and a causal message router live in [`test_harness`].

pub mod config;
pub mod core;
pub mod document;
pub mod error;
pub mod telemetry;
pub mod test_harness;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::config::Config;
pub use crate::core::{
    AnchorRange, Annotation, AnnotationId, AnnotationKind, Bias, CoreError, DecodeError, DocEvent,
    DropReason, EncodeError, IngestOutcome, InvalidId, InvalidRange, Lamport, LamportClock, Op,
    Patch, Position, RangePatch, Record, RecordId, RemoveReason, SenderId, Stamp, Stamped,
    TextBuffer, UserId, WallClock,
};
pub use crate::document::Document;
