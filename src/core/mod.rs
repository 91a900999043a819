//! Core domain types for redline (Layers 0-8)
//!
//! Module hierarchy follows type dependency order:
//! - time: Lamport primitives (Layer 0)
//! - identity: UserId, SenderId, AnnotationId, RecordId (Layer 1)
//! - error: invariant and range errors (Layer 1)
//! - text: Position/TextBuffer seam to the text CRDT (Layer 2)
//! - record: operation records, the action x description matrix (Layer 3)
//! - annotation: effective annotations, remove reasons (Layer 4)
//! - log: per-id stamped histories, ingest policy, snapshots (Layer 5)
//! - wire: canonical CBOR encoding of records and snapshots (Layer 6)
//! - view: position-indexed data points (Layer 7)
//! - event: emitted editor events (Layer 7)
//! - engine: record processing and derived side-effects (Layer 8)

pub mod annotation;
pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod log;
pub mod record;
pub mod text;
pub mod time;
pub mod view;
pub mod wire;

pub use annotation::{Annotation, AnnotationKind, RemoveReason};
pub use engine::Engine;
pub use error::{CoreError, InvalidId, InvalidRange, KindMismatch, UnknownAnnotation};
pub use event::DocEvent;
pub use identity::{AnnotationId, RecordId, SenderId, UserId};
pub use log::{AnnotationLog, DropReason, IngestOutcome};
pub use record::{AnchorRange, Op, Patch, RangePatch, Record, Stamped};
pub use text::{Bias, Position, PositionBytesError, TextBuffer};
pub use time::{Lamport, LamportClock, Stamp, WallClock};
pub use view::{DataPoint, RangeIndex, ViewEntry};
pub use wire::{
    decode_record, decode_snapshot, encode_record, encode_snapshot, DecodeError, EncodeError,
};
