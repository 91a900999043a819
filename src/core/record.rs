//! Layer 3: Operation records.
//!
//! One record per user action, replicated through the annotation log.
//! The action x description matrix of valid records is a closed sum:
//! additions carry a range (insert-suggestion, delete-suggestion,
//! comment), removals carry the id they terminate, updates carry a
//! range patch. Anything else is unrepresentable.

use serde::{Deserialize, Serialize};

use super::identity::{AnnotationId, RecordId, UserId};
use super::text::Position;
use super::time::{Stamp, WallClock};

/// Anchored range of an annotation.
///
/// `None` endpoints are open: start `None` means "from the document
/// beginning", end `None` means "to the document end". `*_closed`
/// controls whether the endpoint character itself belongs to the range;
/// open (`None`) endpoints are never closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRange<P> {
    pub start: Option<P>,
    pub end: Option<P>,
    pub start_closed: bool,
    pub end_closed: bool,
}

impl<P: Position> AnchorRange<P> {
    /// Both endpoints anchored on characters that belong to the range.
    pub fn closed(start: P, end: P) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            start_closed: true,
            end_closed: true,
        }
    }

    /// Exclusive anchors on the neighboring characters, or `None` for a
    /// range open to the document boundary.
    pub fn open(start: Option<P>, end: Option<P>) -> Self {
        Self {
            start,
            end,
            start_closed: false,
            end_closed: false,
        }
    }
}

/// Three-way patch for one field of an [`AnchorRange`]: leave untouched,
/// reset to open, or set a new anchor.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// Property rewrite carried by an Update record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangePatch<P> {
    pub start: Patch<P>,
    pub end: Patch<P>,
    pub start_closed: Option<bool>,
    pub end_closed: Option<bool>,
    /// New comment text, for comment annotations.
    pub text: Option<String>,
}

impl<P> Default for RangePatch<P> {
    fn default() -> Self {
        Self {
            start: Patch::Keep,
            end: Patch::Keep,
            start_closed: None,
            end_closed: None,
            text: None,
        }
    }
}

impl<P> RangePatch<P> {
    pub fn is_empty(&self) -> bool {
        self.start.is_keep()
            && self.end.is_keep()
            && self.start_closed.is_none()
            && self.end_closed.is_none()
            && self.text.is_none()
    }
}

/// The operation a record performs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op<P> {
    InsertSuggestion {
        range: AnchorRange<P>,
    },
    DeleteSuggestion {
        range: AnchorRange<P>,
    },
    AddComment {
        range: AnchorRange<P>,
        text: String,
    },
    AcceptSuggestion {
        dependent_on: AnnotationId,
    },
    DeclineSuggestion {
        dependent_on: AnnotationId,
    },
    RemoveComment {
        dependent_on: AnnotationId,
    },
    Update {
        dependent_on: AnnotationId,
        patch: RangePatch<P>,
    },
}

impl<P> Op<P> {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Op::InsertSuggestion { .. } => "insert_suggestion",
            Op::DeleteSuggestion { .. } => "delete_suggestion",
            Op::AddComment { .. } => "add_comment",
            Op::AcceptSuggestion { .. } => "accept_suggestion",
            Op::DeclineSuggestion { .. } => "decline_suggestion",
            Op::RemoveComment { .. } => "remove_comment",
            Op::Update { .. } => "update",
        }
    }

    pub fn is_addition(&self) -> bool {
        matches!(
            self,
            Op::InsertSuggestion { .. } | Op::DeleteSuggestion { .. } | Op::AddComment { .. }
        )
    }

    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Op::AcceptSuggestion { .. } | Op::DeclineSuggestion { .. } | Op::RemoveComment { .. }
        )
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Op::Update { .. })
    }

    /// The Addition id this record refers to, for removals and updates.
    pub fn dependent_on(&self) -> Option<AnnotationId> {
        match self {
            Op::AcceptSuggestion { dependent_on }
            | Op::DeclineSuggestion { dependent_on }
            | Op::RemoveComment { dependent_on }
            | Op::Update { dependent_on, .. } => Some(*dependent_on),
            _ => None,
        }
    }
}

/// One annotation-log record, pre-stamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<P> {
    pub id: RecordId,
    pub user: UserId,
    /// Wall clock at creation. Display only, never authoritative.
    pub at: WallClock,
    pub op: Op<P>,
}

impl<P> Record<P> {
    /// Grouping key in the log: the annotation id this record belongs to.
    /// Additions introduce it (their own record id); removals and updates
    /// name it through `dependent_on`.
    pub fn change_id(&self) -> AnnotationId {
        match self.op.dependent_on() {
            Some(id) => id,
            None => AnnotationId::from(self.id),
        }
    }
}

/// A record together with the causal stamp assigned on delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<P> {
    pub stamp: Stamp,
    pub record: Record<P>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::PathPos;

    fn record(op: Op<PathPos>) -> Record<PathPos> {
        Record {
            id: RecordId::random(),
            user: UserId::new("u1").unwrap(),
            at: WallClock(0),
            op,
        }
    }

    #[test]
    fn additions_group_under_their_own_id() {
        let rec = record(Op::InsertSuggestion {
            range: AnchorRange::open(None, None),
        });
        assert_eq!(rec.change_id(), AnnotationId::from(rec.id));
    }

    #[test]
    fn removals_group_under_the_addition_id() {
        let target = AnnotationId::random();
        let rec = record(Op::AcceptSuggestion {
            dependent_on: target,
        });
        assert_eq!(rec.change_id(), target);
        assert!(rec.op.is_removal());
        assert!(!rec.op.is_addition());
    }

    #[test]
    fn empty_patch_is_detectable() {
        let patch = RangePatch::<PathPos>::default();
        assert!(patch.is_empty());
        let patch = RangePatch::<PathPos> {
            end_closed: Some(true),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
