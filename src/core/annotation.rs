//! Layer 4: Effective annotations.
//!
//! An annotation's effective shape is its Addition folded with every
//! Update in stamp order. The engine stores these by value; identity is
//! the annotation id, there are no back-pointers.

use serde::{Deserialize, Serialize};

use super::identity::{AnnotationId, UserId};
use super::record::{AnchorRange, Op, Patch, RangePatch, Record, Stamped};
use super::text::Position;
use super::time::WallClock;

/// What an annotation proposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnnotationKind {
    InsertSuggestion,
    DeleteSuggestion,
    Comment,
}

impl AnnotationKind {
    pub fn is_suggestion(self) -> bool {
        matches!(
            self,
            AnnotationKind::InsertSuggestion | AnnotationKind::DeleteSuggestion
        )
    }
}

/// Why an annotation left the derived view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveReason {
    Accepted,
    Declined,
    /// An Update rewrote the shape; an add with the new shape follows.
    Replaced,
    Removed,
}

/// A live annotation: the folded shape the engine anchors into the view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation<P> {
    pub id: AnnotationId,
    pub author: UserId,
    pub kind: AnnotationKind,
    pub range: AnchorRange<P>,
    /// Comment body; `None` for suggestions.
    pub text: Option<String>,
    pub created: WallClock,
}

impl<P: Position> Annotation<P> {
    /// Materialize from an Addition record. `None` for non-additions.
    pub fn from_addition(stamped: &Stamped<P>) -> Option<Self> {
        let Record { id, user, at, op } = &stamped.record;
        let (kind, range, text) = match op {
            Op::InsertSuggestion { range } => {
                (AnnotationKind::InsertSuggestion, range.clone(), None)
            }
            Op::DeleteSuggestion { range } => {
                (AnnotationKind::DeleteSuggestion, range.clone(), None)
            }
            Op::AddComment { range, text } => {
                (AnnotationKind::Comment, range.clone(), Some(text.clone()))
            }
            _ => return None,
        };
        Some(Self {
            id: AnnotationId::from(*id),
            author: user.clone(),
            kind,
            range,
            text,
            created: *at,
        })
    }

    /// Fold one Update on top of the current shape.
    pub fn apply_patch(&mut self, patch: &RangePatch<P>) {
        match &patch.start {
            Patch::Keep => {}
            Patch::Clear => {
                self.range.start = None;
                self.range.start_closed = false;
            }
            Patch::Set(p) => self.range.start = Some(p.clone()),
        }
        match &patch.end {
            Patch::Keep => {}
            Patch::Clear => {
                self.range.end = None;
                self.range.end_closed = false;
            }
            Patch::Set(p) => self.range.end = Some(p.clone()),
        }
        if let Some(closed) = patch.start_closed {
            self.range.start_closed = closed && self.range.start.is_some();
        }
        if let Some(closed) = patch.end_closed {
            self.range.end_closed = closed && self.range.end.is_some();
        }
        if let Some(text) = &patch.text {
            if self.kind == AnnotationKind::Comment {
                self.text = Some(text.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::{RecordId, SenderId};
    use crate::core::time::Stamp;
    use crate::test_harness::PathPos;

    fn addition(range: AnchorRange<PathPos>) -> Stamped<PathPos> {
        Stamped {
            stamp: Stamp::new(1, SenderId::random()),
            record: Record {
                id: RecordId::random(),
                user: UserId::new("u1").unwrap(),
                at: WallClock(0),
                op: Op::InsertSuggestion { range },
            },
        }
    }

    #[test]
    fn materializes_only_from_additions() {
        let stamped = addition(AnchorRange::open(None, None));
        let ann = Annotation::from_addition(&stamped).unwrap();
        assert_eq!(ann.kind, AnnotationKind::InsertSuggestion);
        assert_eq!(ann.id, AnnotationId::from(stamped.record.id));

        let removal = Stamped {
            stamp: stamped.stamp.clone(),
            record: Record {
                id: RecordId::random(),
                user: UserId::new("u1").unwrap(),
                at: WallClock(0),
                op: Op::AcceptSuggestion {
                    dependent_on: ann.id,
                },
            },
        };
        assert!(Annotation::<PathPos>::from_addition(&removal).is_none());
    }

    #[test]
    fn patch_clear_reopens_the_endpoint() {
        let stamped = addition(AnchorRange::closed(
            PathPos::document_start(),
            PathPos::document_start(),
        ));
        let mut ann = Annotation::from_addition(&stamped).unwrap();
        ann.apply_patch(&RangePatch {
            end: Patch::Clear,
            ..Default::default()
        });
        assert_eq!(ann.range.end, None);
        assert!(!ann.range.end_closed);
        assert!(ann.range.start_closed);
    }
}
