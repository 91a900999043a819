//! Layer 8: The track-changes engine.
//!
//! Translates raw log records into user-visible semantics: maintains the
//! registry of live annotations and the position-indexed view, mediates
//! between opposing records through the stamp order, performs the derived
//! text mutations (deleting text when a delete-suggestion is accepted or
//! an insert-suggestion is declined), and emits the editor event stream.
//!
//! Processing is a before/after reconciliation: the registry holds the
//! previous effective state of an annotation id, the id's full history
//! determines the next one. The same path therefore covers first
//! delivery, updates (remove-as-Replaced then re-add), stale and
//! duplicate records (no diff), terminating removals, and
//! re-resurrection by a record that dominates a removal.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::annotation::{Annotation, AnnotationKind, RemoveReason};
use super::event::DocEvent;
use super::identity::{AnnotationId, UserId};
use super::record::{AnchorRange, Op, Stamped};
use super::text::{Bias, Position, TextBuffer};
use super::view::RangeIndex;

/// The effective annotation an id's history currently describes.
///
/// Live iff the history holds an Addition and its stamp-maximal record is
/// not a Removal; the shape is the Addition folded with every Update in
/// stamp order. A removal overridden by a later record is void (the
/// annotation resurrects with the newer record's effect).
pub fn effective<P: Position>(history: &[Stamped<P>]) -> Option<Annotation<P>> {
    let addition = history.iter().find(|held| held.record.op.is_addition())?;
    let last = history.last()?;
    if last.record.op.is_removal() {
        return None;
    }
    let mut annotation = Annotation::from_addition(addition)?;
    for held in history {
        if let Op::Update { patch, .. } = &held.record.op {
            annotation.apply_patch(patch);
        }
    }
    Some(annotation)
}

#[derive(Debug, Default)]
pub struct Engine<P> {
    live: BTreeMap<AnnotationId, Annotation<P>>,
    view: RangeIndex<P>,
}

impl<P: Position> Engine<P> {
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            view: RangeIndex::new(),
        }
    }

    /// Reconcile one annotation id against its (already merged) history.
    /// Returns the emitted events; may delete text as a side-effect.
    pub fn reconcile<T: TextBuffer<Pos = P>>(
        &mut self,
        id: AnnotationId,
        history: &[Stamped<P>],
        text: &mut T,
    ) -> Vec<DocEvent<P>> {
        let before = self.live.get(&id).cloned();
        let after = effective(history);
        let mut events = Vec::new();

        match (before, after) {
            (None, None) => {}
            (Some(old), None) => {
                let (reason, author) = removal_cause(history);
                events.extend(self.remove_annotation(&old, reason, author, text));
            }
            (None, Some(new)) => {
                events.push(self.add_annotation(new, text));
            }
            (Some(old), Some(new)) => {
                if old == new {
                    trace!(%id, "record left effective annotation unchanged");
                    return events;
                }
                let author = history
                    .last()
                    .map(|held| held.record.user.clone())
                    .unwrap_or_else(|| new.author.clone());
                events.extend(self.remove_annotation(
                    &old,
                    RemoveReason::Replaced,
                    author,
                    text,
                ));
                events.push(self.add_annotation(new, text));
            }
        }
        events
    }

    fn add_annotation<T: TextBuffer<Pos = P>>(
        &mut self,
        annotation: Annotation<P>,
        text: &T,
    ) -> DocEvent<P> {
        debug!(id = %annotation.id, kind = ?annotation.kind, "annotation added");
        self.view.add(&annotation);
        let (start_index, end_index) = resolve_range(text, &annotation.range);
        let event = DocEvent::AnnotationAdded {
            start_index,
            end_index,
            annotation: annotation.clone(),
        };
        self.live.insert(annotation.id, annotation);
        event
    }

    fn remove_annotation<T: TextBuffer<Pos = P>>(
        &mut self,
        annotation: &Annotation<P>,
        reason: RemoveReason,
        author: UserId,
        text: &mut T,
    ) -> Vec<DocEvent<P>> {
        debug!(id = %annotation.id, ?reason, "annotation removed");
        self.view.remove(annotation);
        self.live.remove(&annotation.id);

        let (start_index, end_index) = resolve_range(text, &annotation.range);
        let mut events = vec![DocEvent::AnnotationRemoved {
            start_index,
            end_index,
            annotation: annotation.clone(),
            reason,
            author,
        }];

        // Accepting a deletion or declining an insertion rewrites the text.
        let deletes_text = matches!(
            (annotation.kind, reason),
            (AnnotationKind::DeleteSuggestion, RemoveReason::Accepted)
                | (AnnotationKind::InsertSuggestion, RemoveReason::Declined)
        );
        if deletes_text && end_index > start_index {
            let removed = text.delete(start_index, end_index - start_index);
            let mut chars = String::with_capacity(removed.len());
            let mut positions = Vec::with_capacity(removed.len());
            for (pos, ch) in removed {
                positions.push(pos);
                chars.push(ch);
            }
            events.push(DocEvent::Delete {
                index: start_index,
                text: chars,
                positions,
            });
        }
        events
    }

    /// Live annotations applicable at `pos`, honoring endpoint
    /// visibility: an annotation applies iff the position is strictly
    /// inside its range, or sits on a closed endpoint.
    pub fn annotations_at(&self, pos: &P) -> Vec<&Annotation<P>> {
        let Some((point_key, point)) = self.view.governing(pos) else {
            return Vec::new();
        };
        let at_point = point_key == pos;
        let mut out = Vec::new();
        for (_, entry) in point.entries() {
            let Some(annotation) = self.live.get(&entry.id) else {
                continue;
            };
            if at_point {
                if entry.ending_here && !annotation.range.end_closed {
                    continue;
                }
                if entry.starting_here && !annotation.range.start_closed {
                    continue;
                }
            } else if entry.ending_here {
                // the range stopped at the data point left of `pos`
                continue;
            }
            out.push(annotation);
        }
        out
    }

    /// All live annotations, one entry per id.
    pub fn active_annotations(&self) -> impl Iterator<Item = &Annotation<P>> {
        self.live.values()
    }

    pub fn live_annotation(&self, id: &AnnotationId) -> Option<&Annotation<P>> {
        self.live.get(id)
    }

    pub fn view(&self) -> &RangeIndex<P> {
        &self.view
    }
}

fn removal_cause<P: Position>(history: &[Stamped<P>]) -> (RemoveReason, UserId) {
    // The stamp-maximal record is the terminating removal (S4: the
    // winning removal is the effective one, the loser is void).
    let last = history.last().expect("reconcile only runs on non-empty histories");
    let reason = match &last.record.op {
        Op::AcceptSuggestion { .. } => RemoveReason::Accepted,
        Op::DeclineSuggestion { .. } => RemoveReason::Declined,
        Op::RemoveComment { .. } => RemoveReason::Removed,
        _ => RemoveReason::Removed,
    };
    (reason, last.record.user.clone())
}

/// Resolve an anchored range to the visible `[start, end)` index window.
///
/// Open endpoints resolve to the document boundaries. A closed present
/// endpoint owns its character (the exclusive end is one past it); an
/// open present endpoint excludes it. Tombstoned endpoints collapse to
/// the visible gap where the character used to be.
pub fn resolve_range<T: TextBuffer>(
    text: &T,
    range: &AnchorRange<T::Pos>,
) -> (usize, usize) {
    let start = match &range.start {
        None => 0,
        Some(p) => {
            if range.start_closed && text.has(p) {
                text.index_of(p, Bias::Exact).unwrap_or(0)
            } else {
                text.index_of(p, Bias::Left).map_or(0, |i| i + 1)
            }
        }
    };
    let end = match &range.end {
        None => text.len(),
        Some(p) => {
            if text.has(p) {
                let at = text.index_of(p, Bias::Exact).unwrap_or(0);
                if range.end_closed {
                    at + 1
                } else {
                    at
                }
            } else {
                text.index_of(p, Bias::Left).map_or(0, |i| i + 1)
            }
        }
    };
    (start, end.max(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::{RecordId, SenderId};
    use crate::core::record::{Patch, RangePatch, Record};
    use crate::core::time::{Stamp, WallClock};
    use crate::test_harness::DenseText;

    type PathPos = <DenseText as TextBuffer>::Pos;

    fn sender(n: u128) -> SenderId {
        SenderId::from_uuid(uuid::Uuid::from_u128(n))
    }

    fn stamped(lamport: u64, op: Op<PathPos>) -> Stamped<PathPos> {
        Stamped {
            stamp: Stamp::new(lamport, sender(1)),
            record: Record {
                id: RecordId::random(),
                user: UserId::new("u1").unwrap(),
                at: WallClock(0),
                op,
            },
        }
    }

    fn closed_range(text: &DenseText, start: usize, end_inclusive: usize) -> AnchorRange<PathPos> {
        AnchorRange::closed(
            text.position_of(start).unwrap(),
            text.position_of(end_inclusive).unwrap(),
        )
    }

    fn run(
        engine: &mut Engine<PathPos>,
        text: &mut DenseText,
        history: &mut Vec<Stamped<PathPos>>,
        next: Stamped<PathPos>,
    ) -> Vec<DocEvent<PathPos>> {
        let id = next.record.change_id();
        let at = history
            .binary_search_by(|held| held.stamp.cmp(&next.stamp))
            .unwrap_err();
        history.insert(at, next);
        engine.reconcile(id, history, text)
    }

    #[test]
    fn accepting_a_delete_suggestion_deletes_exactly_its_range() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let mut engine = Engine::new();
        let mut history = Vec::new();

        let add = stamped(
            1,
            Op::DeleteSuggestion {
                range: closed_range(&text, 1, 3),
            },
        );
        let id = add.record.change_id();
        let events = run(&mut engine, &mut text, &mut history, add);
        assert!(matches!(
            events.as_slice(),
            [DocEvent::AnnotationAdded {
                start_index: 1,
                end_index: 4,
                ..
            }]
        ));

        let accept = stamped(2, Op::AcceptSuggestion { dependent_on: id });
        let events = run(&mut engine, &mut text, &mut history, accept);
        assert_eq!(text.contents(), "aef");
        assert!(matches!(
            events.as_slice(),
            [
                DocEvent::AnnotationRemoved {
                    reason: RemoveReason::Accepted,
                    ..
                },
                DocEvent::Delete { index: 1, .. }
            ]
        ));
        assert_eq!(engine.active_annotations().count(), 0);
    }

    #[test]
    fn update_replaces_then_re_adds() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let mut engine = Engine::new();
        let mut history = Vec::new();

        let add = stamped(
            1,
            Op::DeleteSuggestion {
                range: closed_range(&text, 1, 2),
            },
        );
        let id = add.record.change_id();
        run(&mut engine, &mut text, &mut history, add);

        let update = stamped(
            2,
            Op::Update {
                dependent_on: id,
                patch: RangePatch {
                    end: Patch::Set(text.position_of(4).unwrap()),
                    ..Default::default()
                },
            },
        );
        let events = run(&mut engine, &mut text, &mut history, update);
        assert!(matches!(
            events.as_slice(),
            [
                DocEvent::AnnotationRemoved {
                    reason: RemoveReason::Replaced,
                    end_index: 3,
                    ..
                },
                DocEvent::AnnotationAdded { end_index: 5, .. }
            ]
        ));
        assert_eq!(text.contents(), "abcdef");
    }

    #[test]
    fn dominated_removal_is_void_and_resurrects_nothing() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let mut engine = Engine::new();
        let mut history = Vec::new();

        let add = stamped(
            1,
            Op::DeleteSuggestion {
                range: closed_range(&text, 1, 2),
            },
        );
        let id = add.record.change_id();
        run(&mut engine, &mut text, &mut history, add);

        // An update stamped later than the removal arrives first.
        let update = stamped(
            5,
            Op::Update {
                dependent_on: id,
                patch: RangePatch {
                    end: Patch::Set(text.position_of(3).unwrap()),
                    ..Default::default()
                },
            },
        );
        run(&mut engine, &mut text, &mut history, update);

        // The removal is stamp-dominated: annotation stays live, text intact.
        let stale_accept = stamped(3, Op::AcceptSuggestion { dependent_on: id });
        let events = run(&mut engine, &mut text, &mut history, stale_accept);
        assert!(events.is_empty());
        assert_eq!(text.contents(), "abcdef");
        assert!(engine.live_annotation(&id).is_some());
    }

    #[test]
    fn removal_then_dominating_update_resurrects() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let mut engine = Engine::new();
        let mut history = Vec::new();

        let add = stamped(
            1,
            Op::AddComment {
                range: closed_range(&text, 0, 1),
                text: "hm".into(),
            },
        );
        let id = add.record.change_id();
        run(&mut engine, &mut text, &mut history, add);

        let remove = stamped(2, Op::RemoveComment { dependent_on: id });
        let events = run(&mut engine, &mut text, &mut history, remove);
        assert!(matches!(
            events.as_slice(),
            [DocEvent::AnnotationRemoved {
                reason: RemoveReason::Removed,
                ..
            }]
        ));

        let resurrect = stamped(
            3,
            Op::Update {
                dependent_on: id,
                patch: RangePatch {
                    text: Some("hm!".into()),
                    ..Default::default()
                },
            },
        );
        let events = run(&mut engine, &mut text, &mut history, resurrect);
        assert!(matches!(events.as_slice(), [DocEvent::AnnotationAdded { .. }]));
        let live = engine.live_annotation(&id).unwrap();
        assert_eq!(live.text.as_deref(), Some("hm!"));
    }

    #[test]
    fn endpoint_visibility_honors_closed_flags() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let mut engine = Engine::new();
        let mut history = Vec::new();

        // open anchors on 'b' and 'e': covers exactly "cd"
        let range = AnchorRange::open(
            Some(text.position_of(1).unwrap()),
            Some(text.position_of(4).unwrap()),
        );
        let add = stamped(1, Op::InsertSuggestion { range });
        let id = add.record.change_id();
        run(&mut engine, &mut text, &mut history, add);

        let at = |i: usize| {
            let p = text.position_of(i).unwrap();
            engine
                .annotations_at(&p)
                .iter()
                .map(|a| a.id)
                .collect::<Vec<_>>()
        };
        assert!(at(1).is_empty(), "open start anchor is excluded");
        assert_eq!(at(2), vec![id]);
        assert_eq!(at(3), vec![id]);
        assert!(at(4).is_empty(), "open end anchor is excluded");
    }
}
