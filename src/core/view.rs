//! Layer 7: The derived position-indexed view.
//!
//! Data points exist exactly at positions where the set of applicable
//! annotations changes (an endpoint of some annotation); between data
//! points the set is constant. Each entry carries `starting_here` /
//! `ending_here` so endpoint visibility can honor the closed/open flags.
//! Open-start annotations are keyed on the virtual document start; open
//! ends place no data point at all.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::annotation::{Annotation, AnnotationKind};
use super::identity::AnnotationId;
use super::text::Position;

/// One annotation's presence at one data point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewEntry {
    pub id: AnnotationId,
    pub starting_here: bool,
    pub ending_here: bool,
}

/// Annotation entries at one position, bucketed by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPoint {
    buckets: BTreeMap<AnnotationKind, Vec<ViewEntry>>,
}

impl DataPoint {
    /// Entries that continue past this point: everything not ending here,
    /// demoted to plain crossings.
    fn crossings(&self) -> DataPoint {
        let mut out = DataPoint::default();
        for (kind, entries) in &self.buckets {
            let crossing: Vec<ViewEntry> = entries
                .iter()
                .filter(|e| !e.ending_here)
                .map(|e| ViewEntry {
                    id: e.id,
                    starting_here: false,
                    ending_here: false,
                })
                .collect();
            if !crossing.is_empty() {
                out.buckets.insert(*kind, crossing);
            }
        }
        out
    }

    fn insert(&mut self, kind: AnnotationKind, entry: ViewEntry) {
        let bucket = self.buckets.entry(kind).or_default();
        match bucket.iter_mut().find(|e| e.id == entry.id) {
            Some(held) => *held = entry,
            None => bucket.push(entry),
        }
    }

    fn remove(&mut self, id: &AnnotationId) {
        self.buckets.retain(|_, entries| {
            entries.retain(|e| e.id != *id);
            !entries.is_empty()
        });
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (AnnotationKind, &ViewEntry)> {
        self.buckets
            .iter()
            .flat_map(|(kind, entries)| entries.iter().map(move |e| (*kind, e)))
    }
}

/// The position-indexed map of data points.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeIndex<P> {
    points: BTreeMap<P, DataPoint>,
}

impl<P: Position> RangeIndex<P> {
    pub fn new() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }

    /// The data point governing `pos`: the nearest one at or left of it.
    /// Returns the point's key alongside so callers can tell whether
    /// `pos` sits exactly on it.
    pub fn governing(&self, pos: &P) -> Option<(&P, &DataPoint)> {
        self.points
            .range((Bound::Unbounded, Bound::Included(pos.clone())))
            .next_back()
    }

    /// Create a data point at `at` if none exists, inheriting the
    /// still-crossing entries of the nearest point to the left. Entries
    /// marking an end do not propagate.
    fn ensure_point(&mut self, at: &P) {
        if self.points.contains_key(at) {
            return;
        }
        let inherited = self
            .points
            .range((Bound::Unbounded, Bound::Excluded(at.clone())))
            .next_back()
            .map(|(_, point)| point.crossings())
            .unwrap_or_default();
        self.points.insert(at.clone(), inherited);
    }

    fn range_keys(annotation: &Annotation<P>) -> (P, Option<P>) {
        let start = annotation
            .range
            .start
            .clone()
            .unwrap_or_else(P::document_start);
        (start, annotation.range.end.clone())
    }

    /// Anchor a live annotation into the view. Inverted ranges (end
    /// ordered before start after a hostile update) get no entries; the
    /// registry still tracks them.
    pub fn add(&mut self, annotation: &Annotation<P>) {
        let (start_key, end_key) = Self::range_keys(annotation);
        if end_key.as_ref().is_some_and(|end| *end < start_key) {
            return;
        }
        self.ensure_point(&start_key);
        if let Some(end) = &end_key {
            self.ensure_point(end);
        }

        let upper = match &end_key {
            Some(end) => Bound::Included(end.clone()),
            None => Bound::Unbounded,
        };
        for (key, point) in self
            .points
            .range_mut((Bound::Included(start_key), upper))
        {
            let entry = ViewEntry {
                id: annotation.id,
                starting_here: annotation.range.start.as_ref() == Some(key),
                ending_here: annotation.range.end.as_ref() == Some(key),
            };
            point.insert(annotation.kind, entry);
        }
    }

    /// Drop an annotation's entries from every data point in its range.
    /// Points left with no entries are pruned.
    pub fn remove(&mut self, annotation: &Annotation<P>) {
        let (start_key, end_key) = Self::range_keys(annotation);
        if end_key.as_ref().is_some_and(|end| *end < start_key) {
            return;
        }
        let upper = match &end_key {
            Some(end) => Bound::Included(end.clone()),
            None => Bound::Unbounded,
        };
        let mut emptied = Vec::new();
        for (key, point) in self
            .points
            .range_mut((Bound::Included(start_key), upper))
        {
            point.remove(&annotation.id);
            if point.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.points.remove(&key);
        }
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> impl Iterator<Item = (&P, &DataPoint)> {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::UserId;
    use crate::core::record::AnchorRange;
    use crate::core::time::WallClock;
    use crate::test_harness::PathPos;

    fn pos(digit: u64) -> PathPos {
        PathPos::from_digits(&[digit])
    }

    fn annotation(
        kind: AnnotationKind,
        start: Option<u64>,
        end: Option<u64>,
        closed: bool,
    ) -> Annotation<PathPos> {
        Annotation {
            id: AnnotationId::random(),
            author: UserId::new("u1").unwrap(),
            kind,
            range: AnchorRange {
                start: start.map(pos),
                end: end.map(pos),
                start_closed: closed && start.is_some(),
                end_closed: closed && end.is_some(),
            },
            text: None,
            created: WallClock(0),
        }
    }

    fn ids_at(view: &RangeIndex<PathPos>, at: u64) -> Vec<AnnotationId> {
        view.governing(&pos(at))
            .map(|(_, point)| point.entries().map(|(_, e)| e.id).collect())
            .unwrap_or_default()
    }

    #[test]
    fn points_exist_only_at_endpoints() {
        let mut view = RangeIndex::new();
        let a = annotation(AnnotationKind::Comment, Some(2), Some(6), true);
        view.add(&a);
        assert_eq!(view.point_count(), 2);
        assert_eq!(ids_at(&view, 4), vec![a.id]);
        assert!(ids_at(&view, 1).is_empty());
    }

    #[test]
    fn new_points_inherit_crossing_entries_only() {
        let mut view = RangeIndex::new();
        let wide = annotation(AnnotationKind::Comment, Some(2), Some(8), true);
        let narrow = annotation(AnnotationKind::DeleteSuggestion, Some(4), Some(6), true);
        view.add(&wide);
        view.add(&narrow);

        // the point at 4 inherited `wide` as a crossing
        let (_, point) = view.governing(&pos(4)).unwrap();
        let wide_entry = point
            .entries()
            .find(|(_, e)| e.id == wide.id)
            .map(|(_, e)| *e)
            .unwrap();
        assert!(!wide_entry.starting_here);
        assert!(!wide_entry.ending_here);

        // a later point right of `wide`'s end does not inherit it
        let after = annotation(AnnotationKind::Comment, Some(9), Some(9), true);
        view.add(&after);
        let at_nine = ids_at(&view, 9);
        assert!(at_nine.contains(&after.id));
        assert!(!at_nine.contains(&wide.id));
    }

    #[test]
    fn open_ended_annotations_reach_every_later_point() {
        let mut view = RangeIndex::new();
        let open = annotation(AnnotationKind::InsertSuggestion, None, None, false);
        view.add(&open);
        assert_eq!(view.point_count(), 1);

        let later = annotation(AnnotationKind::Comment, Some(7), Some(7), true);
        view.add(&later);
        assert!(ids_at(&view, 7).contains(&open.id));
        // keyed at the virtual start, so any real position is governed
        assert!(ids_at(&view, 1).contains(&open.id));
    }

    #[test]
    fn remove_prunes_emptied_points() {
        let mut view = RangeIndex::new();
        let a = annotation(AnnotationKind::Comment, Some(2), Some(6), true);
        let b = annotation(AnnotationKind::Comment, Some(2), Some(4), true);
        view.add(&a);
        view.add(&b);
        assert_eq!(view.point_count(), 3);

        view.remove(&b);
        assert_eq!(view.point_count(), 2);
        view.remove(&a);
        assert_eq!(view.point_count(), 0);
    }
}
