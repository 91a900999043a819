//! Layer 5: The annotation log.
//!
//! Append-only replicated log of operation records, grouped per
//! annotation id ("change id") and ordered by stamp within each group.
//! Ingest enforces the delivery invariants: duplicates and records whose
//! Addition is unknown are dropped, everything else is merged in stamp
//! order. The log never interprets records; that is the engine's job.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::identity::AnnotationId;
use super::record::Stamped;
use super::text::Position;
use super::time::{Lamport, Stamp};

/// Why an incoming record was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Same stamp already held for this id.
    Duplicate,
    /// A second Addition claimed an existing annotation id.
    DuplicateAddition,
    /// Removal/Update for an id with no Addition after causal delivery.
    MissingDependency,
}

/// Outcome of [`AnnotationLog::ingest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    Dropped(DropReason),
}

impl IngestOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, IngestOutcome::Applied)
    }
}

/// Per-id stamped record histories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationLog<P> {
    groups: BTreeMap<AnnotationId, Vec<Stamped<P>>>,
}

impl<P: Position> AnnotationLog<P> {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }

    /// Merge one causally delivered record.
    pub fn ingest(&mut self, stamped: Stamped<P>) -> IngestOutcome {
        let change_id = stamped.record.change_id();

        if stamped.record.op.is_addition() {
            let group = self.groups.entry(change_id).or_default();
            if group.iter().any(|held| held.record.op.is_addition()) {
                // Only possible when a record id collides (I2).
                warn!(%change_id, "dropping second addition for annotation");
                return IngestOutcome::Dropped(DropReason::DuplicateAddition);
            }
            return Self::merge_into(group, stamped);
        }

        match self.groups.get_mut(&change_id) {
            Some(group) if group.iter().any(|held| held.record.op.is_addition()) => {
                Self::merge_into(group, stamped)
            }
            _ => {
                // Causal delivery should have brought the Addition first;
                // a later replica that can resolve it converges regardless.
                warn!(
                    %change_id,
                    kind = stamped.record.op.kind_str(),
                    "dropping record with unknown dependency"
                );
                IngestOutcome::Dropped(DropReason::MissingDependency)
            }
        }
    }

    fn merge_into(group: &mut Vec<Stamped<P>>, stamped: Stamped<P>) -> IngestOutcome {
        match group.binary_search_by(|held| held.stamp.cmp(&stamped.stamp)) {
            Ok(_) => {
                debug!(stamp = ?stamped.stamp, "dropping duplicate record");
                IngestOutcome::Dropped(DropReason::Duplicate)
            }
            Err(at) => {
                group.insert(at, stamped);
                IngestOutcome::Applied
            }
        }
    }

    /// Stamp-ordered history for one annotation id.
    pub fn history(&self, id: &AnnotationId) -> Option<&[Stamped<P>]> {
        self.groups.get(id).map(Vec::as_slice)
    }

    /// Annotation ids in stable order.
    pub fn change_ids(&self) -> impl Iterator<Item = &AnnotationId> {
        self.groups.keys()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&AnnotationId, &[Stamped<P>])> {
        self.groups.iter().map(|(id, recs)| (id, recs.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Highest lamport held anywhere; clock floor after a snapshot load.
    pub fn max_lamport(&self) -> Lamport {
        self.groups
            .values()
            .filter_map(|group| group.last())
            .map(|held| held.stamp.lamport)
            .max()
            .unwrap_or(0)
    }

    fn max_stamp(&self, id: &AnnotationId) -> Option<&Stamp> {
        self.groups
            .get(id)
            .and_then(|group| group.last())
            .map(|held| &held.stamp)
    }

    /// Merge a snapshot's groups. Only records with a stamp above the
    /// highest already held for their id are applied (idempotent load).
    /// Returns the newly applied records in global stamp order.
    pub fn merge_snapshot(
        &mut self,
        groups: Vec<(AnnotationId, Vec<Stamped<P>>)>,
    ) -> Vec<Stamped<P>> {
        let mut fresh = Vec::new();
        for (id, records) in groups {
            let floor = self.max_stamp(&id).cloned();
            for stamped in records {
                if floor.as_ref().is_some_and(|held| stamped.stamp <= *held) {
                    continue;
                }
                if self.ingest(stamped.clone()).is_applied() {
                    fresh.push(stamped);
                }
            }
        }
        fresh.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        fresh
    }
}
