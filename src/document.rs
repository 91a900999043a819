//! The public document API.
//!
//! A [`Document`] owns the text buffer, the annotation log, and the
//! engine, and runs them on one thread: every public operation and every
//! delivered record is processed to completion synchronously. Local
//! appends are stamped with the replica's Lamport clock and flow through
//! the same ingest path as remote bytes, so derived side-effects (text
//! deletion on accept/decline) run exactly once per replica.

use bytes::Bytes;

use crate::config::Config;
use crate::core::engine::{resolve_range, Engine};
use crate::core::{
    decode_record, decode_snapshot, encode_record, encode_snapshot, AnchorRange, Annotation,
    AnnotationId, AnnotationKind, AnnotationLog, DocEvent, InvalidRange, KindMismatch,
    LamportClock, Op, Patch, RangePatch, Record, RecordId, SenderId, Stamp, Stamped, TextBuffer,
    UnknownAnnotation, UserId, WallClock,
};
use crate::Result;

type Subscriber<P> = Box<dyn FnMut(&DocEvent<P>)>;

pub struct Document<T: TextBuffer> {
    config: Config,
    sender: SenderId,
    clock: LamportClock,
    text: T,
    log: AnnotationLog<T::Pos>,
    engine: Engine<T::Pos>,
    outbox: Vec<Bytes>,
    subscribers: Vec<Subscriber<T::Pos>>,
}

/// What a suggestion-mode edit decided to append.
enum SuggestionAction<P> {
    Covered,
    Extend(AnnotationId, RangePatch<P>),
    Add(AnchorRange<P>),
}

impl<T: TextBuffer> Document<T> {
    pub fn new(config: Config, text: T) -> Self {
        Self::with_sender(config, text, SenderId::random())
    }

    /// Deterministic replica identity; tests use this to pin tie-breaks.
    pub fn with_sender(config: Config, text: T, sender: SenderId) -> Self {
        Self {
            config,
            sender,
            clock: LamportClock::new(),
            text,
            log: AnnotationLog::new(),
            engine: Engine::new(),
            outbox: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.config.user_id
    }

    pub fn sender_id(&self) -> SenderId {
        self.sender
    }

    /// The attached text CRDT. Embedders replicate its operations through
    /// their own transport; the document only mutates it.
    pub fn buffer(&self) -> &T {
        &self.text
    }

    pub fn buffer_mut(&mut self) -> &mut T {
        &mut self.text
    }

    pub fn contents(&self) -> String {
        self.text.contents()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Observe every emitted event, local and remote alike.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&DocEvent<T::Pos>) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    // ----- queries ---------------------------------------------------

    /// Live annotations applicable at the visible index, honoring
    /// endpoint closedness.
    pub fn annotations_at(&self, index: usize) -> Vec<Annotation<T::Pos>> {
        let Some(pos) = self.text.position_of(index) else {
            return Vec::new();
        };
        self.engine
            .annotations_at(&pos)
            .into_iter()
            .cloned()
            .collect()
    }

    /// All live annotations, one entry per id, in id order.
    pub fn active_annotations(&self) -> Vec<Annotation<T::Pos>> {
        self.engine.active_annotations().cloned().collect()
    }

    pub fn annotation(&self, id: &AnnotationId) -> Option<Annotation<T::Pos>> {
        self.engine.live_annotation(id).cloned()
    }

    /// Visible `[start, end)` window an annotation currently spans.
    pub fn resolve(&self, annotation: &Annotation<T::Pos>) -> (usize, usize) {
        resolve_range(&self.text, &annotation.range)
    }

    // ----- public operations -----------------------------------------

    /// Insert text at `index`. The characters are real either way; with
    /// `as_suggestion` they are additionally covered by an
    /// insert-suggestion from this user, growing an adjacent existing one
    /// instead of stacking a new annotation.
    pub fn insert(&mut self, index: usize, content: &str, as_suggestion: bool) -> Result<()> {
        if index > self.text.len() {
            return Err(invalid_range(index, index, self.text.len()));
        }
        if content.is_empty() {
            return Ok(());
        }

        let positions = self.text.insert(index, content);
        let inserted = positions.len();
        self.emit(vec![DocEvent::Insert {
            index,
            text: content.to_string(),
            positions: positions.clone(),
        }]);

        if !as_suggestion {
            return Ok(());
        }

        let action = self.plan_insert_suggestion(index, inserted, &positions);
        match action {
            SuggestionAction::Covered => Ok(()),
            SuggestionAction::Extend(id, patch) => self.append_local(Op::Update {
                dependent_on: id,
                patch,
            }),
            SuggestionAction::Add(range) => self.append_local(Op::InsertSuggestion { range }),
        }
    }

    fn plan_insert_suggestion(
        &self,
        index: usize,
        inserted: usize,
        positions: &[T::Pos],
    ) -> SuggestionAction<T::Pos> {
        let user = &self.config.user_id;

        // Typing strictly inside one's own live insert-suggestion needs
        // no record: the new characters already fall inside its window.
        if let Some(first) = positions.first() {
            let covered = self.engine.annotations_at(first).iter().any(|a| {
                a.kind == AnnotationKind::InsertSuggestion && a.author == *user
            });
            if covered {
                return SuggestionAction::Covered;
            }
        }

        // Adjacent to one's own suggestion: grow it by rewriting the
        // endpoint onto the new run instead of stacking a second
        // annotation.
        for annotation in self.engine.active_annotations() {
            if annotation.kind != AnnotationKind::InsertSuggestion || annotation.author != *user {
                continue;
            }
            let (start, end) = resolve_range(&self.text, &annotation.range);
            if end == index {
                if let Some(last) = positions.last() {
                    let patch = RangePatch {
                        end: Patch::Set(last.clone()),
                        end_closed: Some(true),
                        ..Default::default()
                    };
                    return SuggestionAction::Extend(annotation.id, patch);
                }
            }
            if start == index + inserted {
                if let Some(first) = positions.first() {
                    let patch = RangePatch {
                        start: Patch::Set(first.clone()),
                        start_closed: Some(true),
                        ..Default::default()
                    };
                    return SuggestionAction::Extend(annotation.id, patch);
                }
            }
        }

        // Fresh suggestion: closed anchors on the inserted run itself.
        // Anchoring on the neighbors would make concurrent suggestions
        // in the same gap cover each other's characters; anchored on
        // their own runs they stay disjoint.
        match (positions.first(), positions.last()) {
            (Some(first), Some(last)) => {
                SuggestionAction::Add(AnchorRange::closed(first.clone(), last.clone()))
            }
            _ => SuggestionAction::Covered,
        }
    }

    /// Delete `count` characters at `index`, either directly or as a
    /// delete-suggestion that keeps the text visible until review.
    pub fn delete(&mut self, index: usize, count: usize, as_suggestion: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if index + count > self.text.len() {
            return Err(invalid_range(index, index + count, self.text.len()));
        }

        if !as_suggestion {
            self.delete_now(index, count);
            return Ok(());
        }

        let action = self.plan_delete_suggestion(index, count);
        match action {
            None => {
                // Our own unreviewed insertion: deleting it collapses both.
                self.delete_now(index, count);
                Ok(())
            }
            Some(SuggestionAction::Covered) => Ok(()),
            Some(SuggestionAction::Extend(id, patch)) => self.append_local(Op::Update {
                dependent_on: id,
                patch,
            }),
            Some(SuggestionAction::Add(range)) => {
                self.append_local(Op::DeleteSuggestion { range })
            }
        }
    }

    fn plan_delete_suggestion(
        &self,
        index: usize,
        count: usize,
    ) -> Option<SuggestionAction<T::Pos>> {
        let user = &self.config.user_id;

        for annotation in self.engine.active_annotations() {
            if annotation.kind != AnnotationKind::InsertSuggestion || annotation.author != *user {
                continue;
            }
            let (start, end) = resolve_range(&self.text, &annotation.range);
            if start <= index && index + count <= end {
                return None;
            }
        }

        for annotation in self.engine.active_annotations() {
            if annotation.kind != AnnotationKind::DeleteSuggestion || annotation.author != *user {
                continue;
            }
            let (start, end) = resolve_range(&self.text, &annotation.range);
            if end == index {
                // grow rightward over the newly covered characters
                if let Some(p) = self.text.position_of(index + count - 1) {
                    let patch = RangePatch {
                        end: Patch::Set(p),
                        end_closed: Some(true),
                        ..Default::default()
                    };
                    return Some(SuggestionAction::Extend(annotation.id, patch));
                }
            }
            if start == index + count {
                if let Some(p) = self.text.position_of(index) {
                    let patch = RangePatch {
                        start: Patch::Set(p),
                        start_closed: Some(true),
                        ..Default::default()
                    };
                    return Some(SuggestionAction::Extend(annotation.id, patch));
                }
            }
        }

        let (Some(start), Some(end)) = (
            self.text.position_of(index),
            self.text.position_of(index + count - 1),
        ) else {
            return Some(SuggestionAction::Covered);
        };
        Some(SuggestionAction::Add(AnchorRange::closed(start, end)))
    }

    fn delete_now(&mut self, index: usize, count: usize) {
        let removed = self.text.delete(index, count);
        let mut chars = String::with_capacity(removed.len());
        let mut positions = Vec::with_capacity(removed.len());
        for (pos, ch) in removed {
            positions.push(pos);
            chars.push(ch);
        }
        self.emit(vec![DocEvent::Delete {
            index,
            text: chars,
            positions,
        }]);
    }

    /// Accept a suggestion. The derived text rewrite (for
    /// delete-suggestions) happens in the processing path, so it has run
    /// locally by the time this returns but runs independently on every
    /// other replica.
    pub fn accept_suggestion(&mut self, id: AnnotationId) -> Result<()> {
        self.require_kind(&id, true)?;
        self.append_local(Op::AcceptSuggestion { dependent_on: id })
    }

    /// Decline a suggestion; declining an insert-suggestion removes its
    /// characters.
    pub fn decline_suggestion(&mut self, id: AnnotationId) -> Result<()> {
        self.require_kind(&id, true)?;
        self.append_local(Op::DeclineSuggestion { dependent_on: id })
    }

    /// Attach a comment to the visible window `[start_index, end_index)`.
    pub fn add_comment(
        &mut self,
        start_index: usize,
        end_index: usize,
        text: &str,
    ) -> Result<AnnotationId> {
        let len = self.text.len();
        if start_index >= len || end_index < start_index || end_index > len {
            return Err(invalid_range(start_index, end_index, len));
        }
        let anchor_end = if end_index > start_index {
            end_index - 1
        } else {
            start_index
        };
        let (Some(start), Some(end)) = (
            self.text.position_of(start_index),
            self.text.position_of(anchor_end),
        ) else {
            return Err(invalid_range(start_index, end_index, len));
        };

        let record = self.make_record(Op::AddComment {
            range: AnchorRange::closed(start, end),
            text: text.to_string(),
        });
        let id = AnnotationId::from(record.id);
        self.commit_local(record)?;
        Ok(id)
    }

    pub fn remove_comment(&mut self, id: AnnotationId) -> Result<()> {
        self.require_kind(&id, false)?;
        self.append_local(Op::RemoveComment { dependent_on: id })
    }

    fn require_kind(&self, id: &AnnotationId, suggestion: bool) -> Result<()> {
        let Some(annotation) = self.engine.live_annotation(id) else {
            return Err(crate::core::CoreError::from(UnknownAnnotation { id: *id }).into());
        };
        if annotation.kind.is_suggestion() != suggestion {
            let expected = if suggestion { "suggestion" } else { "comment" };
            return Err(crate::core::CoreError::from(KindMismatch { id: *id, expected }).into());
        }
        Ok(())
    }

    // ----- replication -----------------------------------------------

    /// Encoded records appended here since the last call, in append
    /// order. The transport ships them to every peer.
    pub fn take_outbox(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    /// Ingest one causally delivered record from a peer.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<()> {
        let stamped: Stamped<T::Pos> = decode_record(bytes)?;
        self.clock.observe(stamped.stamp.lamport);
        self.deliver(stamped);
        Ok(())
    }

    /// Serialize the annotation log for a snapshot-driven join.
    pub fn snapshot(&self) -> Result<Bytes> {
        Ok(encode_snapshot(&self.log)?)
    }

    /// Merge a snapshot. Records already held are ignored; loading the
    /// same snapshot twice leaves the state unchanged.
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let groups = decode_snapshot(bytes)?;
        let fresh = self.log.merge_snapshot(groups);
        self.clock.observe(self.log.max_lamport());

        let mut seen = Vec::new();
        for stamped in &fresh {
            let id = stamped.record.change_id();
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        for id in seen {
            let events = match self.log.history(&id) {
                Some(history) => self.engine.reconcile(id, history, &mut self.text),
                None => continue,
            };
            self.emit(events);
        }
        Ok(())
    }

    // ----- internals -------------------------------------------------

    fn make_record(&self, op: Op<T::Pos>) -> Record<T::Pos> {
        Record {
            id: RecordId::random(),
            user: self.config.user_id.clone(),
            at: WallClock::now(),
            op,
        }
    }

    fn append_local(&mut self, op: Op<T::Pos>) -> Result<()> {
        let record = self.make_record(op);
        self.commit_local(record)
    }

    fn commit_local(&mut self, record: Record<T::Pos>) -> Result<()> {
        let stamp = Stamp::new(self.clock.tick(), self.sender);
        let stamped = Stamped { stamp, record };
        let bytes = encode_record(&stamped)?;
        self.outbox.push(bytes);
        self.deliver(stamped);
        Ok(())
    }

    fn deliver(&mut self, stamped: Stamped<T::Pos>) {
        let change_id = stamped.record.change_id();
        if !self.log.ingest(stamped).is_applied() {
            return;
        }
        let events = match self.log.history(&change_id) {
            Some(history) => self.engine.reconcile(change_id, history, &mut self.text),
            None => return,
        };
        self.emit(events);
    }

    fn emit(&mut self, events: Vec<DocEvent<T::Pos>>) {
        for event in &events {
            for subscriber in self.subscribers.iter_mut() {
                subscriber(event);
            }
        }
    }
}

fn invalid_range(start: usize, end: usize, len: usize) -> crate::Error {
    crate::core::CoreError::from(InvalidRange { start, end, len }).into()
}
