//! In-memory reference implementations of the external collaborators:
//! a dense-identifier text buffer ([`DenseText`]) and a causally ordered
//! message router ([`Net`]) wiring several replicas together. The
//! integration tests drive multi-replica scenarios through these; they
//! are intentionally simple (linear scans, no balancing) and sized for
//! tests, not production documents.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::config::Config;
use crate::core::{Bias, Position, PositionBytesError, SenderId, TextBuffer, UserId};
use crate::document::Document;

/// One level of a dense path identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Step {
    pub digit: u64,
    pub site: u64,
}

/// Dense, totally ordered position identifier: a path of (digit, site)
/// steps, compared lexicographically. The empty path is the virtual
/// document start; it is never allocated to a character.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathPos(Vec<Step>);

impl PathPos {
    pub fn from_digits(digits: &[u64]) -> Self {
        Self(digits.iter().map(|&digit| Step { digit, site: 0 }).collect())
    }

    /// Allocate a fresh position strictly between `left` and `right`.
    fn between(
        left: Option<&PathPos>,
        right: Option<&PathPos>,
        site: u64,
        rng: &mut StdRng,
    ) -> PathPos {
        const FLOOR: Step = Step { digit: 0, site: 0 };
        let mut path = Vec::new();
        let mut depth = 0;
        loop {
            let low = left
                .and_then(|p| p.0.get(depth))
                .copied()
                .unwrap_or(FLOOR);
            let high_digit = right
                .and_then(|p| p.0.get(depth))
                .map(|step| step.digit)
                .unwrap_or(u64::MAX);
            if high_digit > low.digit.saturating_add(1) {
                let ceiling = high_digit.min(low.digit.saturating_add(65));
                let digit = rng.gen_range(low.digit + 1..ceiling);
                path.push(Step { digit, site });
                return PathPos(path);
            }
            // No room at this level: follow the left bound down. The
            // pushed step stays strictly below the right bound.
            path.push(low);
            depth += 1;
        }
    }

    /// A child position ordered directly after `self`, before any
    /// pre-existing position greater than `self`. A multi-character run
    /// chains each character under the previous one, so the whole run
    /// shares its head as a path prefix and a concurrent run (which
    /// diverges from that head) can never interleave with it.
    fn child(&self, site: u64, rng: &mut StdRng) -> PathPos {
        let mut path = self.0.clone();
        path.push(Step {
            digit: rng.gen_range(1..65),
            site,
        });
        PathPos(path)
    }
}

impl Position for PathPos {
    fn document_start() -> Self {
        PathPos(Vec::new())
    }

    fn write_bytes(&self, buf: &mut Vec<u8>) {
        for step in &self.0 {
            buf.extend_from_slice(&step.digit.to_be_bytes());
            buf.extend_from_slice(&step.site.to_be_bytes());
        }
    }

    fn read_bytes(bytes: &[u8]) -> Result<Self, PositionBytesError> {
        if bytes.len() % 16 != 0 {
            return Err(PositionBytesError::new(format!(
                "length {} is not a multiple of 16",
                bytes.len()
            )));
        }
        let steps = bytes
            .chunks_exact(16)
            .map(|chunk| {
                let digit = u64::from_be_bytes(chunk[..8].try_into().expect("chunk is 16 bytes"));
                let site = u64::from_be_bytes(chunk[8..].try_into().expect("chunk is 16 bytes"));
                Step { digit, site }
            })
            .collect();
        Ok(PathPos(steps))
    }
}

/// Replicated text-buffer operation, shipped between replicas by the
/// embedding transport (here: [`Net`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextDelta {
    Insert { items: Vec<(PathPos, char)> },
    Delete { items: Vec<(PathPos, char)> },
}

#[derive(Clone, Debug)]
struct Slot {
    pos: PathPos,
    ch: char,
    live: bool,
}

/// Tombstone-keeping sequence CRDT over dense path identifiers. Deleted
/// positions stay resolvable forever.
#[derive(Clone, Debug)]
pub struct DenseText {
    slots: Vec<Slot>,
    site: u64,
    rng: StdRng,
    deltas: Vec<TextDelta>,
}

impl DenseText {
    pub fn new(site: u64) -> Self {
        Self {
            slots: Vec::new(),
            site,
            rng: StdRng::seed_from_u64(site),
            deltas: Vec::new(),
        }
    }

    /// Outbound operations since the last call, in order.
    pub fn take_deltas(&mut self) -> Vec<TextDelta> {
        std::mem::take(&mut self.deltas)
    }

    /// Merge one replicated operation. Idempotent: re-delivered inserts
    /// of a known position are ignored, deletes of an unknown position
    /// materialize the tombstone.
    pub fn apply_delta(&mut self, delta: &TextDelta) {
        match delta {
            TextDelta::Insert { items } => {
                for (pos, ch) in items {
                    if let Err(at) = self.slot_index(pos) {
                        self.slots.insert(
                            at,
                            Slot {
                                pos: pos.clone(),
                                ch: *ch,
                                live: true,
                            },
                        );
                    }
                }
            }
            TextDelta::Delete { items } => {
                for (pos, ch) in items {
                    match self.slot_index(pos) {
                        Ok(at) => self.slots[at].live = false,
                        Err(at) => self.slots.insert(
                            at,
                            Slot {
                                pos: pos.clone(),
                                ch: *ch,
                                live: false,
                            },
                        ),
                    }
                }
            }
        }
    }

    fn slot_index(&self, pos: &PathPos) -> Result<usize, usize> {
        self.slots.binary_search_by(|slot| slot.pos.cmp(pos))
    }

    /// Slot index of the `index`-th visible character; `slots.len()` when
    /// `index == len`.
    fn slot_of_visible(&self, index: usize) -> usize {
        let mut remaining = index;
        for (at, slot) in self.slots.iter().enumerate() {
            if slot.live {
                if remaining == 0 {
                    return at;
                }
                remaining -= 1;
            }
        }
        self.slots.len()
    }

    fn visible_rank(&self, slot_index: usize) -> usize {
        self.slots[..slot_index].iter().filter(|s| s.live).count()
    }
}

impl TextBuffer for DenseText {
    type Pos = PathPos;

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    fn char_at(&self, index: usize) -> Option<char> {
        self.slots
            .iter()
            .filter(|s| s.live)
            .nth(index)
            .map(|s| s.ch)
    }

    fn position_of(&self, index: usize) -> Option<PathPos> {
        self.slots
            .iter()
            .filter(|s| s.live)
            .nth(index)
            .map(|s| s.pos.clone())
    }

    fn index_of(&self, pos: &PathPos, bias: Bias) -> Option<usize> {
        match self.slot_index(pos) {
            Ok(at) if self.slots[at].live => Some(self.visible_rank(at)),
            Ok(at) => match bias {
                Bias::Exact => None,
                Bias::Left => self.slots[..at]
                    .iter()
                    .rposition(|s| s.live)
                    .map(|left| self.visible_rank(left)),
                Bias::Right => self.slots[at + 1..]
                    .iter()
                    .position(|s| s.live)
                    .map(|_| self.visible_rank(at)),
            },
            Err(at) => match bias {
                Bias::Exact => None,
                Bias::Left => self.slots[..at]
                    .iter()
                    .rposition(|s| s.live)
                    .map(|left| self.visible_rank(left)),
                Bias::Right => self.slots[at..]
                    .iter()
                    .position(|s| s.live)
                    .map(|offset| self.visible_rank(at + offset)),
            },
        }
    }

    fn has(&self, pos: &PathPos) -> bool {
        matches!(self.slot_index(pos), Ok(at) if self.slots[at].live)
    }

    fn insert(&mut self, index: usize, text: &str) -> Vec<PathPos> {
        // New characters land immediately after the left visible
        // neighbor, before any tombstones between it and the next
        // visible character.
        let mut at = if index == 0 {
            0
        } else {
            self.slot_of_visible(index - 1) + 1
        };
        let mut left = if at == 0 {
            None
        } else {
            Some(self.slots[at - 1].pos.clone())
        };

        let mut positions = Vec::new();
        let mut items = Vec::new();
        for (nth, ch) in text.chars().enumerate() {
            // The head of the run is placed in the gap; the rest chain
            // under it so the run is a single block in position order.
            let pos = match (&left, nth) {
                (Some(prev), n) if n > 0 => prev.child(self.site, &mut self.rng),
                _ => {
                    let right = self.slots.get(at).map(|s| s.pos.clone());
                    PathPos::between(left.as_ref(), right.as_ref(), self.site, &mut self.rng)
                }
            };
            self.slots.insert(
                at,
                Slot {
                    pos: pos.clone(),
                    ch,
                    live: true,
                },
            );
            items.push((pos.clone(), ch));
            positions.push(pos.clone());
            left = Some(pos);
            at += 1;
        }
        self.deltas.push(TextDelta::Insert { items });
        positions
    }

    fn delete(&mut self, index: usize, count: usize) -> Vec<(PathPos, char)> {
        let mut removed = Vec::with_capacity(count);
        let mut at = self.slot_of_visible(index);
        let mut left = count;
        while left > 0 && at < self.slots.len() {
            if self.slots[at].live {
                self.slots[at].live = false;
                removed.push((self.slots[at].pos.clone(), self.slots[at].ch));
                left -= 1;
            }
            at += 1;
        }
        self.deltas.push(TextDelta::Delete {
            items: removed.clone(),
        });
        removed
    }

    fn contents(&self) -> String {
        self.slots.iter().filter(|s| s.live).map(|s| s.ch).collect()
    }
}

/// A payload shipped between replicas.
#[derive(Clone, Debug)]
pub enum Payload {
    Text(TextDelta),
    Record(Bytes),
}

#[derive(Clone, Debug)]
struct Msg {
    from: usize,
    seq: u64,
    /// Per-sender delivery counts the sender had seen when sending; a
    /// receiver must catch up to these first (causal gate).
    deps: BTreeMap<usize, u64>,
    payload: Payload,
    delivered_to: BTreeSet<usize>,
}

/// One replica: a document over [`DenseText`] plus its delivery state.
pub struct Replica {
    pub doc: Document<DenseText>,
    sent: u64,
    seen: BTreeMap<usize, u64>,
}

/// Causally ordered broadcast between replicas: per-sender FIFO plus a
/// vector-clock gate, carrying both text deltas and annotation records
/// in one stream per sender.
pub struct Net {
    replicas: Vec<Replica>,
    pending: Vec<Msg>,
}

impl Net {
    /// One replica per user name; replica `i` gets site `i + 1` and the
    /// sender id `Uuid::from_u128(i + 1)`, so stamp tie-breaks favor the
    /// highest replica index.
    pub fn new(users: &[&str]) -> Self {
        let replicas = users
            .iter()
            .enumerate()
            .map(|(i, user)| {
                let config = Config::new(UserId::new(*user).expect("test user name"));
                let text = DenseText::new(i as u64 + 1);
                let sender = SenderId::from_uuid(Uuid::from_u128(i as u128 + 1));
                Replica {
                    doc: Document::with_sender(config, text, sender),
                    sent: 0,
                    seen: BTreeMap::new(),
                }
            })
            .collect();
        Self {
            replicas,
            pending: Vec::new(),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn doc(&self, r: usize) -> &Document<DenseText> {
        &self.replicas[r].doc
    }

    pub fn doc_mut(&mut self, r: usize) -> &mut Document<DenseText> {
        &mut self.replicas[r].doc
    }

    /// Broadcast whatever replica `r` produced since the last flush.
    /// `run` does this automatically; use this after driving the
    /// document directly through [`Net::doc_mut`].
    pub fn flush(&mut self, r: usize) {
        self.collect(r);
    }

    /// Run one local operation and broadcast whatever it produced.
    pub fn run(
        &mut self,
        r: usize,
        op: impl FnOnce(&mut Document<DenseText>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        let result = op(&mut self.replicas[r].doc);
        self.collect(r);
        result
    }

    fn collect(&mut self, r: usize) {
        let deltas = self.replicas[r].doc.buffer_mut().take_deltas();
        let records = self.replicas[r].doc.take_outbox();
        let payloads = deltas
            .into_iter()
            .map(Payload::Text)
            .chain(records.into_iter().map(Payload::Record));
        for payload in payloads {
            let replica = &mut self.replicas[r];
            replica.sent += 1;
            let mut deps = replica.seen.clone();
            deps.insert(r, replica.sent - 1);
            self.pending.push(Msg {
                from: r,
                seq: replica.sent,
                deps,
                payload,
                delivered_to: BTreeSet::new(),
            });
        }
    }

    fn deliverable(&self, msg: &Msg, target: usize) -> bool {
        if target == msg.from || msg.delivered_to.contains(&target) {
            return false;
        }
        let seen = &self.replicas[target].seen;
        // FIFO from the sender, then the vector-clock gate.
        if seen.get(&msg.from).copied().unwrap_or(0) != msg.seq - 1 {
            return false;
        }
        msg.deps
            .iter()
            .filter(|(&sender, _)| sender != msg.from)
            .all(|(&sender, &need)| seen.get(&sender).copied().unwrap_or(0) >= need)
    }

    fn deliver(&mut self, msg_index: usize, target: usize) {
        let (from, seq, payload) = {
            let msg = &mut self.pending[msg_index];
            msg.delivered_to.insert(target);
            (msg.from, msg.seq, msg.payload.clone())
        };
        match payload {
            Payload::Text(delta) => self.replicas[target].doc.buffer_mut().apply_delta(&delta),
            Payload::Record(bytes) => self.replicas[target]
                .doc
                .apply_remote(&bytes)
                .expect("harness ships well-formed records"),
        }
        self.replicas[target].seen.insert(from, seq);
        // Processing may have produced derived deletions: rebroadcast.
        self.collect(target);
    }

    fn find_deliverable(&self) -> Option<(usize, usize)> {
        for (msg_index, msg) in self.pending.iter().enumerate() {
            for target in 0..self.replicas.len() {
                if self.deliverable(msg, target) {
                    return Some((msg_index, target));
                }
            }
        }
        None
    }

    /// Deliver every pending message everywhere, oldest-first.
    pub fn sync(&mut self) {
        while let Some((msg_index, target)) = self.find_deliverable() {
            self.deliver(msg_index, target);
        }
        self.gc_pending();
    }

    /// Deliver everything, picking randomly among the currently
    /// deliverable (message, target) pairs. Convergence tests run this
    /// with different seeds.
    pub fn sync_shuffled(&mut self, rng: &mut StdRng) {
        loop {
            let mut options = Vec::new();
            for (msg_index, msg) in self.pending.iter().enumerate() {
                for target in 0..self.replicas.len() {
                    if self.deliverable(msg, target) {
                        options.push((msg_index, target));
                    }
                }
            }
            if options.is_empty() {
                break;
            }
            let (msg_index, target) = options[rng.gen_range(0..options.len())];
            self.deliver(msg_index, target);
        }
        self.gc_pending();
    }

    fn gc_pending(&mut self) {
        let n = self.replicas.len();
        self.pending.retain(|msg| msg.delivered_to.len() + 1 < n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_allocates_strictly_inside_the_gap() {
        let mut rng = StdRng::seed_from_u64(7);
        let left = PathPos::from_digits(&[5]);
        let right = PathPos::from_digits(&[6]);
        for _ in 0..64 {
            let mid = PathPos::between(Some(&left), Some(&right), 3, &mut rng);
            assert!(left < mid, "{left:?} < {mid:?}");
            assert!(mid < right, "{mid:?} < {right:?}");
        }
    }

    #[test]
    fn document_start_sorts_before_everything() {
        let start = PathPos::document_start();
        assert!(start < PathPos::from_digits(&[0]));
        let mut rng = StdRng::seed_from_u64(1);
        let first = PathPos::between(None, None, 1, &mut rng);
        assert!(start < first);
    }

    #[test]
    fn positions_round_trip_through_bytes() {
        let pos = PathPos(vec![
            Step { digit: 3, site: 1 },
            Step {
                digit: u64::MAX - 1,
                site: 42,
            },
        ]);
        let mut buf = Vec::new();
        pos.write_bytes(&mut buf);
        assert_eq!(PathPos::read_bytes(&buf).unwrap(), pos);
        assert!(PathPos::read_bytes(&buf[..7]).is_err());
    }

    #[test]
    fn tombstoned_positions_resolve_with_bias() {
        let mut text = DenseText::new(1);
        text.insert(0, "abcdef");
        let c = text.position_of(2).unwrap();
        let d = text.position_of(3).unwrap();
        text.delete(2, 2);
        assert_eq!(text.contents(), "abef");

        assert!(!text.has(&c));
        assert_eq!(text.index_of(&c, Bias::Exact), None);
        assert_eq!(text.index_of(&c, Bias::Left), Some(1));
        assert_eq!(text.index_of(&d, Bias::Left), Some(1));
        assert_eq!(text.index_of(&c, Bias::Right), Some(2));
        assert_eq!(text.index_of(&d, Bias::Right), Some(2));
    }

    #[test]
    fn concurrent_inserts_converge_across_buffers() {
        let mut a = DenseText::new(1);
        let mut b = DenseText::new(2);

        a.insert(0, "abc");
        for delta in a.take_deltas() {
            b.apply_delta(&delta);
        }
        assert_eq!(b.contents(), "abc");

        a.insert(3, "X");
        b.insert(0, "Y");
        let from_a = a.take_deltas();
        let from_b = b.take_deltas();
        for delta in &from_b {
            a.apply_delta(delta);
        }
        for delta in &from_a {
            b.apply_delta(delta);
        }
        assert_eq!(a.contents(), b.contents());
        assert_eq!(a.contents(), "YabcX");
    }

    #[test]
    fn concurrent_runs_in_one_gap_stay_contiguous() {
        // Each multi-character insert chains under its head position, so
        // two concurrent runs into the same gap merge as blocks, never
        // character-interleaved.
        let mut a = DenseText::new(1);
        let mut b = DenseText::new(2);
        a.insert(0, "Hello");
        b.insert(0, "Hey");
        for delta in a.take_deltas() {
            b.apply_delta(&delta);
        }
        for delta in b.take_deltas() {
            a.apply_delta(&delta);
        }
        assert_eq!(a.contents(), b.contents());
        let merged = a.contents();
        assert!(
            merged == "HelloHey" || merged == "HeyHello",
            "runs interleaved: {merged}"
        );
    }

    #[test]
    fn net_delivers_causally() {
        let mut net = Net::new(&["u1", "u2"]);
        net.run(0, |doc| doc.insert(0, "hello", false)).unwrap();
        net.sync();
        assert_eq!(net.doc(1).contents(), "hello");

        // u2 edits on top; u1 sees it only after its prerequisite.
        net.run(1, |doc| doc.insert(5, "!", false)).unwrap();
        net.sync();
        assert_eq!(net.doc(0).contents(), "hello!");
        assert_eq!(net.doc(0).contents(), net.doc(1).contents());
    }
}
