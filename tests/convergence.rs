//! Convergence properties under permuted delivery orders and random
//! operation soups.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use redline::core::engine::{resolve_range, Engine};
use redline::core::{AnnotationLog, Op, Patch, RangePatch, Record, Stamped};
use redline::test_harness::{DenseText, Net, PathPos};
use redline::{
    AnchorRange, AnnotationId, AnnotationKind, RecordId, SenderId, Stamp, TextBuffer, UserId,
    WallClock,
};

fn sender(n: u128) -> SenderId {
    SenderId::from_uuid(uuid::Uuid::from_u128(n))
}

fn stamped(lamport: u64, sender_n: u128, op: Op<PathPos>) -> Stamped<PathPos> {
    Stamped {
        stamp: Stamp::new(lamport, sender(sender_n)),
        record: Record {
            id: RecordId::random(),
            user: UserId::new(format!("u{sender_n}")).unwrap(),
            at: WallClock(0),
            op,
        },
    }
}

/// Replay records through a fresh log + engine in the given order.
fn replay(
    text_template: &DenseText,
    records: &[Stamped<PathPos>],
) -> (DenseText, Engine<PathPos>, AnnotationLog<PathPos>) {
    let mut text = text_template.clone();
    let mut log = AnnotationLog::new();
    let mut engine = Engine::new();
    for stamped in records {
        let id = stamped.record.change_id();
        if log.ingest(stamped.clone()).is_applied() {
            if let Some(history) = log.history(&id) {
                engine.reconcile(id, history, &mut text);
            }
        }
    }
    (text, engine, log)
}

fn observable(text: &DenseText, engine: &Engine<PathPos>) -> Vec<(AnnotationId, String, usize, usize)> {
    let mut out: Vec<_> = engine
        .active_annotations()
        .map(|a| {
            let (start, end) = resolve_range(text, &a.range);
            (a.id, format!("{:?}/{}", a.kind, a.author), start, end)
        })
        .collect();
    out.sort();
    out
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    /// P4: over distinct (lamport, sender) pairs, exactly one side wins.
    #[test]
    fn wins_is_a_total_order(a_lamport in 0u64..50, a_sender in 0u128..4,
                             b_lamport in 0u64..50, b_sender in 0u128..4) {
        let a = Stamp::new(a_lamport, sender(a_sender));
        let b = Stamp::new(b_lamport, sender(b_sender));
        if a == b {
            prop_assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
        } else {
            prop_assert_ne!(a < b, b < a);
            prop_assert!((a < b) ^ (b < a));
        }
    }

    /// P1 (annotation layer): any causal delivery order of one
    /// annotation's history yields the same derived state.
    #[test]
    fn comment_histories_commute(seed in 0u64..256) {
        let mut base = DenseText::new(9);
        base.insert(0, "abcdefgh");
        base.take_deltas();

        let add = stamped(1, 1, Op::AddComment {
            range: AnchorRange::closed(
                base.position_of(1).unwrap(),
                base.position_of(3).unwrap(),
            ),
            text: "first".into(),
        });
        let id = add.record.change_id();
        let concurrent = vec![
            stamped(2, 1, Op::Update {
                dependent_on: id,
                patch: RangePatch {
                    end: Patch::Set(base.position_of(5).unwrap()),
                    end_closed: Some(true),
                    ..Default::default()
                },
            }),
            stamped(2, 2, Op::RemoveComment { dependent_on: id }),
            stamped(3, 1, Op::Update {
                dependent_on: id,
                patch: RangePatch {
                    text: Some("second".into()),
                    ..Default::default()
                },
            }),
            stamped(4, 2, Op::RemoveComment { dependent_on: id }),
        ];

        // Causal constraint: the Addition precedes everything else;
        // the rest may arrive in any interleaving.
        let mut rng = StdRng::seed_from_u64(seed);
        let mut shuffled = concurrent.clone();
        for i in (1..shuffled.len()).rev() {
            let j = rng.gen_range(0..=i);
            shuffled.swap(i, j);
        }

        let mut canonical = vec![add.clone()];
        canonical.extend(concurrent);
        let mut permuted = vec![add];
        permuted.extend(shuffled);

        let (text_a, engine_a, log_a) = replay(&base, &canonical);
        let (text_b, engine_b, log_b) = replay(&base, &permuted);

        prop_assert_eq!(observable(&text_a, &engine_a), observable(&text_b, &engine_b));
        prop_assert_eq!(log_a, log_b);
        prop_assert_eq!(text_a.contents(), text_b.contents());
    }
}

/// P7: a record strictly dominating a prior removal brings the
/// annotation back with its effect, in either arrival order.
#[test]
fn dominating_update_resurrects_in_any_order() {
    let mut base = DenseText::new(9);
    base.insert(0, "abcdefgh");
    base.take_deltas();

    let add = stamped(
        1,
        1,
        Op::AddComment {
            range: AnchorRange::closed(base.position_of(0).unwrap(), base.position_of(2).unwrap()),
            text: "keep me".into(),
        },
    );
    let id = add.record.change_id();
    let remove = stamped(2, 2, Op::RemoveComment { dependent_on: id });
    let revive = stamped(
        3,
        1,
        Op::Update {
            dependent_on: id,
            patch: RangePatch {
                text: Some("kept".into()),
                ..Default::default()
            },
        },
    );

    let one = vec![add.clone(), remove.clone(), revive.clone()];
    let two = vec![add, revive, remove];
    let (text_a, engine_a, _) = replay(&base, &one);
    let (text_b, engine_b, _) = replay(&base, &two);

    let state_a = observable(&text_a, &engine_a);
    assert_eq!(state_a.len(), 1, "annotation is live again");
    assert_eq!(state_a, observable(&text_b, &engine_b));
    assert_eq!(
        engine_a.live_annotation(&id).unwrap().text.as_deref(),
        Some("kept")
    );
}

/// P1 end-to-end: a random multi-replica editing session converges on
/// text and on every derived query, for any shuffled delivery order.
#[test]
fn random_sessions_converge() {
    redline::telemetry::init_for_tests();
    for seed in 0..24u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut net = Net::new(&["alice", "bob", "carol"]);

        for _ in 0..40 {
            let r = rng.gen_range(0..3);
            let len = net.doc(r).len();
            match rng.gen_range(0..8) {
                0 | 1 => {
                    let index = rng.gen_range(0..=len);
                    let word = ["ab", "xyz", "q", "hello "][rng.gen_range(0..4)];
                    let suggestion = rng.gen_bool(0.5);
                    net.run(r, |doc| doc.insert(index, word, suggestion)).unwrap();
                }
                2 | 3 if len > 0 => {
                    let index = rng.gen_range(0..len);
                    let count = rng.gen_range(1..=(len - index).min(3));
                    let suggestion = rng.gen_bool(0.5);
                    net.run(r, |doc| doc.delete(index, count, suggestion)).unwrap();
                }
                4 if len > 1 => {
                    let start = rng.gen_range(0..len - 1);
                    let end = rng.gen_range(start + 1..=len);
                    let _ = net.doc_mut(r).add_comment(start, end, "note");
                    net.flush(r);
                }
                5 => {
                    let suggestions: Vec<_> = net
                        .doc(r)
                        .active_annotations()
                        .into_iter()
                        .filter(|a| a.kind != AnnotationKind::Comment)
                        .collect();
                    if !suggestions.is_empty() {
                        let id = suggestions[rng.gen_range(0..suggestions.len())].id;
                        let accept = rng.gen_bool(0.5);
                        net.run(r, |doc| {
                            if accept {
                                doc.accept_suggestion(id)
                            } else {
                                doc.decline_suggestion(id)
                            }
                        })
                        .unwrap();
                    }
                }
                6 => {
                    let comments: Vec<_> = net
                        .doc(r)
                        .active_annotations()
                        .into_iter()
                        .filter(|a| a.kind == AnnotationKind::Comment)
                        .collect();
                    if !comments.is_empty() {
                        let id = comments[rng.gen_range(0..comments.len())].id;
                        net.run(r, |doc| doc.remove_comment(id)).unwrap();
                    }
                }
                _ => {
                    if rng.gen_bool(0.3) {
                        net.sync_shuffled(&mut rng);
                    }
                }
            }
        }
        net.sync_shuffled(&mut rng);

        let reference = net.doc(0).contents();
        let reference_ids: Vec<_> = net
            .doc(0)
            .active_annotations()
            .iter()
            .map(|a| (a.id, net.doc(0).resolve(a)))
            .collect();
        for r in 1..3 {
            assert_eq!(net.doc(r).contents(), reference, "seed {seed} text diverged");
            let ids: Vec<_> = net
                .doc(r)
                .active_annotations()
                .iter()
                .map(|a| (a.id, net.doc(r).resolve(a)))
                .collect();
            assert_eq!(ids, reference_ids, "seed {seed} annotations diverged");
            for index in 0..net.doc(r).len() {
                let mut left: Vec<_> =
                    net.doc(0).annotations_at(index).iter().map(|a| a.id).collect();
                let mut right: Vec<_> =
                    net.doc(r).annotations_at(index).iter().map(|a| a.id).collect();
                left.sort();
                right.sort();
                assert_eq!(left, right, "seed {seed} view diverged at {index}");
            }
        }
    }
}
