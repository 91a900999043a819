//! Layer 6: Wire encoding.
//!
//! Bit-stable CBOR for records and log snapshots: definite lengths only,
//! string-keyed maps with sorted unique keys, explicit null for open
//! endpoints, absent keys for absent fields. Decoding is strict; any
//! deviation is a `DecodeError` and deserialization errors are fatal to
//! the caller.

use std::collections::BTreeSet;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::identity::{AnnotationId, RecordId, SenderId, UserId};
use super::log::AnnotationLog;
use super::record::{AnchorRange, Op, Patch, RangePatch, Record, Stamped};
use super::text::Position;
use super::time::{Stamp, WallClock};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<std::convert::Infallible>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
    #[error("duplicate map key: {0}")]
    DuplicateKey(String),
    #[error("indefinite-length item")]
    IndefiniteLength,
    #[error("trailing bytes after value")]
    TrailingBytes,
    #[error("snapshot arrays disagree: {0}")]
    SnapshotShape(&'static str),
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

/// Encode one stamped record for transport.
pub fn encode_record<P: Position>(stamped: &Stamped<P>) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_record_map(&mut enc, &stamped.record, Some(&stamped.stamp))?;
    Ok(Bytes::from(buf))
}

/// Decode one stamped record from transport bytes.
pub fn decode_record<P: Position>(bytes: &[u8]) -> Result<Stamped<P>, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let (record, stamp) = decode_record_map(&mut dec, true)?;
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    let stamp = stamp.ok_or(DecodeError::MissingField("lamport"))?;
    Ok(Stamped { stamp, record })
}

/// Snapshot of the whole log: parallel arrays
/// `(change_ids, lengths, records, stamps)` with records concatenated in
/// group order.
pub fn encode_snapshot<P: Position>(log: &AnnotationLog<P>) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    let groups: Vec<_> = log.groups().collect();
    let total: usize = groups.iter().map(|(_, records)| records.len()).sum();

    enc.map(4)?;

    enc.str("change_ids")?;
    enc.array(groups.len() as u64)?;
    for (id, _) in &groups {
        enc.str(&id.to_string())?;
    }

    enc.str("lengths")?;
    enc.array(groups.len() as u64)?;
    for (_, records) in &groups {
        enc.u64(records.len() as u64)?;
    }

    enc.str("records")?;
    enc.array(total as u64)?;
    for (_, records) in &groups {
        for stamped in *records {
            encode_record_map(&mut enc, &stamped.record, None)?;
        }
    }

    enc.str("stamps")?;
    enc.array(total as u64)?;
    for (_, records) in &groups {
        for stamped in *records {
            enc.array(2)?;
            enc.u64(stamped.stamp.lamport)?;
            enc.str(&stamped.stamp.sender.to_string())?;
        }
    }

    Ok(Bytes::from(buf))
}

/// Decode a snapshot back into per-id groups, ready for
/// [`AnnotationLog::merge_snapshot`].
pub fn decode_snapshot<P: Position>(
    bytes: &[u8],
) -> Result<Vec<(AnnotationId, Vec<Stamped<P>>)>, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;
    let mut seen_keys = BTreeSet::new();

    let mut change_ids: Option<Vec<AnnotationId>> = None;
    let mut lengths: Option<Vec<usize>> = None;
    let mut records: Option<Vec<Record<P>>> = None;
    let mut stamps: Option<Vec<Stamp>> = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "change_ids" => {
                let len = decode_array_len(&mut dec)?;
                let mut ids = Vec::with_capacity(len);
                for _ in 0..len {
                    let raw = decode_text(&mut dec)?;
                    ids.push(AnnotationId::parse(raw).map_err(|e| DecodeError::InvalidField {
                        field: "change_ids",
                        reason: e.to_string(),
                    })?);
                }
                change_ids = Some(ids);
            }
            "lengths" => {
                let len = decode_array_len(&mut dec)?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(decode_u64(&mut dec, "lengths")? as usize);
                }
                lengths = Some(out);
            }
            "records" => {
                let len = decode_array_len(&mut dec)?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    let (record, _) = decode_record_map(&mut dec, false)?;
                    out.push(record);
                }
                records = Some(out);
            }
            "stamps" => {
                let len = decode_array_len(&mut dec)?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    let pair = decode_array_len(&mut dec)?;
                    if pair != 2 {
                        return Err(DecodeError::InvalidField {
                            field: "stamps",
                            reason: format!("expected [lamport, sender], got {pair} items"),
                        });
                    }
                    let lamport = decode_u64(&mut dec, "stamps")?;
                    let sender = decode_text(&mut dec)?;
                    let sender =
                        SenderId::parse(sender).map_err(|e| DecodeError::InvalidField {
                            field: "stamps",
                            reason: e.to_string(),
                        })?;
                    out.push(Stamp::new(lamport, sender));
                }
                stamps = Some(out);
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "snapshot",
                    reason: format!("unknown key `{other}`"),
                });
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }

    let change_ids = change_ids.ok_or(DecodeError::MissingField("change_ids"))?;
    let lengths = lengths.ok_or(DecodeError::MissingField("lengths"))?;
    let records = records.ok_or(DecodeError::MissingField("records"))?;
    let stamps = stamps.ok_or(DecodeError::MissingField("stamps"))?;

    if change_ids.len() != lengths.len() {
        return Err(DecodeError::SnapshotShape("change_ids vs lengths"));
    }
    let total: usize = lengths.iter().sum();
    if records.len() != total || stamps.len() != total {
        return Err(DecodeError::SnapshotShape("lengths vs records/stamps"));
    }

    let mut groups = Vec::with_capacity(change_ids.len());
    let mut records = records.into_iter();
    let mut stamps = stamps.into_iter();
    for (id, len) in change_ids.into_iter().zip(lengths) {
        let mut group = Vec::with_capacity(len);
        for _ in 0..len {
            let record = records.next().expect("length-checked above");
            let stamp = stamps.next().expect("length-checked above");
            group.push(Stamped { stamp, record });
        }
        groups.push((id, group));
    }
    Ok(groups)
}

fn encode_record_map<P: Position>(
    enc: &mut Encoder<&mut Vec<u8>>,
    record: &Record<P>,
    stamp: Option<&Stamp>,
) -> Result<(), EncodeError> {
    let mut len = 4; // at, id, kind, user
    if stamp.is_some() {
        len += 2; // lamport, sender
    }
    len += match &record.op {
        Op::InsertSuggestion { .. } | Op::DeleteSuggestion { .. } => 1, // range
        Op::AddComment { .. } => 2,                                     // range, text
        Op::AcceptSuggestion { .. } | Op::DeclineSuggestion { .. } | Op::RemoveComment { .. } => 1, // dependent_on
        Op::Update { .. } => 2, // dependent_on, patch
    };

    enc.map(len as u64)?;

    enc.str("at")?;
    enc.u64(record.at.0)?;

    if let Some(dependent_on) = record.op.dependent_on() {
        enc.str("dependent_on")?;
        enc.str(&dependent_on.to_string())?;
    }

    enc.str("id")?;
    enc.str(&record.id.to_string())?;

    enc.str("kind")?;
    enc.str(record.op.kind_str())?;

    if let Some(stamp) = stamp {
        enc.str("lamport")?;
        enc.u64(stamp.lamport)?;
    }

    if let Op::Update { patch, .. } = &record.op {
        enc.str("patch")?;
        encode_patch(enc, patch)?;
    }

    match &record.op {
        Op::InsertSuggestion { range } | Op::DeleteSuggestion { range } => {
            enc.str("range")?;
            encode_range(enc, range)?;
        }
        Op::AddComment { range, .. } => {
            enc.str("range")?;
            encode_range(enc, range)?;
        }
        _ => {}
    }

    if let Some(stamp) = stamp {
        enc.str("sender")?;
        enc.str(&stamp.sender.to_string())?;
    }

    if let Op::AddComment { text, .. } = &record.op {
        enc.str("text")?;
        enc.str(text)?;
    }

    enc.str("user")?;
    enc.str(record.user.as_str())?;

    Ok(())
}

fn encode_range<P: Position>(
    enc: &mut Encoder<&mut Vec<u8>>,
    range: &AnchorRange<P>,
) -> Result<(), EncodeError> {
    enc.map(4)?;
    enc.str("end")?;
    encode_position_opt(enc, range.end.as_ref())?;
    enc.str("end_closed")?;
    enc.bool(range.end_closed)?;
    enc.str("start")?;
    encode_position_opt(enc, range.start.as_ref())?;
    enc.str("start_closed")?;
    enc.bool(range.start_closed)?;
    Ok(())
}

fn encode_patch<P: Position>(
    enc: &mut Encoder<&mut Vec<u8>>,
    patch: &RangePatch<P>,
) -> Result<(), EncodeError> {
    let mut len = 0;
    if !patch.end.is_keep() {
        len += 1;
    }
    if patch.end_closed.is_some() {
        len += 1;
    }
    if !patch.start.is_keep() {
        len += 1;
    }
    if patch.start_closed.is_some() {
        len += 1;
    }
    if patch.text.is_some() {
        len += 1;
    }

    enc.map(len as u64)?;
    match &patch.end {
        Patch::Keep => {}
        Patch::Clear => {
            enc.str("end")?;
            enc.null()?;
        }
        Patch::Set(p) => {
            enc.str("end")?;
            encode_position(enc, p)?;
        }
    }
    if let Some(closed) = patch.end_closed {
        enc.str("end_closed")?;
        enc.bool(closed)?;
    }
    match &patch.start {
        Patch::Keep => {}
        Patch::Clear => {
            enc.str("start")?;
            enc.null()?;
        }
        Patch::Set(p) => {
            enc.str("start")?;
            encode_position(enc, p)?;
        }
    }
    if let Some(closed) = patch.start_closed {
        enc.str("start_closed")?;
        enc.bool(closed)?;
    }
    if let Some(text) = &patch.text {
        enc.str("text")?;
        enc.str(text)?;
    }
    Ok(())
}

fn encode_position<P: Position>(
    enc: &mut Encoder<&mut Vec<u8>>,
    pos: &P,
) -> Result<(), EncodeError> {
    let mut bytes = Vec::new();
    pos.write_bytes(&mut bytes);
    enc.bytes(&bytes)?;
    Ok(())
}

fn encode_position_opt<P: Position>(
    enc: &mut Encoder<&mut Vec<u8>>,
    pos: Option<&P>,
) -> Result<(), EncodeError> {
    match pos {
        Some(p) => encode_position(enc, p),
        None => {
            enc.null()?;
            Ok(())
        }
    }
}

fn decode_record_map<P: Position>(
    dec: &mut Decoder<'_>,
    expect_stamp: bool,
) -> Result<(Record<P>, Option<Stamp>), DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen_keys = BTreeSet::new();

    let mut at = None;
    let mut dependent_on = None;
    let mut id = None;
    let mut kind: Option<String> = None;
    let mut lamport = None;
    let mut patch = None;
    let mut range = None;
    let mut sender = None;
    let mut text: Option<String> = None;
    let mut user = None;

    for _ in 0..map_len {
        let key = decode_text(dec)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "at" => at = Some(WallClock(decode_u64(dec, "at")?)),
            "dependent_on" => {
                let raw = decode_text(dec)?;
                dependent_on = Some(AnnotationId::parse(raw).map_err(|e| {
                    DecodeError::InvalidField {
                        field: "dependent_on",
                        reason: e.to_string(),
                    }
                })?);
            }
            "id" => {
                let raw = decode_text(dec)?;
                id = Some(
                    RecordId::parse(raw).map_err(|e| DecodeError::InvalidField {
                        field: "id",
                        reason: e.to_string(),
                    })?,
                );
            }
            "kind" => kind = Some(decode_text(dec)?.to_string()),
            "lamport" => lamport = Some(decode_u64(dec, "lamport")?),
            "patch" => patch = Some(decode_patch(dec)?),
            "range" => range = Some(decode_range(dec)?),
            "sender" => {
                let raw = decode_text(dec)?;
                sender = Some(
                    SenderId::parse(raw).map_err(|e| DecodeError::InvalidField {
                        field: "sender",
                        reason: e.to_string(),
                    })?,
                );
            }
            "text" => text = Some(decode_text(dec)?.to_string()),
            "user" => {
                let raw = decode_text(dec)?;
                user = Some(
                    UserId::new(raw).map_err(|e| DecodeError::InvalidField {
                        field: "user",
                        reason: e.to_string(),
                    })?,
                );
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "record",
                    reason: format!("unknown key `{other}`"),
                });
            }
        }
    }

    let at = at.ok_or(DecodeError::MissingField("at"))?;
    let id = id.ok_or(DecodeError::MissingField("id"))?;
    let kind = kind.ok_or(DecodeError::MissingField("kind"))?;
    let user = user.ok_or(DecodeError::MissingField("user"))?;

    let op = match kind.as_str() {
        "insert_suggestion" => Op::InsertSuggestion {
            range: range.ok_or(DecodeError::MissingField("range"))?,
        },
        "delete_suggestion" => {
            let range: AnchorRange<P> = range.ok_or(DecodeError::MissingField("range"))?;
            if range.start.is_none() || range.end.is_none() {
                return Err(DecodeError::InvalidField {
                    field: "range",
                    reason: "delete suggestion endpoints must be anchored".into(),
                });
            }
            Op::DeleteSuggestion { range }
        }
        "add_comment" => {
            let range: AnchorRange<P> = range.ok_or(DecodeError::MissingField("range"))?;
            if range.start.is_none() || range.end.is_none() {
                return Err(DecodeError::InvalidField {
                    field: "range",
                    reason: "comment endpoints must be anchored".into(),
                });
            }
            Op::AddComment {
                range,
                text: text.take().ok_or(DecodeError::MissingField("text"))?,
            }
        }
        "accept_suggestion" => Op::AcceptSuggestion {
            dependent_on: dependent_on.ok_or(DecodeError::MissingField("dependent_on"))?,
        },
        "decline_suggestion" => Op::DeclineSuggestion {
            dependent_on: dependent_on.ok_or(DecodeError::MissingField("dependent_on"))?,
        },
        "remove_comment" => Op::RemoveComment {
            dependent_on: dependent_on.ok_or(DecodeError::MissingField("dependent_on"))?,
        },
        "update" => Op::Update {
            dependent_on: dependent_on.ok_or(DecodeError::MissingField("dependent_on"))?,
            patch: patch.ok_or(DecodeError::MissingField("patch"))?,
        },
        other => return Err(DecodeError::UnknownKind(other.to_string())),
    };

    let stamp = match (lamport, sender) {
        (Some(lamport), Some(sender)) => Some(Stamp::new(lamport, sender)),
        (None, None) if !expect_stamp => None,
        (None, None) => return Err(DecodeError::MissingField("lamport")),
        (Some(_), None) => return Err(DecodeError::MissingField("sender")),
        (None, Some(_)) => return Err(DecodeError::MissingField("lamport")),
    };

    Ok((Record { id, user, at, op }, stamp))
}

fn decode_range<P: Position>(dec: &mut Decoder<'_>) -> Result<AnchorRange<P>, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen_keys = BTreeSet::new();
    let mut range = AnchorRange {
        start: None,
        end: None,
        start_closed: false,
        end_closed: false,
    };
    let mut saw = (false, false, false, false);
    for _ in 0..map_len {
        let key = decode_text(dec)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "end" => {
                range.end = decode_position_opt(dec, "end")?;
                saw.0 = true;
            }
            "end_closed" => {
                range.end_closed = decode_bool(dec, "end_closed")?;
                saw.1 = true;
            }
            "start" => {
                range.start = decode_position_opt(dec, "start")?;
                saw.2 = true;
            }
            "start_closed" => {
                range.start_closed = decode_bool(dec, "start_closed")?;
                saw.3 = true;
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "range",
                    reason: format!("unknown key `{other}`"),
                });
            }
        }
    }
    if !(saw.0 && saw.1 && saw.2 && saw.3) {
        return Err(DecodeError::MissingField("range endpoint"));
    }
    if (range.start.is_none() && range.start_closed) || (range.end.is_none() && range.end_closed) {
        return Err(DecodeError::InvalidField {
            field: "range",
            reason: "open endpoints are never closed".into(),
        });
    }
    Ok(range)
}

fn decode_patch<P: Position>(dec: &mut Decoder<'_>) -> Result<RangePatch<P>, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen_keys = BTreeSet::new();
    let mut patch = RangePatch::default();
    for _ in 0..map_len {
        let key = decode_text(dec)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "end" => {
                patch.end = match decode_position_opt(dec, "end")? {
                    Some(p) => Patch::Set(p),
                    None => Patch::Clear,
                };
            }
            "end_closed" => patch.end_closed = Some(decode_bool(dec, "end_closed")?),
            "start" => {
                patch.start = match decode_position_opt(dec, "start")? {
                    Some(p) => Patch::Set(p),
                    None => Patch::Clear,
                };
            }
            "start_closed" => patch.start_closed = Some(decode_bool(dec, "start_closed")?),
            "text" => patch.text = Some(decode_text(dec)?.to_string()),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "patch",
                    reason: format!("unknown key `{other}`"),
                });
            }
        }
    }
    Ok(patch)
}

fn decode_position_opt<P: Position>(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<Option<P>, DecodeError> {
    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(None)
        }
        Type::Bytes => {
            let bytes = dec.bytes()?;
            P::read_bytes(bytes)
                .map(Some)
                .map_err(|e| DecodeError::InvalidField {
                    field,
                    reason: e.to_string(),
                })
        }
        Type::BytesIndef => Err(DecodeError::IndefiniteLength),
        other => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected bytes or null, got {other:?}"),
        }),
    }
}

fn ensure_unique_key<'a>(seen: &mut BTreeSet<&'a str>, key: &'a str) -> Result<(), DecodeError> {
    if seen.insert(key) {
        Ok(())
    } else {
        Err(DecodeError::DuplicateKey(key.to_string()))
    }
}

fn decode_map_len(dec: &mut Decoder<'_>) -> Result<usize, DecodeError> {
    match dec.map()? {
        Some(len) => Ok(len as usize),
        None => Err(DecodeError::IndefiniteLength),
    }
}

fn decode_array_len(dec: &mut Decoder<'_>) -> Result<usize, DecodeError> {
    match dec.array()? {
        Some(len) => Ok(len as usize),
        None => Err(DecodeError::IndefiniteLength),
    }
}

fn decode_text<'a>(dec: &mut Decoder<'a>) -> Result<&'a str, DecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    Ok(dec.str()?)
}

fn decode_u64(dec: &mut Decoder<'_>, field: &'static str) -> Result<u64, DecodeError> {
    match dec.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Ok(dec.u64()?),
        other => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected unsigned integer, got {other:?}"),
        }),
    }
}

fn decode_bool(dec: &mut Decoder<'_>, field: &'static str) -> Result<bool, DecodeError> {
    match dec.datatype()? {
        Type::Bool => Ok(dec.bool()?),
        other => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected bool, got {other:?}"),
        }),
    }
}
