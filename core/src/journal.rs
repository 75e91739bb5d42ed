use bson::{Bson, Document};
use thiserror::Error;

use crate::types::{DocId, InvalidNamespace, Namespace, OpTime};

/// Opcode of a journal entry. Anything else the journal carries (commands,
/// no-ops) is ignored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn from_code(op: &str) -> Option<Self> {
        match op {
            "i" => Some(Self::Insert),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EntryError {
    #[error("journal entry missing field {0}")]
    MissingField(&'static str),
    #[error("journal entry field {0} has unexpected type")]
    WrongType(&'static str),
    #[error("journal entry namespace: {0}")]
    Namespace(#[from] InvalidNamespace),
}

/// A typed view of one raw oplog document `{ts, ns, op, o, o2?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub ts: OpTime,
    pub ns: Namespace,
    pub op: OpKind,
    /// Inserted document (`i`), delete key document (`d`), or update delta
    /// (`u`; not usable for matching).
    pub o: Document,
    /// Update key document (`u` only); carries the updated document's `_id`.
    pub o2: Option<Document>,
    /// Current document fetched by the engine for `u` entries. Absent when
    /// the document no longer exists at fetch time.
    pub obj: Option<Document>,
}

impl JournalEntry {
    /// Timestamp of a raw entry, readable even when the rest is malformed,
    /// so a skipped entry can still advance the watermark.
    pub fn read_ts(raw: &Document) -> Option<OpTime> {
        match raw.get("ts") {
            Some(Bson::Timestamp(ts)) => Some(OpTime::new(*ts)),
            _ => None,
        }
    }

    /// Opcode of a raw entry, `None` for opcodes the engine ignores.
    pub fn read_op(raw: &Document) -> Option<OpKind> { raw.get_str("op").ok().and_then(OpKind::from_code) }

    pub fn parse(raw: &Document) -> Result<Self, EntryError> {
        let ts = Self::read_ts(raw).ok_or(EntryError::MissingField("ts"))?;
        let ns: Namespace = raw.get_str("ns").map_err(|_| EntryError::MissingField("ns"))?.parse()?;
        let op = raw.get_str("op").map_err(|_| EntryError::MissingField("op"))?;
        let op = OpKind::from_code(op).ok_or(EntryError::WrongType("op"))?;
        let o = raw.get_document("o").map_err(|_| EntryError::MissingField("o"))?.clone();
        let o2 = match raw.get("o2") {
            Some(Bson::Document(key)) => Some(key.clone()),
            Some(_) => return Err(EntryError::WrongType("o2")),
            None => None,
        };
        match op {
            OpKind::Insert | OpKind::Delete => {
                if !o.contains_key("_id") {
                    return Err(EntryError::MissingField("o._id"));
                }
            }
            OpKind::Update => {
                if !o2.as_ref().is_some_and(|key| key.contains_key("_id")) {
                    return Err(EntryError::MissingField("o2._id"));
                }
            }
        }
        Ok(Self { ts, ns, op, o, o2, obj: None })
    }

    /// The `_id` this entry affects: the inserted/deleted document's for
    /// `i`/`d`, the update key's for `u`.
    pub fn doc_id(&self) -> Option<DocId> {
        let key = match self.op {
            OpKind::Insert | OpKind::Delete => self.o.get("_id"),
            OpKind::Update => self.o2.as_ref().and_then(|o2| o2.get("_id")),
        };
        key.map(DocId::from)
    }
}
