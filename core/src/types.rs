use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bson::{Bson, Timestamp};
use thiserror::Error;

/// Journal ordering token. Wraps the oplog timestamp and orders by
/// `(time, increment)`, which is total per replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTime(Timestamp);

impl OpTime {
    /// Watermark of an engine built against an empty journal.
    pub const ZERO: OpTime = OpTime(Timestamp { time: 0, increment: 0 });

    pub fn new(ts: Timestamp) -> Self { Self(ts) }

    pub fn timestamp(&self) -> Timestamp { self.0 }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> Ordering { (self.0.time, self.0.increment).cmp(&(other.0.time, other.0.increment)) }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl From<Timestamp> for OpTime {
    fn from(ts: Timestamp) -> Self { Self(ts) }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}", self.0.time, self.0.increment) }
}

/// A `database.collection` pair, the journal's routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self { Self { db: db.into(), coll: coll.into() } }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid namespace {0:?}: expected db.collection")]
pub struct InvalidNamespace(pub String);

impl FromStr for Namespace {
    type Err = InvalidNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // collection names may themselves contain dots, so split once
        let (db, coll) = s.split_once('.').ok_or_else(|| InvalidNamespace(s.to_string()))?;
        if db.is_empty() || coll.is_empty() {
            return Err(InvalidNamespace(s.to_string()));
        }
        Ok(Self::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}", self.db, self.coll) }
}

/// A document identifier usable as a result-set key.
///
/// BSON values do not hash, so identity is the canonical extended-JSON
/// rendering of the `_id` value. That also folds integer widths together the
/// way the server does: an `_id` of `6` stored as `Int32` and `Int64` is one
/// identity.
#[derive(Debug, Clone)]
pub struct DocId {
    value: Bson,
    canon: String,
}

impl DocId {
    pub fn new(value: Bson) -> Self {
        let canon = value.clone().into_relaxed_extjson().to_string();
        Self { value, canon }
    }

    /// The raw `_id` value, for building driver specs and filter branches.
    pub fn value(&self) -> &Bson { &self.value }
}

impl From<&Bson> for DocId {
    fn from(value: &Bson) -> Self { Self::new(value.clone()) }
}

impl From<Bson> for DocId {
    fn from(value: Bson) -> Self { Self::new(value) }
}

impl PartialEq for DocId {
    fn eq(&self, other: &Self) -> bool { self.canon == other.canon }
}

impl Eq for DocId {}

impl Hash for DocId {
    fn hash<H: Hasher>(&self, state: &mut H) { self.canon.hash(state) }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.canon) }
}
