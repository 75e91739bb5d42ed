//! In-process driver for opwatch: namespaced document collections plus a
//! capped, tailable journal that records every mutation.
//!
//! This is the driver integration tests and demos run against; it applies
//! server-side filter specs with [`moql`], the way a real server applies
//! find specs. Not a persistence layer — everything lives in memory.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document, Timestamp};
use tokio::sync::Notify;
use tracing::debug;

use opwatch_core::journal::JournalEntry;
use opwatch_core::{CursorMode, Driver, DriverError, JournalCursor, Namespace, OpTime};

const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// An in-memory database with an oplog-shaped journal.
#[derive(Clone)]
pub struct MemoryDb(Arc<MemoryDbInner>);

struct MemoryDbInner {
    collections: Mutex<HashMap<Namespace, Vec<Document>>>,
    journal: Mutex<Journal>,
    appended: Notify,
    capacity: usize,
}

struct Journal {
    entries: VecDeque<Document>,
    /// Sequence number of the oldest retained entry; grows as the capped
    /// journal rolls over.
    first_seq: u64,
    /// Logical clock; ordering is all the engine needs from timestamps.
    next_increment: u32,
}

impl MemoryDb {
    pub fn new() -> Self { Self::with_capacity(DEFAULT_JOURNAL_CAPACITY) }

    /// A database whose journal retains at most `capacity` entries. Small
    /// capacities are how tests provoke watermark loss.
    pub fn with_capacity(capacity: usize) -> Self {
        // a replica set's journal opens with an initialization no-op, so an
        // engine never has to seed its watermark from an empty journal
        let mut entries = VecDeque::new();
        entries.push_back(doc! {
            "ts": Timestamp { time: 1, increment: 1 },
            "ns": "",
            "op": "n",
            "o": { "msg": "initiating set" },
        });
        Self(Arc::new(MemoryDbInner {
            collections: Mutex::new(HashMap::new()),
            journal: Mutex::new(Journal { entries, first_seq: 0, next_increment: 1 }),
            appended: Notify::new(),
            capacity,
        }))
    }

    /// Insert a document, assigning an `ObjectId` when `_id` is absent.
    pub fn insert(&self, ns: &Namespace, mut doc: Document) -> OpTime {
        if !doc.contains_key("_id") {
            doc.insert("_id", ObjectId::new());
        }
        self.0.collections.lock().unwrap().entry(ns.clone()).or_default().push(doc.clone());
        self.append(ns, "i", doc, None)
    }

    pub fn insert_many(&self, ns: &Namespace, docs: impl IntoIterator<Item = Document>) -> Vec<OpTime> {
        docs.into_iter().map(|doc| self.insert(ns, doc)).collect()
    }

    /// Apply `update` to the first document matching `spec`. Returns the
    /// journal timestamp, or `None` when nothing matched.
    pub fn update_one(&self, ns: &Namespace, spec: &Document, update: &Document) -> Result<Option<OpTime>, DriverError> {
        Ok(self.update(ns, spec, update, true)?.into_iter().next())
    }

    /// Apply `update` to every document matching `spec`, journaling one
    /// entry per document in collection order.
    pub fn update_many(&self, ns: &Namespace, spec: &Document, update: &Document) -> Result<Vec<OpTime>, DriverError> {
        self.update(ns, spec, update, false)
    }

    fn update(&self, ns: &Namespace, spec: &Document, update: &Document, only_first: bool) -> Result<Vec<OpTime>, DriverError> {
        let mut touched = Vec::new();
        {
            let mut collections = self.0.collections.lock().unwrap();
            let Some(docs) = collections.get_mut(ns) else { return Ok(Vec::new()) };
            for doc in docs.iter_mut() {
                if !moql::matches(spec, doc).map_err(DriverError::backend)? {
                    continue;
                }
                apply_update(doc, update)?;
                if let Some(id) = doc.get("_id") {
                    touched.push(id.clone());
                }
                if only_first {
                    break;
                }
            }
        }
        Ok(touched.into_iter().map(|id| self.append(ns, "u", update.clone(), Some(doc! { "_id": id }))).collect())
    }

    /// Delete the first document matching `spec`.
    pub fn delete_one(&self, ns: &Namespace, spec: &Document) -> Result<Option<OpTime>, DriverError> {
        Ok(self.delete(ns, spec, true)?.into_iter().next())
    }

    pub fn delete_many(&self, ns: &Namespace, spec: &Document) -> Result<Vec<OpTime>, DriverError> {
        self.delete(ns, spec, false)
    }

    fn delete(&self, ns: &Namespace, spec: &Document, only_first: bool) -> Result<Vec<OpTime>, DriverError> {
        let mut removed = Vec::new();
        {
            let mut collections = self.0.collections.lock().unwrap();
            let Some(docs) = collections.get_mut(ns) else { return Ok(Vec::new()) };
            let mut index = 0;
            while index < docs.len() {
                if moql::matches(spec, &docs[index]).map_err(DriverError::backend)? {
                    let doc = docs.remove(index);
                    if let Some(id) = doc.get("_id") {
                        removed.push(id.clone());
                    }
                    if only_first {
                        break;
                    }
                } else {
                    index += 1;
                }
            }
        }
        Ok(removed.into_iter().map(|id| self.append(ns, "d", doc! { "_id": id }, None)).collect())
    }

    fn append(&self, ns: &Namespace, op: &str, o: Document, o2: Option<Document>) -> OpTime {
        let ts = {
            let mut journal = self.0.journal.lock().unwrap();
            journal.next_increment += 1;
            let ts = Timestamp { time: 1, increment: journal.next_increment };
            let mut entry = doc! { "ts": ts, "ns": ns.to_string(), "op": op, "o": o };
            if let Some(o2) = o2 {
                entry.insert("o2", o2);
            }
            journal.entries.push_back(entry);
            if journal.entries.len() > self.0.capacity {
                journal.entries.pop_front();
                journal.first_seq += 1;
            }
            ts
        };
        debug!("journaled {op} at {}.{}", ts.time, ts.increment);
        self.0.appended.notify_waiters();
        OpTime::new(ts)
    }
}

impl Default for MemoryDb {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Driver for MemoryDb {
    async fn latest_timestamp(&self) -> Result<Option<OpTime>, DriverError> {
        Ok(self.0.journal.lock().unwrap().entries.back().and_then(JournalEntry::read_ts))
    }

    async fn earliest_timestamp(&self) -> Result<Option<OpTime>, DriverError> {
        Ok(self.0.journal.lock().unwrap().entries.front().and_then(JournalEntry::read_ts))
    }

    async fn tail_journal(&self, filter: &Document, mode: CursorMode) -> Result<Box<dyn JournalCursor>, DriverError> {
        let seq = self.0.journal.lock().unwrap().first_seq;
        Ok(Box::new(MemoryCursor { db: self.0.clone(), filter: filter.clone(), mode, seq }))
    }

    async fn find(&self, ns: &Namespace, spec: &Document) -> Result<Vec<Document>, DriverError> {
        let collections = self.0.collections.lock().unwrap();
        let Some(docs) = collections.get(ns) else { return Ok(Vec::new()) };
        let mut results = Vec::new();
        for doc in docs {
            if moql::matches(spec, doc).map_err(DriverError::backend)? {
                results.push(doc.clone());
            }
        }
        Ok(results)
    }

    async fn find_one(&self, ns: &Namespace, spec: &Document) -> Result<Option<Document>, DriverError> {
        Ok(self.find(ns, spec).await?.into_iter().next())
    }
}

struct MemoryCursor {
    db: Arc<MemoryDbInner>,
    filter: Document,
    mode: CursorMode,
    /// Absolute sequence number of the next entry to consider.
    seq: u64,
}

impl MemoryCursor {
    /// Scan retained entries from the cursor position, returning the first
    /// one the filter selects.
    fn scan(&mut self) -> Result<Option<Document>, DriverError> {
        let journal = self.db.journal.lock().unwrap();
        if self.seq < journal.first_seq {
            // rolled past our position; the engine's watermark check is what
            // reports the loss
            self.seq = journal.first_seq;
        }
        while let Some(entry) = journal.entries.get((self.seq - journal.first_seq) as usize) {
            self.seq += 1;
            if moql::matches(&self.filter, entry).map_err(DriverError::backend)? {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JournalCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Document>, DriverError> {
        loop {
            // register for wakeups before scanning, so an append racing the
            // scan is not missed
            let db = self.db.clone();
            let notified = db.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(raw) = self.scan()? {
                return Ok(Some(raw));
            }
            match self.mode {
                CursorMode::Tailable => return Ok(None),
                CursorMode::TailableAwait => notified.await,
            }
        }
    }
}

fn apply_update(doc: &mut Document, update: &Document) -> Result<(), DriverError> {
    if update.keys().any(|key| key.starts_with('$')) {
        for (op, argument) in update {
            let Bson::Document(fields) = argument else {
                return Err(DriverError::other(format!("{op} expects a document argument")));
            };
            match op.as_str() {
                "$set" => {
                    for (field, value) in fields {
                        doc.insert(field, value.clone());
                    }
                }
                "$inc" => {
                    for (field, by) in fields {
                        let current = doc.get(field).cloned().unwrap_or(Bson::Int32(0));
                        doc.insert(field, increment(&current, by)?);
                    }
                }
                "$unset" => {
                    for (field, _) in fields {
                        doc.remove(field);
                    }
                }
                other => return Err(DriverError::other(format!("unsupported update operator {other}"))),
            }
        }
    } else {
        // whole-document replacement keeps the identifier
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id", id);
        }
    }
    Ok(())
}

fn increment(current: &Bson, by: &Bson) -> Result<Bson, DriverError> {
    use Bson::{Double, Int32, Int64};
    Ok(match (current, by) {
        (Int32(a), Int32(b)) => Int32(a + b),
        (Int32(a), Int64(b)) => Int64(*a as i64 + b),
        (Int64(a), Int32(b)) => Int64(a + *b as i64),
        (Int64(a), Int64(b)) => Int64(a + b),
        (Double(a), Int32(b)) => Double(a + *b as f64),
        (Double(a), Int64(b)) => Double(a + *b as f64),
        (Int32(a), Double(b)) => Double(*a as f64 + b),
        (Int64(a), Double(b)) => Double(*a as f64 + b),
        (Double(a), Double(b)) => Double(a + b),
        _ => return Err(DriverError::other("$inc requires numeric operands")),
    })
}
