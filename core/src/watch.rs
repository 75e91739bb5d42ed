use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bson::Document;
use ulid::Ulid;

use crate::error::EngineError;
use crate::filter;
use crate::journal::{JournalEntry, OpKind};
use crate::types::{DocId, Namespace};

/// Outcome of feeding one journal entry to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// The registration's tracked id set changed; the server-side filter is
    /// stale and the cursor must be reopened.
    RestartCursor,
}

impl Effect {
    pub(crate) fn combine(self, other: Effect) -> Effect {
        if self == Effect::RestartCursor || other == Effect::RestartCursor {
            Effect::RestartCursor
        } else {
            Effect::None
        }
    }
}

/// A callback receiving raw journal entries from a watch. Runs on the
/// engine's drive loop, like live-query callbacks.
pub type EntryCallback = Box<dyn Fn(&JournalEntry) + Send + Sync + 'static>;

/// What a raw watch selects from the journal.
pub enum WatchKind {
    /// Insert entries, optionally narrowed by a query spec evaluated against
    /// the inserted document.
    Inserts { spec: Option<Document> },
    /// Update entries, optionally restricted to a fixed id list.
    Updates { ids: Option<HashSet<DocId>> },
    /// Delete entries, optionally restricted to a fixed id list.
    Deletes { ids: Option<HashSet<DocId>> },
    /// Stateful: inserts matching a spec, plus updates and deletes of every
    /// id seen so far. With `check_inserts` unset, any insert arriving on
    /// the namespace is tracked — even one another registration's filter
    /// branch let through — matching the multiplexed stream's semantics.
    Query { spec: Document, check_inserts: bool, ids: Mutex<HashSet<DocId>> },
}

/// A raw-entry registration: delivers the journal entries its branches
/// select, without interpreting them into membership changes.
#[derive(Clone)]
pub struct Watch(Arc<WatchInner>);

struct WatchInner {
    id: Ulid,
    ns: Namespace,
    kind: WatchKind,
    callback: EntryCallback,
}

impl Watch {
    pub(crate) fn new(ns: Namespace, kind: WatchKind, callback: EntryCallback) -> Self {
        Self(Arc::new(WatchInner { id: Ulid::new(), ns, kind, callback }))
    }

    pub(crate) fn id(&self) -> Ulid { self.0.id }

    pub fn namespace(&self) -> &Namespace { &self.0.ns }

    /// Ids currently tracked by a stateful query watch.
    pub fn tracked_ids(&self) -> Vec<DocId> {
        match &self.0.kind {
            WatchKind::Query { ids, .. } => ids.lock().unwrap().iter().cloned().collect(),
            WatchKind::Updates { ids } | WatchKind::Deletes { ids } => {
                ids.as_ref().map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
            }
            WatchKind::Inserts { .. } => Vec::new(),
        }
    }

    /// Feed one journal entry: update tracking state and deliver the entry
    /// to the callback when this watch selects it. The engine guarantees
    /// `entry.ns` matches.
    pub(crate) fn observe(&self, entry: &JournalEntry) -> Result<Effect, EngineError> {
        debug_assert_eq!(entry.ns, self.0.ns);
        match &self.0.kind {
            WatchKind::Inserts { spec } => {
                if entry.op == OpKind::Insert && spec_selects(spec.as_ref(), &entry.o)? {
                    (self.0.callback)(entry);
                }
                Ok(Effect::None)
            }
            WatchKind::Updates { ids } => {
                if entry.op == OpKind::Update && id_selects(ids.as_ref(), entry) {
                    (self.0.callback)(entry);
                }
                Ok(Effect::None)
            }
            WatchKind::Deletes { ids } => {
                if entry.op == OpKind::Delete && id_selects(ids.as_ref(), entry) {
                    (self.0.callback)(entry);
                }
                Ok(Effect::None)
            }
            WatchKind::Query { spec, check_inserts, ids } => self.observe_query(spec, *check_inserts, ids, entry),
        }
    }

    fn observe_query(
        &self,
        spec: &Document,
        check_inserts: bool,
        ids: &Mutex<HashSet<DocId>>,
        entry: &JournalEntry,
    ) -> Result<Effect, EngineError> {
        let Some(id) = entry.doc_id() else { return Ok(Effect::None) };
        match entry.op {
            OpKind::Insert => {
                let matched = moql::matches(spec, &entry.o)?;
                let mut effect = Effect::None;
                if (matched || !check_inserts) && ids.lock().unwrap().insert(id) {
                    effect = Effect::RestartCursor;
                }
                if matched {
                    (self.0.callback)(entry);
                }
                Ok(effect)
            }
            OpKind::Update => {
                if ids.lock().unwrap().contains(&id) {
                    (self.0.callback)(entry);
                }
                Ok(Effect::None)
            }
            OpKind::Delete => {
                if ids.lock().unwrap().remove(&id) {
                    (self.0.callback)(entry);
                    return Ok(Effect::RestartCursor);
                }
                Ok(Effect::None)
            }
        }
    }

    /// This watch's contribution to the fine-grained server-side filter.
    pub(crate) fn filter_branches(&self) -> Vec<Document> {
        let ns = self.0.ns.to_string();
        match &self.0.kind {
            WatchKind::Inserts { spec } => vec![filter::insert_branch(&ns, spec.as_ref())],
            WatchKind::Updates { ids } => {
                vec![filter::id_branch("u", "o2._id", &ns, ids.as_ref().map(|ids| ids.iter().map(DocId::value)))]
            }
            WatchKind::Deletes { ids } => {
                vec![filter::id_branch("d", "o._id", &ns, ids.as_ref().map(|ids| ids.iter().map(DocId::value)))]
            }
            WatchKind::Query { spec, ids, .. } => {
                let mut branches = vec![filter::insert_branch(&ns, Some(spec))];
                let ids = ids.lock().unwrap();
                if !ids.is_empty() {
                    branches.push(filter::id_branch("u", "o2._id", &ns, Some(ids.iter().map(DocId::value))));
                    branches.push(filter::id_branch("d", "o._id", &ns, Some(ids.iter().map(DocId::value))));
                }
                branches
            }
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.0.kind {
            WatchKind::Inserts { .. } => "inserts",
            WatchKind::Updates { .. } => "updates",
            WatchKind::Deletes { .. } => "deletes",
            WatchKind::Query { .. } => "query",
        };
        write!(f, "Watch {{ ns: {}, kind: {} }}", self.0.ns, kind)
    }
}

fn spec_selects(spec: Option<&Document>, doc: &Document) -> Result<bool, EngineError> {
    match spec {
        Some(spec) => Ok(moql::matches(spec, doc)?),
        None => Ok(true),
    }
}

fn id_selects(ids: Option<&HashSet<DocId>>, entry: &JournalEntry) -> bool {
    match ids {
        Some(ids) => entry.doc_id().map(|id| ids.contains(&id)).unwrap_or(false),
        None => true,
    }
}
