use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bson::{doc, Document};
use tracing::{debug, info};
use ulid::Ulid;

use crate::changes::{Change, ChangeKind, Changed};
use crate::driver::Driver;
use crate::error::EngineError;
use crate::filter;
use crate::journal::{JournalEntry, OpKind};
use crate::types::{DocId, Namespace, OpTime};
use crate::watch::Effect;

/// A callback invoked for every membership change. Runs on the engine's
/// drive loop; keep it fast or hand the change off to your own queue.
pub type Callback = Box<dyn Fn(Change) + Send + Sync + 'static>;

/// A registered query over one namespace: a predicate plus the set of
/// documents currently satisfying it.
///
/// Cheap to clone; clones share state, and identity (for deregistration) is
/// the internal id rather than a back-pointer into the engine.
#[derive(Clone)]
pub struct LiveQuery(Arc<LiveQueryInner>);

struct LiveQueryInner {
    id: Ulid,
    driver: Arc<dyn Driver>,
    ns: Namespace,
    spec: Document,
    /// `_id` clause of the spec, when it pins one. A hint for filter
    /// synthesis: it bounds the update traffic before any match is tracked.
    spec_by_id: Option<Document>,
    /// Invariant: every value satisfies `spec` as of its last observation.
    result_set: Mutex<HashMap<DocId, Document>>,
    callback: Callback,
}

impl LiveQuery {
    /// Build a query over `ns`. With no callback, changes are logged.
    pub fn new(driver: Arc<dyn Driver>, ns: Namespace, spec: Document, callback: Option<Callback>) -> Self {
        let spec_by_id = spec.get("_id").map(|clause| doc! { "_id": clause.clone() });
        let callback = callback.unwrap_or_else(|| Box::new(log_change));
        Self(Arc::new(LiveQueryInner {
            id: Ulid::new(),
            driver,
            ns,
            spec,
            spec_by_id,
            result_set: Mutex::new(HashMap::new()),
            callback,
        }))
    }

    pub(crate) fn id(&self) -> Ulid { self.0.id }

    pub fn namespace(&self) -> &Namespace { &self.0.ns }

    pub fn spec(&self) -> &Document { &self.0.spec }

    /// Snapshot of the current result set.
    pub fn results(&self) -> Vec<Document> { self.0.result_set.lock().unwrap().values().cloned().collect() }

    /// Identifiers currently tracked as matching.
    pub fn tracked_ids(&self) -> Vec<DocId> { self.0.result_set.lock().unwrap().keys().cloned().collect() }

    /// Re-seed the result set from a driver snapshot.
    ///
    /// With `emit` set, ids that dropped out since the last snapshot produce
    /// `Removed` events and every document in the new snapshot produces an
    /// `Added` event, all with `ts: None` to mark the snapshot origin. With
    /// `emit` unset the result set is replaced silently.
    pub async fn refresh(&self, emit: bool) -> Result<Vec<Change>, EngineError> {
        let snapshot = self.0.driver.find(&self.0.ns, &self.0.spec).await?;
        let mut results = HashMap::with_capacity(snapshot.len());
        for doc in snapshot {
            if let Some(id) = doc.get("_id") {
                results.insert(DocId::from(id), doc.clone());
            }
        }
        debug!("{self:?} refreshed with {} documents", results.len());

        let old = {
            let mut result_set = self.0.result_set.lock().unwrap();
            std::mem::replace(&mut *result_set, results.clone())
        };
        let mut emitted = Vec::new();
        if emit {
            for (id, previous) in &old {
                if !results.contains_key(id) {
                    emitted.push(self.emit(ChangeKind::Removed, None, Changed::Document(previous.clone())));
                }
            }
            for doc in results.into_values() {
                emitted.push(self.emit(ChangeKind::Added, None, Changed::Document(doc)));
            }
        }
        Ok(emitted)
    }

    /// Apply one journal entry. The engine guarantees `entry.ns` matches
    /// this query's namespace and that `u` entries carry their fetched
    /// post-image when the document still exists.
    ///
    /// Returns [`Effect::RestartCursor`] when the tracked id set changed,
    /// which invalidates id-restricted server filter branches.
    pub fn handle(&self, entry: &JournalEntry) -> Result<Effect, EngineError> {
        debug_assert_eq!(entry.ns, self.0.ns);
        match entry.op {
            OpKind::Insert => {
                if moql::matches(&self.0.spec, &entry.o)? {
                    Ok(self.add(entry.ts, entry.o.clone()))
                } else {
                    Ok(Effect::None)
                }
            }
            OpKind::Delete => {
                let Some(id) = entry.doc_id() else { return Ok(Effect::None) };
                Ok(self.discard(entry.ts, id))
            }
            OpKind::Update => {
                // A missing post-image means the document was deleted before
                // the point lookup ran; the delete entry will follow, but the
                // discard is emitted now for consistency with it.
                if let Some(obj) = &entry.obj {
                    if moql::matches(&self.0.spec, obj)? {
                        return Ok(self.add(entry.ts, obj.clone()));
                    }
                }
                let Some(id) = entry.doc_id() else { return Ok(Effect::None) };
                Ok(self.discard(entry.ts, id))
            }
        }
    }

    /// Insert or overwrite a match. Overwriting re-asserts membership: the
    /// consumer reads it as "state changed, still matching".
    fn add(&self, ts: OpTime, obj: Document) -> Effect {
        let Some(id) = obj.get("_id").map(DocId::from) else { return Effect::None };
        let known = self.0.result_set.lock().unwrap().insert(id, obj.clone()).is_some();
        self.emit(ChangeKind::Added, Some(ts), Changed::Document(obj));
        if known {
            Effect::None
        } else {
            Effect::RestartCursor
        }
    }

    /// Remove a tracked id, emitting the last-known pre-image. No-op for
    /// ids the query never held.
    fn discard(&self, ts: OpTime, id: DocId) -> Effect {
        let previous = self.0.result_set.lock().unwrap().remove(&id);
        match previous {
            Some(doc) => {
                self.emit(ChangeKind::Removed, Some(ts), Changed::Document(doc));
                Effect::RestartCursor
            }
            None => Effect::None,
        }
    }

    fn emit(&self, kind: ChangeKind, ts: Option<OpTime>, body: Changed) -> Change {
        let change = Change { kind, query: self.clone(), ts, body };
        (self.0.callback)(change.clone());
        change
    }

    /// This query's contribution to the fine-grained server-side filter.
    ///
    /// Insert traffic is narrowed by the spec's promotable equality clauses;
    /// update and delete traffic is restricted to the tracked ids. While no
    /// ids are tracked only the insert branch is installed, unless the spec
    /// pins a scalar `_id`, which bounds the update branch up front.
    pub fn filter_branches(&self) -> Vec<Document> {
        let ns = self.0.ns.to_string();
        let mut branches = vec![filter::insert_branch(&ns, Some(&self.0.spec))];
        let ids: Vec<bson::Bson> = self.0.result_set.lock().unwrap().keys().map(|id| id.value().clone()).collect();
        if !ids.is_empty() {
            branches.push(filter::id_branch("u", "o2._id", &ns, Some(ids.iter())));
            branches.push(filter::id_branch("d", "o._id", &ns, Some(ids.iter())));
        } else if let Some(pinned) = self.0.spec_by_id.as_ref().and_then(|by_id| by_id.get("_id")) {
            if filter::is_scalar(pinned) {
                let mut branch = doc! { "op": "u", "ns": &ns };
                branch.insert("o2._id", pinned.clone());
                branches.push(branch);
            }
        }
        branches
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LiveQuery {{ ns: {}, spec: {} }}", self.0.ns, self.0.spec)
    }
}

fn log_change(change: Change) {
    info!("CHANGE {:?} {}: {:?}", change.kind, change.query.namespace(), change.body);
}
