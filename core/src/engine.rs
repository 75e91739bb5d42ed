use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{doc, Bson, Document};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::changes::Change;
use crate::driver::{CursorMode, Driver};
use crate::error::EngineError;
use crate::filter;
use crate::journal::{JournalEntry, OpKind};
use crate::livequery::LiveQuery;
use crate::types::{DocId, Namespace, OpTime};
use crate::watch::{Effect, EntryCallback, Watch, WatchKind};

/// Which server-side filter the engine synthesizes for its journal cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStrategy {
    /// `$or` of every registration's branches. Least journal traffic; the
    /// cursor restarts whenever a tracked id set changes. Id-restricted
    /// update branches cannot surface an update that moves a previously
    /// unmatched document into a predicate — use [`FilterStrategy::Coarse`]
    /// when that matters.
    #[default]
    Fine,
    /// Namespace-level filtering only. Noisier, but never restarts on id
    /// churn and sees every update on the registered namespaces.
    Coarse,
}

/// Engine construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub mode: CursorMode,
    pub filter: FilterStrategy,
}

/// The multiplexing tailer: one journal cursor shared by every registration.
///
/// Cheap to clone; clones share state, so the drive loop can run on one
/// task while registrations come and go from others.
#[derive(Clone)]
pub struct OplogEngine(Arc<EngineInner>);

struct EngineInner {
    driver: Arc<dyn Driver>,
    mode: CursorMode,
    strategy: FilterStrategy,
    /// Invariant: every dispatched entry had `ts > watermark` at dispatch
    /// time, and the watermark moves to the entry's `ts` after dispatch.
    watermark: Mutex<OpTime>,
    /// Earliest entry observed while the watermark is still the empty-journal
    /// sentinel. A journal that was empty at construction must keep its first
    /// observed entry retained until something is dispatched; an earliest
    /// that advances past it means entries rolled away unread.
    first_earliest: Mutex<Option<OpTime>>,
    queries: Mutex<HashMap<Namespace, Vec<LiveQuery>>>,
    watches: Mutex<HashMap<Namespace, Vec<Watch>>>,
    needs_restart: AtomicBool,
    restart: Notify,
    enabled: AtomicBool,
    shutdown: Notify,
}

impl OplogEngine {
    /// Build an engine whose watermark starts at the journal's current tail.
    /// Only changes after this point are ever dispatched; a fresh engine
    /// does not replay history.
    pub async fn new(driver: Arc<dyn Driver>, options: EngineOptions) -> Result<Self, EngineError> {
        let watermark = driver.latest_timestamp().await?.unwrap_or(OpTime::ZERO);
        debug!("engine starting at watermark {watermark}");
        Ok(Self(Arc::new(EngineInner {
            driver,
            mode: options.mode,
            strategy: options.filter,
            watermark: Mutex::new(watermark),
            first_earliest: Mutex::new(None),
            queries: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            needs_restart: AtomicBool::new(false),
            restart: Notify::new(),
            enabled: AtomicBool::new(true),
            shutdown: Notify::new(),
        })))
    }

    pub fn watermark(&self) -> OpTime { *self.0.watermark.lock().unwrap() }

    /// Register a live query: seed its result set from a snapshot, deliver
    /// the snapshot changes through its callback, and return them.
    pub async fn register(&self, lq: &LiveQuery) -> Result<Vec<Change>, EngineError> {
        {
            let mut queries = self.0.queries.lock().unwrap();
            queries.entry(lq.namespace().clone()).or_default().push(lq.clone());
        }
        self.request_restart();
        lq.refresh(true).await
    }

    /// Remove a live query. No final events are emitted.
    pub fn deregister(&self, lq: &LiveQuery) {
        let mut queries = self.0.queries.lock().unwrap();
        if let Some(bucket) = queries.get_mut(lq.namespace()) {
            bucket.retain(|registered| registered.id() != lq.id());
            if bucket.is_empty() {
                queries.remove(lq.namespace());
            }
        }
        drop(queries);
        self.request_restart();
    }

    /// Watch raw insert entries on a namespace, optionally narrowed by a
    /// query spec evaluated against the inserted document.
    pub fn watch_inserts(&self, ns: Namespace, spec: Option<Document>, callback: EntryCallback) -> Watch {
        self.add_watch(Watch::new(ns, WatchKind::Inserts { spec }, callback))
    }

    /// Watch raw update entries, optionally restricted to an id list.
    pub fn watch_updates(&self, ns: Namespace, ids: Option<HashSet<DocId>>, callback: EntryCallback) -> Watch {
        self.add_watch(Watch::new(ns, WatchKind::Updates { ids }, callback))
    }

    /// Watch raw delete entries, optionally restricted to an id list.
    pub fn watch_deletes(&self, ns: Namespace, ids: Option<HashSet<DocId>>, callback: EntryCallback) -> Watch {
        self.add_watch(Watch::new(ns, WatchKind::Deletes { ids }, callback))
    }

    /// Stateful raw watch: inserts matching `spec`, plus updates and deletes
    /// of the ids seen so far, seeded from a snapshot of current matches.
    pub async fn watch_query(
        &self,
        ns: Namespace,
        spec: Document,
        check_inserts: bool,
        callback: EntryCallback,
    ) -> Result<Watch, EngineError> {
        let seed = self.0.driver.find(&ns, &spec).await?;
        let ids: HashSet<DocId> = seed.iter().filter_map(|doc| doc.get("_id").map(DocId::from)).collect();
        Ok(self.add_watch(Watch::new(ns, WatchKind::Query { spec, check_inserts, ids: Mutex::new(ids) }, callback)))
    }

    fn add_watch(&self, watch: Watch) -> Watch {
        self.0.watches.lock().unwrap().entry(watch.namespace().clone()).or_default().push(watch.clone());
        self.request_restart();
        watch
    }

    /// Remove a raw watch.
    pub fn unwatch(&self, watch: &Watch) {
        let mut watches = self.0.watches.lock().unwrap();
        if let Some(bucket) = watches.get_mut(watch.namespace()) {
            bucket.retain(|registered| registered.id() != watch.id());
            if bucket.is_empty() {
                watches.remove(watch.namespace());
            }
        }
        drop(watches);
        self.request_restart();
    }

    /// Stop the drive loop. A blocked cursor read is abandoned (dropping the
    /// cursor closes it); the loop exits between entries.
    pub fn shutdown(&self) {
        self.0.enabled.store(false, Ordering::SeqCst);
        self.0.shutdown.notify_waiters();
    }

    fn request_restart(&self) {
        self.0.needs_restart.store(true, Ordering::SeqCst);
        // notify_one leaves a permit behind, so a loop not currently blocked
        // on the cursor still observes the restart
        self.0.restart.notify_one();
    }

    /// Drive the cursor until the engine is caught up with the journal.
    ///
    /// Reopens the cursor whenever a registration change or id-set churn
    /// invalidates the server-side filter. Returns once end-of-stream is
    /// reached with no restart pending (in [`CursorMode::Tailable`]), after
    /// cursor death (either mode), or immediately after
    /// [`shutdown`](Self::shutdown).
    pub async fn run_once(&self) -> Result<(), EngineError> {
        'reopen: loop {
            if !self.0.enabled.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.check_watermark().await?;
            let spec = self.synthesize_filter()?;
            self.0.needs_restart.store(false, Ordering::SeqCst);
            let mut cursor = self.0.driver.tail_journal(&spec, self.0.mode).await?;
            loop {
                if !self.0.enabled.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let raw = tokio::select! {
                    raw = cursor.next() => raw?,
                    _ = self.0.shutdown.notified() => return Ok(()),
                    _ = self.0.restart.notified() => continue 'reopen,
                };
                let Some(raw) = raw else {
                    // End of stream: caught up, or the server killed the
                    // cursor. The next reopen resumes from the watermark.
                    if self.0.needs_restart.load(Ordering::SeqCst) {
                        continue 'reopen;
                    }
                    return Ok(());
                };
                let effect = self.dispatch(raw).await?;
                if effect == Effect::RestartCursor || self.0.needs_restart.load(Ordering::SeqCst) {
                    self.0.needs_restart.store(true, Ordering::SeqCst);
                    continue 'reopen;
                }
            }
        }
    }

    /// Blocking drive loop: [`run_once`](Self::run_once), sleep, repeat,
    /// until [`shutdown`](Self::shutdown). In [`CursorMode::TailableAwait`]
    /// the cursor blocks server-side instead of the engine sleeping.
    pub async fn run(&self, polling_interval: Duration) -> Result<(), EngineError> {
        while self.0.enabled.load(Ordering::SeqCst) {
            self.run_once().await?;
            if !self.0.enabled.load(Ordering::SeqCst) {
                break;
            }
            if self.0.mode == CursorMode::Tailable {
                tokio::select! {
                    _ = tokio::time::sleep(polling_interval) => {}
                    _ = self.0.shutdown.notified() => {}
                }
            }
        }
        info!("engine stopped");
        Ok(())
    }

    /// Fail when the journal has rolled past the watermark: entries between
    /// them are gone and resuming would silently skip changes.
    async fn check_watermark(&self) -> Result<(), EngineError> {
        let watermark = self.watermark();
        let Some(earliest) = self.0.driver.earliest_timestamp().await? else {
            return Ok(());
        };
        if watermark == OpTime::ZERO {
            // Nothing dispatched yet from a journal that was empty at
            // construction. Everything in it was written after the engine
            // started and is owed to the caller, so its first observed
            // entry has to stay retained until the watermark moves.
            let mut first = self.0.first_earliest.lock().unwrap();
            return match *first {
                None => {
                    *first = Some(earliest);
                    Ok(())
                }
                Some(floor) if earliest <= floor => Ok(()),
                Some(_) => Err(EngineError::WatermarkLost { watermark, earliest }),
            };
        }
        if earliest > watermark {
            return Err(EngineError::WatermarkLost { watermark, earliest });
        }
        Ok(())
    }

    fn synthesize_filter(&self) -> Result<Document, EngineError> {
        let queries = self.0.queries.lock().unwrap();
        let watches = self.0.watches.lock().unwrap();
        if queries.is_empty() && watches.is_empty() {
            return Err(EngineError::NothingToWatch);
        }
        let watermark = self.watermark();
        let spec = match self.0.strategy {
            FilterStrategy::Coarse => {
                let namespaces: HashSet<&Namespace> = queries.keys().chain(watches.keys()).collect();
                let namespaces: Vec<Bson> = namespaces.into_iter().map(|ns| Bson::String(ns.to_string())).collect();
                filter::combine(vec![doc! { "ns": { "$in": namespaces } }], watermark)
            }
            FilterStrategy::Fine => {
                let mut branches = Vec::new();
                for lq in queries.values().flatten() {
                    branches.extend(lq.filter_branches());
                }
                for watch in watches.values().flatten() {
                    branches.extend(watch.filter_branches());
                }
                filter::combine(branches, watermark)
            }
        };
        debug!("tailing journal with {spec}");
        Ok(spec)
    }

    async fn dispatch(&self, raw: Document) -> Result<Effect, EngineError> {
        let Some(ts) = JournalEntry::read_ts(&raw) else {
            warn!("skipping journal entry without ts: {raw}");
            return Ok(Effect::None);
        };
        if JournalEntry::read_op(&raw).is_none() {
            // commands and no-ops advance the watermark without dispatch
            self.advance(ts);
            return Ok(Effect::None);
        }
        let mut entry = match JournalEntry::parse(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping malformed journal entry at {ts}: {err}");
                self.advance(ts);
                return Ok(Effect::None);
            }
        };

        let queries = self.0.queries.lock().unwrap().get(&entry.ns).cloned().unwrap_or_default();
        let watches = self.0.watches.lock().unwrap().get(&entry.ns).cloned().unwrap_or_default();
        if queries.is_empty() && watches.is_empty() {
            self.advance(ts);
            return Ok(Effect::None);
        }

        if entry.op == OpKind::Update {
            if let Some(key) = entry.o2.clone() {
                // The journal carries only the update delta; resolve the
                // post-image by point lookup. The fetched document may be
                // newer than this entry (observation-time state).
                entry.obj = self.0.driver.find_one(&entry.ns, &key).await?;
                if entry.obj.is_none() {
                    debug!("post-image gone for update at {ts}; treating as non-match");
                }
            }
        }

        let mut effect = Effect::None;
        for lq in &queries {
            effect = effect.combine(lq.handle(&entry)?);
        }
        for watch in &watches {
            effect = effect.combine(watch.observe(&entry)?);
        }
        self.advance(entry.ts);
        // id churn only invalidates the fine filter's id-restricted
        // branches; a coarse filter stays valid across it, so restarts
        // there come from registry changes alone
        if self.0.strategy == FilterStrategy::Coarse {
            return Ok(Effect::None);
        }
        Ok(effect)
    }

    fn advance(&self, ts: OpTime) {
        let mut watermark = self.0.watermark.lock().unwrap();
        if ts > *watermark {
            *watermark = ts;
        }
    }
}

impl std::fmt::Debug for OplogEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queries: usize = self.0.queries.lock().unwrap().values().map(Vec::len).sum();
        let watches: usize = self.0.watches.lock().unwrap().values().map(Vec::len).sum();
        write!(f, "OplogEngine {{ watermark: {}, queries: {}, watches: {} }}", self.watermark(), queries, watches)
    }
}
