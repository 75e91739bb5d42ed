use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bson::{doc, Document};
use opwatch::{DriverError, JournalCursor};

use common::*;

fn test_ns() -> Namespace { Namespace::new("test", "test") }

/// Wraps the memory driver to count cursor opens.
struct CountingDriver {
    inner: MemoryDb,
    opens: AtomicUsize,
}

#[async_trait::async_trait]
impl Driver for CountingDriver {
    async fn latest_timestamp(&self) -> Result<Option<OpTime>, DriverError> { self.inner.latest_timestamp().await }

    async fn earliest_timestamp(&self) -> Result<Option<OpTime>, DriverError> { self.inner.earliest_timestamp().await }

    async fn tail_journal(&self, filter: &Document, mode: CursorMode) -> Result<Box<dyn JournalCursor>, DriverError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.tail_journal(filter, mode).await
    }

    async fn find(&self, ns: &Namespace, spec: &Document) -> Result<Vec<Document>, DriverError> {
        self.inner.find(ns, spec).await
    }

    async fn find_one(&self, ns: &Namespace, spec: &Document) -> Result<Option<Document>, DriverError> {
        self.inner.find_one(ns, spec).await
    }
}

/// Every insert of a new match invalidates the id-restricted branches and
/// forces a cursor restart; none of the restarts may drop or redeliver an
/// entry.
#[tokio::test]
async fn restarts_neither_lose_nor_duplicate() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver.clone(), EngineOptions::default()).await?;
    let (watcher, callback) = change_watcher();
    let lq = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(callback));
    engine.register(&lq).await?;

    let run = spawn_engine(&engine);
    for i in 0..20 {
        db.insert(&test_ns(), doc! { "_id": i, "foo": 1 });
    }

    let events = watcher.take(20).await?;
    assert_eq!(sorted_ids(&events), (0..20).collect::<Vec<_>>());
    assert!(events.iter().all(|change| change.kind == ChangeKind::Added));
    assert!(watcher.quiesce_drain().await.is_empty());

    // watermark advanced to the last dispatched entry
    let latest = db.latest_timestamp().await?.expect("journal is non-empty");
    assert_eq!(engine.watermark(), latest);

    engine.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn rolled_journal_surfaces_watermark_loss() -> anyhow::Result<()> {
    let db = MemoryDb::with_capacity(4);
    db.insert(&test_ns(), doc! { "_id": 0, "foo": 1 });

    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver.clone(), EngineOptions::default()).await?;
    let (_watcher, callback) = change_watcher();
    let lq = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(callback));
    engine.register(&lq).await?;

    // roll the capped journal well past the engine's watermark
    for i in 1..10 {
        db.insert(&test_ns(), doc! { "_id": i, "foo": 1 });
    }

    match engine.run_once().await {
        Err(EngineError::WatermarkLost { watermark, earliest }) => assert!(earliest > watermark),
        other => panic!("expected watermark loss, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn empty_registry_is_an_error() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let engine = OplogEngine::new(Arc::new(db), EngineOptions::default()).await?;
    assert!(matches!(engine.run_once().await, Err(EngineError::NothingToWatch)));
    Ok(())
}

#[tokio::test]
async fn deregistered_queries_stop_receiving() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver.clone(), EngineOptions::default()).await?;

    let (first_seen, first_callback) = change_watcher();
    let (second_seen, second_callback) = change_watcher();
    let first = LiveQuery::new(driver.clone(), test_ns(), doc! { "foo": 1 }, Some(first_callback));
    let second = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(second_callback));
    engine.register(&first).await?;
    engine.register(&second).await?;

    let run = spawn_engine(&engine);
    db.insert(&test_ns(), doc! { "_id": 0, "foo": 1 });
    first_seen.take(1).await?;
    second_seen.take(1).await?;

    engine.deregister(&first);
    db.insert(&test_ns(), doc! { "_id": 1, "foo": 1 });
    second_seen.take(1).await?;
    assert!(first_seen.quiesce_drain().await.is_empty());

    engine.shutdown();
    run.await??;
    Ok(())
}

async fn cursor_opens_for(filter: FilterStrategy) -> anyhow::Result<usize> {
    let db = MemoryDb::new();
    let counting = Arc::new(CountingDriver { inner: db.clone(), opens: AtomicUsize::new(0) });
    let engine = OplogEngine::new(counting.clone(), EngineOptions { filter, ..Default::default() }).await?;
    let (watcher, callback) = change_watcher();
    let lq = LiveQuery::new(counting.clone(), test_ns(), doc! { "foo": 1 }, Some(callback));
    engine.register(&lq).await?;

    for i in 0..10 {
        db.insert(&test_ns(), doc! { "_id": i, "foo": 1 });
    }
    engine.run_once().await?;
    assert_eq!(sorted_ids(&watcher.drain()), (0..10).collect::<Vec<_>>());
    Ok(counting.opens.load(Ordering::SeqCst))
}

/// A fine filter names the tracked ids, so every new match reopens the
/// cursor; a coarse filter stays valid across id churn and reopens only on
/// registry changes.
#[tokio::test]
async fn coarse_strategy_does_not_restart_on_id_churn() -> anyhow::Result<()> {
    let fine = cursor_opens_for(FilterStrategy::Fine).await?;
    let coarse = cursor_opens_for(FilterStrategy::Coarse).await?;
    assert!(fine > 10, "expected one reopen per new id under the fine strategy, saw {fine} opens");
    assert!(coarse <= 2, "expected no id-churn reopens under the coarse strategy, saw {coarse} opens");
    Ok(())
}

#[tokio::test]
async fn burst_on_a_fresh_journal_cannot_skip_entries() -> anyhow::Result<()> {
    let db = MemoryDb::with_capacity(4);
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver.clone(), EngineOptions::default()).await?;
    let (_watcher, callback) = change_watcher();
    let lq = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(callback));
    engine.register(&lq).await?;

    // the burst rolls the capped journal before the engine's first poll
    for i in 0..10 {
        db.insert(&test_ns(), doc! { "_id": i, "foo": 1 });
    }
    assert!(matches!(engine.run_once().await, Err(EngineError::WatermarkLost { .. })));
    Ok(())
}

/// The id-restricted fine-grained filter cannot see an update that moves an
/// unmatched document into the predicate; the coarse strategy does.
#[tokio::test]
async fn coarse_strategy_catches_newly_matching_updates() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    db.insert(&test_ns(), doc! { "_id": 1, "foo": 2 });

    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let options = EngineOptions { filter: FilterStrategy::Coarse, ..Default::default() };
    let engine = OplogEngine::new(driver.clone(), options).await?;
    let (watcher, callback) = change_watcher();
    let lq = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(callback));
    let snapshot = engine.register(&lq).await?;
    assert!(snapshot.is_empty());

    let run = spawn_engine(&engine);
    db.update_one(&test_ns(), &doc! { "_id": 1 }, &doc! { "$set": { "foo": 1 } })?;

    let events = watcher.take(1).await?;
    assert_eq!(events[0].kind, ChangeKind::Added);
    assert_eq!(sorted_ids(&events), vec![1]);

    engine.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn await_mode_streams_without_polling() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let options = EngineOptions { mode: CursorMode::TailableAwait, ..Default::default() };
    let engine = OplogEngine::new(driver.clone(), options).await?;
    let (watcher, callback) = change_watcher();
    let lq = LiveQuery::new(driver, test_ns(), doc! { "foo": 1 }, Some(callback));
    engine.register(&lq).await?;

    let run = spawn_engine(&engine);
    db.insert(&test_ns(), doc! { "_id": 0, "foo": 1 });
    let events = watcher.take(1).await?;
    assert_eq!(sorted_ids(&events), vec![0]);

    // shutdown must wake the blocked cursor read
    engine.shutdown();
    run.await??;
    Ok(())
}
