use std::sync::Arc;

use bson::doc;
use opwatch::OpKind;

use common::*;

fn test_ns() -> Namespace { Namespace::new("test", "test") }

fn six_docs() -> Vec<bson::Document> { (0..6).map(|i| doc! { "_id": i, "foo": if i < 3 { 1 } else { 2 } }).collect() }

#[tokio::test]
async fn double_watch_without_insert_checking() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver, EngineOptions::default()).await?;

    let (query_seen, query_callback) = entry_watcher();
    let (insert_seen, insert_callback) = entry_watcher();
    let _query = engine.watch_query(test_ns(), doc! { "foo": 1 }, false, query_callback).await?;
    let _inserts = engine.watch_inserts(test_ns(), Some(doc! { "foo": 2 }), insert_callback);

    let run = spawn_engine(&engine);
    db.insert_many(&test_ns(), six_docs());

    // six inserts split between the two watches
    let from_query = query_seen.take(3).await?;
    assert_eq!(sorted_entry_ids(&from_query), vec![0, 1, 2]);
    assert!(from_query.iter().all(|entry| entry.op == OpKind::Insert));
    let from_inserts = insert_seen.take(3).await?;
    assert_eq!(sorted_entry_ids(&from_inserts), vec![3, 4, 5]);

    // without insert checking the query watch tracked every id on the
    // namespace, so all six updates come back
    db.update_many(&test_ns(), &doc! {}, &doc! { "$set": { "bar": 1 } })?;
    let updates = query_seen.take(6).await?;
    assert_eq!(sorted_entry_ids(&updates), vec![0, 1, 2, 3, 4, 5]);
    assert!(updates.iter().all(|entry| entry.op == OpKind::Update));
    assert!(insert_seen.quiesce_drain().await.is_empty());

    engine.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn double_watch_with_insert_checking() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver, EngineOptions::default()).await?;

    let (query_seen, query_callback) = entry_watcher();
    let (insert_seen, insert_callback) = entry_watcher();
    let _query = engine.watch_query(test_ns(), doc! { "foo": 1 }, true, query_callback).await?;
    let _inserts = engine.watch_inserts(test_ns(), Some(doc! { "foo": 2 }), insert_callback);

    let run = spawn_engine(&engine);
    db.insert_many(&test_ns(), six_docs());

    let from_query = query_seen.take(3).await?;
    assert_eq!(sorted_entry_ids(&from_query), vec![0, 1, 2]);
    insert_seen.take(3).await?;

    // with insert checking only the matching ids are tracked, so only their
    // updates come back
    db.update_many(&test_ns(), &doc! {}, &doc! { "$set": { "bar": 1 } })?;
    let updates = query_seen.take(3).await?;
    assert_eq!(sorted_entry_ids(&updates), vec![0, 1, 2]);
    assert!(query_seen.quiesce_drain().await.is_empty());

    engine.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn query_watch_seeds_from_existing_matches() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    db.insert_many(&test_ns(), six_docs());

    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver, EngineOptions::default()).await?;
    let (query_seen, query_callback) = entry_watcher();
    let query = engine.watch_query(test_ns(), doc! { "foo": 1 }, true, query_callback).await?;
    assert_eq!(query.tracked_ids().len(), 3);

    // updates of seeded ids are delivered right away
    let run = spawn_engine(&engine);
    db.update_one(&test_ns(), &doc! { "_id": 1 }, &doc! { "$set": { "bar": 1 } })?;
    let updates = query_seen.take(1).await?;
    assert_eq!(sorted_entry_ids(&updates), vec![1]);

    // deletes untrack
    db.delete_one(&test_ns(), &doc! { "_id": 1 })?;
    query_seen.take(1).await?;
    assert_eq!(query.tracked_ids().len(), 2);

    engine.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn unwatch_stops_delivery() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    let driver: Arc<dyn Driver> = Arc::new(db.clone());
    let engine = OplogEngine::new(driver, EngineOptions::default()).await?;

    let (seen, callback) = entry_watcher();
    let (other_seen, other_callback) = entry_watcher();
    let watch = engine.watch_inserts(test_ns(), None, callback);
    let _other = engine.watch_inserts(test_ns(), None, other_callback);

    let run = spawn_engine(&engine);
    db.insert(&test_ns(), doc! { "_id": 0 });
    seen.take(1).await?;
    other_seen.take(1).await?;

    engine.unwatch(&watch);
    db.insert(&test_ns(), doc! { "_id": 1 });
    other_seen.take(1).await?;
    assert!(seen.quiesce_drain().await.is_empty());

    engine.shutdown();
    run.await??;
    Ok(())
}
