//! opwatch — live queries over a MongoDB replica-set oplog.
//!
//! Register a [`LiveQuery`] with an [`OplogEngine`] and receive `Added` /
//! `Removed` events whenever the set of documents matching the query's
//! predicate changes, starting from an initial snapshot:
//!
//! ```no_run
//! # async fn example(driver: std::sync::Arc<dyn opwatch::Driver>) -> Result<(), opwatch::EngineError> {
//! use bson::doc;
//! use opwatch::{EngineOptions, LiveQuery, Namespace, OplogEngine};
//!
//! let engine = OplogEngine::new(driver.clone(), EngineOptions::default()).await?;
//! let query = LiveQuery::new(
//!     driver,
//!     Namespace::new("test", "test"),
//!     doc! { "foo": 1 },
//!     Some(Box::new(|change| println!("{:?} {:?}", change.kind, change.body))),
//! );
//! engine.register(&query).await?; // snapshot arrives through the callback
//! engine.run(std::time::Duration::from_secs(1)).await // tail forever
//! # }
//! ```

pub use opwatch_core::{
    changes, driver, engine, error, journal, livequery, types, watch, Callback, Change, ChangeKind, Changed, CursorMode,
    DocId, Driver, DriverError, Effect, EngineError, EngineOptions, EntryCallback, FilterStrategy, JournalCursor,
    JournalEntry, LiveQuery, Namespace, OpKind, OpTime, OplogEngine, Watch, WatchKind,
};

pub use moql;

#[cfg(feature = "memory")]
pub use opwatch_storage_memory as memory;
