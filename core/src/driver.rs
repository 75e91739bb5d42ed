use async_trait::async_trait;
use bson::Document;

use crate::error::DriverError;
use crate::types::{Namespace, OpTime};

/// How the journal cursor behaves once it is caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorMode {
    /// Return end-of-stream when caught up; the engine sleeps and reopens.
    #[default]
    Tailable,
    /// Block server-side until new entries arrive.
    TailableAwait,
}

/// The database surface the engine consumes.
///
/// Implementations wrap a real driver (the journal is the replica set's
/// `local.oplog.rs`) or an in-process store for tests. All methods take
/// plain BSON specs in the server's find-query dialect.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Timestamp of the newest journal entry, `None` for an empty journal.
    async fn latest_timestamp(&self) -> Result<Option<OpTime>, DriverError>;

    /// Timestamp of the oldest journal entry still retained, `None` for an
    /// empty journal. Backs the watermark-lost check after a rollover.
    async fn earliest_timestamp(&self) -> Result<Option<OpTime>, DriverError>;

    /// Open a tailable cursor over the journal in natural order, restricted
    /// to entries matching `filter`.
    async fn tail_journal(&self, filter: &Document, mode: CursorMode) -> Result<Box<dyn JournalCursor>, DriverError>;

    /// Snapshot read of all documents in `ns` matching `spec`.
    async fn find(&self, ns: &Namespace, spec: &Document) -> Result<Vec<Document>, DriverError>;

    /// Point lookup of one document in `ns` matching `spec`.
    async fn find_one(&self, ns: &Namespace, spec: &Document) -> Result<Option<Document>, DriverError>;
}

/// A live cursor over the journal. Dropping the cursor closes it; a read
/// blocked in [`CursorMode::TailableAwait`] is woken by the drop.
#[async_trait]
pub trait JournalCursor: Send {
    /// Next raw entry, or `None` when the stream ends: caught up in
    /// [`CursorMode::Tailable`], cursor death in either mode.
    async fn next(&mut self) -> Result<Option<Document>, DriverError>;
}
