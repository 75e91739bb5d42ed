use bson::{Bson, Document};

use crate::livequery::LiveQuery;
use crate::types::{DocId, OpTime};

/// Whether a document entered or left a query's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Payload of a change: the document when one is known, otherwise the bare
/// identifier (removals of documents the query never held).
#[derive(Debug, Clone)]
pub enum Changed {
    Document(Document),
    Id(Bson),
}

impl Changed {
    pub fn document(&self) -> Option<&Document> {
        match self {
            Changed::Document(doc) => Some(doc),
            Changed::Id(_) => None,
        }
    }

    pub fn id(&self) -> Option<DocId> {
        match self {
            Changed::Document(doc) => doc.get("_id").map(DocId::from),
            Changed::Id(id) => Some(DocId::from(id)),
        }
    }
}

/// A membership change emitted by a [`LiveQuery`].
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    /// Handle of the query the change belongs to.
    pub query: LiveQuery,
    /// Journal timestamp, or `None` when the change originates from a
    /// snapshot refresh rather than a journal entry.
    pub ts: Option<OpTime>,
    pub body: Changed,
}
