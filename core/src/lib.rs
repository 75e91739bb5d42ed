pub mod changes;
pub mod driver;
pub mod engine;
pub mod error;
mod filter;
pub mod journal;
pub mod livequery;
pub mod types;
pub mod watch;

pub use changes::{Change, ChangeKind, Changed};
pub use driver::{CursorMode, Driver, JournalCursor};
pub use engine::{EngineOptions, FilterStrategy, OplogEngine};
pub use error::{DriverError, EngineError};
pub use journal::{JournalEntry, OpKind};
pub use livequery::{Callback, LiveQuery};
pub use types::{DocId, Namespace, OpTime};
pub use watch::{Effect, EntryCallback, Watch, WatchKind};
