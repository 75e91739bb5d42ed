//! moql — match MongoDB-style query documents against BSON documents.
//!
//! This crate evaluates the find-query dialect client side, for cases where a
//! document is already in memory and asking the server again would be wasteful
//! or racy. The single entry point is [`matches`].
//!
//! ```
//! use bson::doc;
//!
//! let spec = doc! { "qty": { "$gte": 10 }, "status": "A" };
//! let item = doc! { "_id": 1, "status": "A", "qty": 25 };
//! assert!(moql::matches(&spec, &item).unwrap());
//! ```

pub mod error;
mod matcher;

pub use error::Error;
pub use matcher::matches;
