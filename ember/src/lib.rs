//! Ember: an embedded, local-first document database core.
//!
//! Documents are written through a [`Crdt`] into a transactional [`Blockstore`]. Commits
//! are packed into CAR files by the [`Loader`](loader::Loader), encrypted unless the
//! database is public, persisted through a [`Gateway`](gateway::Gateway) and queued for
//! upload to an optional remote replica. Replicas merge each other's commits through a
//! merkle clock, and secondary indexes follow the document changes.
//!
//! ```no_run
//! # async fn run() -> ember::Result<()> {
//! use ember::{config::DatabaseOptions, crdt::DocUpdate, Crdt};
//! use serde_json::json;
//!
//! let db = Crdt::open(DatabaseOptions::memory("todos")?).await?;
//! db.bulk(vec![DocUpdate::put("first", json!({"title": "write docs"}))])
//!     .await?;
//! assert!(db.get("first").await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod blockstore;
pub mod car;
pub mod clock;
pub mod config;
pub mod crdt;
pub mod crypto;
mod error;
pub mod gateway;
pub mod indexer;
pub mod loader;
pub mod store;
pub mod types;
pub mod wal;

pub use crate::blockstore::Blockstore;
pub use crate::config::Config;
pub use crate::crdt::Crdt;
pub use crate::error::{Error, Result};
