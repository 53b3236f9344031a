//! Offline-first synchronization core for point-of-sale clients.
//!
//! Every read and write goes to a local SQLite store first; mutations are
//! appended to a durable queue and a background synchronizer pushes them to
//! the remote store in per-kind batches whenever connectivity allows. The
//! pieces:
//!
//! - [`registry`] — the catalog of entity kinds (shape and hydration policy)
//! - [`db`] — SQLite store: migrations, per-kind record tables, queue tables
//! - [`queue`] — optimistic local write plus queue append, retry bookkeeping
//! - [`sync`] — the background synchronizer and its status observable
//! - [`hydrate`] — first-use seeding of local tables from the remote store
//! - [`dispatch`] — the transactional sale dispatch / stock state machine
//! - [`remote`] / [`api`] — the transport trait and its HTTP implementation

pub mod api;
pub mod db;
pub mod dispatch;
pub mod hydrate;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod status;
pub mod sync;

#[cfg(test)]
mod testutil;

pub use api::HttpRemote;
pub use db::DbState;
pub use dispatch::{DispatchError, DispatchStatus, Sale, SaleItem};
pub use hydrate::{HydrationOutcome, Hydrator};
pub use registry::{HydrationPolicy, KindRegistry, KindShape, KindSpec};
pub use remote::{BatchOp, BatchResponse, DispatchItem, Operation, RemoteStore};
pub use status::SyncStatus;
pub use sync::{SyncOptions, Synchronizer};

/// Install the global tracing subscriber. Honors `RUST_LOG` when set;
/// otherwise logs the crate at debug and everything else at info.
/// Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tillsync=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
