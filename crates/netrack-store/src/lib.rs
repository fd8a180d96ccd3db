//! netrack Request Store
//!
//! Durable, cross-process log of intercepted requests.
//!
//! # Architecture
//!
//! ```text
//!  interceptor process                       viewer process
//! ┌───────────────────────┐               ┌───────────────────────┐
//! │ providers ──append──▶ │               │ fetch_all / delete    │
//! │        writer thread  │               │        writer thread  │
//! │             │         │               │             │         │
//! └─────────────│─────────┘               └─────────────│─────────┘
//!               ▼                                       ▼
//!        ┌───────────────────────────────────────────────────┐
//!        │   <group dir>/NetworkTracker.sqlite  (WAL mode)   │
//!        └───────────────────────────────────────────────────┘
//!                               │ data_version
//!                               ▼
//!                  ChangeWatcher ──▶ ChangeNotifier ──▶ Subscription
//! ```
//!
//! - All mutations of one process go through a single writer thread
//! - SQLite's file lock serializes writers across processes
//! - Every successful commit publishes a `StoreChanged` signal

mod notifier;
mod record;
mod store;
mod watcher;
mod writer;

pub use notifier::{ChangeNotifier, StoreChanged, Subscription};
pub use record::{RecordId, RequestRecord, NO_LINK, NO_QUERY};
pub use store::{RequestStore, StoreConfig, StoreError, DEFAULT_DB_FILE};
pub use watcher::ChangeWatcher;
