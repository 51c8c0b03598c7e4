//! signalgrid-state: embedded intersection state store for SignalGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for intersection configs, signal states and evaluation leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by intersection id. The scheduling core reaches the store only
//! through the [`SignalStore`] and [`LeaseStore`] traits:
//!
//! ```text
//! SignalStore::read(id)                       → SignalState (version = CAS token)
//! SignalStore::compare_and_swap(id, v, next)  → bool
//! LeaseStore::try_acquire(id, holder, ttl)    → bool (never blocks)
//! LeaseStore::release(id, holder)             → idempotent
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod access;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use access::{LeaseStore, SignalStore};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
