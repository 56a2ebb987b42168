//! Contact storage.
//!
//! The traits define the abstract interface; `memory` is always available and
//! `persistent` (feature `persistent`) adds a durable WAL-backed store.

mod index;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryContactStore;
pub use traits::{ContactStore, ContactTransaction, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, CompactionResult, PersistentConfig, PersistentContactStore};
