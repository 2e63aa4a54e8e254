//! # Consent Store
//!
//! Storage abstraction for the consent ledger. Provides a trait-based interface
//! for catalog, enrollment, grant, version and audit persistence with SQLite
//! and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`InsertResult`] - Result of an insert-only write
//! - [`AppendResult`] - Result of a conditional audit append
//! - [`RowWrite`] / [`CommitResult`] - A state change committed with its
//!   audit entry
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consent_store::{SqliteStore, Store};
//! use consent_core::builtin_catalog;
//!
//! async fn example() {
//!     let store = SqliteStore::open("consent.db").unwrap();
//!     for template in builtin_catalog() {
//!         store.insert_template(&template).await.unwrap();
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Insert-only history**: `consent_versions` and `audit_entries` reject
//!   UPDATE and DELETE at the database level
//! - **Audited writes**: a row change and its audit entry share one
//!   transaction, so neither is ever visible without the other
//! - **Version slots**: `UNIQUE(enrollment_id, version)` turns a racing save
//!   into `CommitResult::SlotTaken`
//! - **Conditional appends**: the chain tail is re-read inside the write
//!   transaction, so two writers can never fork a study's chain

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AppendResult, CommitResult, InsertResult, RowWrite, Store, StoreExt};
