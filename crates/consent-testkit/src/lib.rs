//! # Consent Testkit
//!
//! Testing utilities for the consent ledger.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: pinned receipt hashes, document ids and pseudonyms
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: a ready ledger with a seeded catalog and one study
//!
//! ## Golden Vectors
//!
//! ```rust
//! use consent_testkit::vectors::verify_all_vectors;
//!
//! for (name, ok) in verify_all_vectors() {
//!     assert!(ok, "{name}");
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use consent_testkit::fixtures::{ConsentFixture, OPTIONAL_A, key};
//!
//! let fx = ConsentFixture::new().await?;
//! let alice = fx.enroll("alice").await?;
//! fx.ledger.set_grant(&fx.study_id, &"alice".into(), &key(OPTIONAL_A), true).await?;
//! let v1 = fx.ledger.save_version(&alice, None).await?;
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{init_tracing, key, keys, test_config, ConsentFixture};
pub use generators::{chain_from_params, AuditParams};
pub use vectors::{document_vectors, receipt_vectors, verify_all_vectors};
