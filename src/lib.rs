//! # Identity Reconciler
//!
//! Consolidates customer identities spread across fragmented contact records.
//! Contacts that share an email or phone number belong to the same identity;
//! each identity has one primary contact (the oldest) and any number of
//! secondary contacts linked directly to it.
//!
//! ## Core Concepts
//!
//! - **Contact**: A stored email/phone record, primary or secondary
//! - **IdentityResolver**: Matches a request, merges groups, appends novel data
//! - **ConsolidatedIdentity**: The view returned to callers
//! - **ContactStore**: Transactional storage, in-memory or persistent
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use identity_reconciler::{IdentifyRequest, IdentityResolver};
//! use identity_reconciler::storage::InMemoryContactStore;
//!
//! let resolver = IdentityResolver::new(Arc::new(InMemoryContactStore::new()));
//!
//! resolver.resolve(&IdentifyRequest::default()
//!     .with_email("lorraine@hillvalley.edu")
//!     .with_phone_number("123456"))?;
//! let identity = resolver.resolve(&IdentifyRequest::default()
//!     .with_email("mcfly@hillvalley.edu")
//!     .with_phone_number("123456"))?;
//!
//! assert_eq!(identity.primary_contact_id.get(), 1);
//! assert_eq!(identity.emails, ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]);
//! # Ok::<(), identity_reconciler::IdentityError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod contact;
pub mod error;
pub mod identity;
pub mod request;

// Resolution and storage
pub mod resolver;
pub mod storage;

// Service plumbing
pub mod config;
pub mod runtime;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use config::{ConfigError, ServiceConfig};
pub use contact::{Contact, ContactId, LinkPrecedence, NewContact};
pub use error::{ExecutionError, IdentityError, IdentityResult, ValidationError};
pub use identity::{ConsolidatedIdentity, ErrorResponse, IdentifyResponse};
pub use request::{ContactQuery, IdentifyRequest, InputPolicy};
pub use resolver::{IdentityResolver, Resolution};
pub use runtime::{ResolutionHandle, ResolverRuntime, RuntimeConfig};
pub use storage::{ContactStore, ContactTransaction, InMemoryContactStore, StorageError};
