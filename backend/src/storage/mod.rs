//! # Storage Module
//!
//! Handles persistence for the linking flow. The domain layer talks to the
//! traits in [`traits`]; [`csv`] provides the file-based implementations used
//! by the server.
//!
//! ## Design Principles
//!
//! - **Repository Pattern**: Clean separation between domain and data access
//! - **Dependency Inversion**: Domain depends on storage abstractions, not implementations
//! - **Testability**: Temp-directory environments for repository tests

pub mod csv;
pub mod traits;

pub use traits::{AuditSink, ChildStorage, CredentialStorage, RosterLookup};
