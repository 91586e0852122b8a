//! # Storage Traits
//!
//! Narrow interfaces to the collaborators the linking flow hands data to.
//! The domain services only see these traits, so the file-backed
//! implementations in [`super::csv`] can be swapped for remote services.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::models::{AuditEvent, Child, RosterRecord};
use crate::domain::qr_credential::QrCredential;

/// Persistence for linked children
#[async_trait]
pub trait ChildStorage: Send + Sync {
    /// Store a newly linked child
    async fn store_child(&self, child: &Child) -> Result<()>;

    /// Retrieve a specific child by ID
    async fn get_child(&self, child_id: &str) -> Result<Option<Child>>;

    /// List all children ordered by name
    async fn list_children(&self) -> Result<Vec<Child>>;
}

/// Persistence for QR credentials, one per child
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Store a credential, replacing any previous one for the same child
    async fn store_credential(&self, credential: &QrCredential) -> Result<()>;

    async fn get_credential(&self, child_id: &str) -> Result<Option<QrCredential>>;
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;

    /// Most recent events first
    async fn recent_events(&self, limit: Option<u32>) -> Result<Vec<AuditEvent>>;
}

/// School roster directory used to resolve linking codes
#[async_trait]
pub trait RosterLookup: Send + Sync {
    /// Find the roster record for a code (trimmed, case-insensitive)
    async fn find_by_code(&self, code: &str) -> Result<Option<RosterRecord>>;
}
