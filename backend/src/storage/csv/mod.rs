//! # File-backed storage
//!
//! Local implementations of the storage traits: YAML documents per child,
//! CSV files for the roster and the audit log.

pub mod audit_log_repository;
pub mod child_repository;
pub mod connection;
pub mod credential_repository;
pub mod roster_repository;

#[cfg(test)]
pub mod test_utils;

pub use audit_log_repository::CsvAuditLog;
pub use child_repository::ChildRepository;
pub use connection::CsvConnection;
pub use credential_repository::CredentialRepository;
pub use roster_repository::CsvRosterDirectory;
