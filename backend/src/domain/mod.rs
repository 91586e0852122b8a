//! # Domain Module
//!
//! Business logic for adding a child to a guardian's wallet and for the
//! child's QR identity credential.
//!
//! ## Module Organization
//!
//! - **code_validator**: Classifies linking codes and produces their status lines
//! - **conflict_resolver**: Turns a roster-conflict choice into a resolution
//! - **linking_wizard**: The pure state machine behind the "Add a child" flow
//! - **linking_service**: Keeps live sessions and hands completed ones to storage
//! - **qr_credential**: Credential lifecycle and payload derivation
//! - **credential_service**: Persisted, audited credential operations
//! - **pseudo_qr**: Deterministic QR-like rendering of a payload
//!
//! ## Business Rules
//!
//! - Nothing is persisted until a wizard session completes
//! - A duplicate code never creates a second child
//! - A roster conflict must be resolved before Review
//! - Only an enabled dynamic credential can rotate
//! - Every state-changing operation writes one audit event after it succeeds

pub mod code_validator;
pub mod conflict_resolver;
pub mod credential_service;
pub mod linking_service;
pub mod linking_wizard;
pub mod models;
pub mod pseudo_qr;
pub mod qr_credential;

pub use credential_service::{CredentialService, CredentialServiceError, CredentialView};
pub use linking_service::{AutoIssue, EventResult, LinkingCompletion, LinkingError, LinkingService};
pub use linking_wizard::{transition, GuardNotSatisfied, LinkingSession, WizardEvent};
pub use qr_credential::{CredentialError, QrCredentialManager};
