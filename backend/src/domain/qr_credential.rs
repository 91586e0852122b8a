//! # QR Credentials
//!
//! Each linked child has at most one QR credential. A static credential shows
//! a fixed payload; a dynamic one embeds a token that the guardian rotates.
//! Issuing a new token replaces the old one, so only one token per child is
//! ever current.
//!
//! Payload format:
//!
//! ```text
//! {scheme}://student/{child_id}?static=1
//! {scheme}://student/{child_id}?token={current_token}
//! ```
//!
//! Disabled credentials append `disabled=1`. Rejecting them is the scanner's
//! job; the manager only makes the state visible in the payload.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use shared::QrMode;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_SCHEME: &str = "eduwallet";

/// Random bytes in a generated token
const TOKEN_BYTES: usize = 12;

/// Attempts before giving up on getting a token different from the current one
const MAX_TOKEN_ATTEMPTS: usize = 4;

/// Source of dynamic QR tokens
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Tokens from the operating system's CSPRNG: `tok_` + 24 hex chars
#[derive(Debug, Clone, Copy, Default)]
pub struct OsTokenGenerator;

impl TokenGenerator for OsTokenGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("tok_{}", hex)
    }
}

/// Predictable tokens (`tok_000001`, `tok_000002`, ...) for tests and demos
#[derive(Debug, Default)]
pub struct SequenceTokenGenerator {
    counter: AtomicU64,
}

impl SequenceTokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start so that the first token is `tok_{first:06}`
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: AtomicU64::new(first.saturating_sub(1)),
        }
    }
}

impl TokenGenerator for SequenceTokenGenerator {
    fn generate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("tok_{:06}", n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotRotatableReason {
    StaticMode,
    Disabled,
}

impl fmt::Display for NotRotatableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotRotatableReason::StaticMode => write!(f, "static credentials have no token"),
            NotRotatableReason::Disabled => write!(f, "credential is disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Invalid QR configuration: {0}")]
    InvalidConfiguration(String),
    #[error("QR credential for {child_id} cannot be rotated: {reason}")]
    NotRotatable {
        child_id: String,
        reason: NotRotatableReason,
    },
    #[error("Token generator kept returning the current token")]
    TokenNotFresh,
}

/// A child's QR identity credential
#[derive(Debug, Clone, PartialEq)]
pub struct QrCredential {
    pub child_id: String,
    pub enabled: bool,
    pub mode: QrMode,
    /// Only set for dynamic credentials
    pub rotation_interval_minutes: Option<i64>,
    /// Only set for dynamic credentials
    pub current_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a scanner can read back out of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    pub child_id: String,
    pub token: Option<String>,
    pub is_static: bool,
    pub disabled: bool,
}

/// Issues, rotates and toggles QR credentials
#[derive(Clone)]
pub struct QrCredentialManager {
    generator: Arc<dyn TokenGenerator>,
    scheme: String,
}

impl QrCredentialManager {
    pub fn new(generator: Arc<dyn TokenGenerator>, scheme: impl Into<String>) -> Self {
        Self {
            generator,
            scheme: scheme.into(),
        }
    }

    /// Manager backed by the OS random generator and the default scheme
    pub fn with_os_tokens() -> Self {
        Self::new(Arc::new(OsTokenGenerator), DEFAULT_SCHEME)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Create a credential for a child.
    ///
    /// Dynamic credentials need a positive rotation interval and start with a
    /// fresh token. Static credentials ignore the interval.
    pub fn issue(
        &self,
        child_id: &str,
        mode: QrMode,
        rotation_interval_minutes: Option<i64>,
    ) -> Result<QrCredential, CredentialError> {
        let now = Utc::now();
        match mode {
            QrMode::Static => Ok(QrCredential {
                child_id: child_id.to_string(),
                enabled: true,
                mode,
                rotation_interval_minutes: None,
                current_token: None,
                issued_at: now,
                updated_at: now,
            }),
            QrMode::Dynamic => {
                let interval = match rotation_interval_minutes {
                    Some(minutes) if minutes > 0 => minutes,
                    Some(minutes) => {
                        return Err(CredentialError::InvalidConfiguration(format!(
                            "rotation interval must be positive, got {} minutes",
                            minutes
                        )))
                    }
                    None => {
                        return Err(CredentialError::InvalidConfiguration(
                            "dynamic mode requires a rotation interval".to_string(),
                        ))
                    }
                };
                Ok(QrCredential {
                    child_id: child_id.to_string(),
                    enabled: true,
                    mode,
                    rotation_interval_minutes: Some(interval),
                    current_token: Some(self.fresh_token(None)?),
                    issued_at: now,
                    updated_at: now,
                })
            }
        }
    }

    /// Replace the token of an enabled dynamic credential
    pub fn rotate(&self, credential: &QrCredential) -> Result<QrCredential, CredentialError> {
        let reason = match (credential.mode, credential.enabled) {
            (QrMode::Static, _) => Some(NotRotatableReason::StaticMode),
            (QrMode::Dynamic, false) => Some(NotRotatableReason::Disabled),
            (QrMode::Dynamic, true) => None,
        };
        if let Some(reason) = reason {
            return Err(CredentialError::NotRotatable {
                child_id: credential.child_id.clone(),
                reason,
            });
        }

        let token = self.fresh_token(credential.current_token.as_deref())?;
        Ok(QrCredential {
            current_token: Some(token),
            updated_at: Utc::now(),
            ..credential.clone()
        })
    }

    pub fn set_enabled(&self, credential: &QrCredential, enabled: bool) -> QrCredential {
        QrCredential {
            enabled,
            updated_at: Utc::now(),
            ..credential.clone()
        }
    }

    pub fn derive_payload(&self, credential: &QrCredential) -> String {
        let mut payload = format!("{}://student/{}", self.scheme, credential.child_id);
        match (credential.mode, credential.current_token.as_deref()) {
            (QrMode::Dynamic, Some(token)) => {
                payload.push_str("?token=");
                payload.push_str(token);
            }
            _ => payload.push_str("?static=1"),
        }
        if !credential.enabled {
            payload.push_str("&disabled=1");
        }
        payload
    }

    /// Read a payload produced by [`derive_payload`](Self::derive_payload)
    pub fn inspect_payload(&self, payload: &str) -> Option<PayloadInfo> {
        let prefix = format!("{}://student/", self.scheme);
        let rest = payload.strip_prefix(&prefix)?;
        let (child_id, query) = rest.split_once('?')?;
        if child_id.is_empty() {
            return None;
        }

        let mut info = PayloadInfo {
            child_id: child_id.to_string(),
            token: None,
            is_static: false,
            disabled: false,
        };
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("token", value)) if !value.is_empty() => info.token = Some(value.to_string()),
                Some(("static", "1")) => info.is_static = true,
                Some(("disabled", "1")) => info.disabled = true,
                _ => return None,
            }
        }
        if info.is_static == info.token.is_some() {
            return None;
        }
        Some(info)
    }

    fn fresh_token(&self, previous: Option<&str>) -> Result<String, CredentialError> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = self.generator.generate();
            if Some(token.as_str()) != previous {
                return Ok(token);
            }
        }
        Err(CredentialError::TokenNotFresh)
    }
}
