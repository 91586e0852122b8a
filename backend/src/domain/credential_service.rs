use anyhow::Result;
use log::{info, warn};
use shared::{AuditAction, CredentialAction, QrMode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::{ActorContext, AuditEvent};
use super::pseudo_qr::{self, PseudoQr};
use super::qr_credential::{QrCredential, QrCredentialManager};
use crate::storage::traits::{AuditSink, ChildStorage, CredentialStorage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialServiceError {
    #[error("Child not found: {0}")]
    ChildNotFound(String),
    #[error("No QR credential has been issued for child {0}")]
    CredentialNotFound(String),
}

/// A credential and the payload currently derived from it
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialView {
    pub credential: QrCredential,
    pub payload: String,
}

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Holds one child's credential lock; the map entry goes away with the last holder
struct ChildLock {
    locks: LockMap,
    child_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChildLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        let idle = locks
            .get(&self.child_id)
            .map_or(false, |entry| Arc::strong_count(entry) == 1);
        if idle {
            locks.remove(&self.child_id);
        }
    }
}

/// Service for issuing and managing children's QR credentials.
///
/// Every operation on a child's credential runs under that child's lock, so two
/// rotations can never interleave and silently discard a token.
#[derive(Clone)]
pub struct CredentialService {
    manager: QrCredentialManager,
    children: Arc<dyn ChildStorage>,
    credentials: Arc<dyn CredentialStorage>,
    audit: Arc<dyn AuditSink>,
    locks: LockMap,
}

impl CredentialService {
    pub fn new(
        manager: QrCredentialManager,
        children: Arc<dyn ChildStorage>,
        credentials: Arc<dyn CredentialStorage>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            manager,
            children,
            credentials,
            audit,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn manager(&self) -> &QrCredentialManager {
        &self.manager
    }

    async fn lock_child(&self, child_id: &str) -> ChildLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(child_id.to_string()).or_default().clone()
        };
        let mut lock = ChildLock {
            locks: self.locks.clone(),
            child_id: child_id.to_string(),
            guard: None,
        };
        lock.guard = Some(mutex.lock_owned().await);
        lock
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn view(&self, credential: QrCredential) -> CredentialView {
        let payload = self.manager.derive_payload(&credential);
        CredentialView { credential, payload }
    }

    async fn load_existing(&self, child_id: &str) -> Result<QrCredential> {
        match self.credentials.get_credential(child_id).await? {
            Some(credential) => Ok(credential),
            None => {
                warn!("No QR credential for child {}", child_id);
                Err(CredentialServiceError::CredentialNotFound(child_id.to_string()).into())
            }
        }
    }

    /// Issue a credential for a linked child, replacing any existing one
    pub async fn issue(
        &self,
        child_id: &str,
        mode: QrMode,
        rotation_interval_minutes: Option<i64>,
        actor: &ActorContext,
    ) -> Result<CredentialView> {
        info!(
            "Issuing {:?} QR credential for child {} (interval: {:?})",
            mode, child_id, rotation_interval_minutes
        );
        if self.children.get_child(child_id).await?.is_none() {
            warn!("Cannot issue QR credential, child not found: {}", child_id);
            return Err(CredentialServiceError::ChildNotFound(child_id.to_string()).into());
        }
        let _lock = self.lock_child(child_id).await;

        let credential = self.manager.issue(child_id, mode, rotation_interval_minutes)?;
        self.credentials.store_credential(&credential).await?;

        let detail = match credential.rotation_interval_minutes {
            Some(minutes) => format!("{:?} credential, rotation every {} minutes", mode, minutes),
            None => format!("{:?} credential", mode),
        };
        self.audit
            .record(&AuditEvent::new(actor, AuditAction::CredentialIssued, Some(child_id), detail))
            .await?;

        Ok(self.view(credential))
    }

    /// Replace the token of a child's dynamic credential
    pub async fn rotate(&self, child_id: &str, actor: &ActorContext) -> Result<CredentialView> {
        info!("Rotating QR token for child {}", child_id);
        let _lock = self.lock_child(child_id).await;

        let current = self.load_existing(child_id).await?;
        let rotated = self.manager.rotate(&current)?;
        self.credentials.store_credential(&rotated).await?;

        self.audit
            .record(&AuditEvent::new(
                actor,
                AuditAction::CredentialRotated,
                Some(child_id),
                "dynamic token replaced",
            ))
            .await?;

        Ok(self.view(rotated))
    }

    pub async fn set_enabled(
        &self,
        child_id: &str,
        enabled: bool,
        actor: &ActorContext,
    ) -> Result<CredentialView> {
        info!("Setting QR credential for child {} enabled={}", child_id, enabled);
        let _lock = self.lock_child(child_id).await;

        let current = self.load_existing(child_id).await?;
        let updated = self.manager.set_enabled(&current, enabled);
        self.credentials.store_credential(&updated).await?;

        let action = if enabled {
            AuditAction::CredentialEnabled
        } else {
            AuditAction::CredentialDisabled
        };
        let detail = if current.enabled == enabled {
            "state unchanged"
        } else {
            "state changed"
        };
        self.audit
            .record(&AuditEvent::new(actor, action, Some(child_id), detail))
            .await?;

        Ok(self.view(updated))
    }

    /// Dispatch a guardian action from the credential screen
    pub async fn apply_action(
        &self,
        child_id: &str,
        action: CredentialAction,
        actor: &ActorContext,
    ) -> Result<CredentialView> {
        match action {
            CredentialAction::Rotate => self.rotate(child_id, actor).await,
            CredentialAction::Enable => self.set_enabled(child_id, true, actor).await,
            CredentialAction::Disable => self.set_enabled(child_id, false, actor).await,
        }
    }

    pub async fn get(&self, child_id: &str) -> Result<Option<CredentialView>> {
        let credential = self.credentials.get_credential(child_id).await?;
        Ok(credential.map(|c| self.view(c)))
    }

    /// Render the current payload of a child's credential
    pub async fn render(&self, child_id: &str, grid_size: usize, canvas_px: u32) -> Result<(PseudoQr, String)> {
        let credential = self.load_existing(child_id).await?;
        let payload = self.manager.derive_payload(&credential);
        let qr = pseudo_qr::render(&payload, grid_size, canvas_px)?;
        Ok((qr, payload))
    }
}
