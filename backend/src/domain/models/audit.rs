use chrono::{DateTime, Utc};
use shared::AuditAction;

/// Who performed an action and from where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub guardian_id: String,
    pub device: String,
}

impl ActorContext {
    pub fn new(guardian_id: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            guardian_id: guardian_id.into(),
            device: device.into(),
        }
    }
}

/// One entry for the audit log sink
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub device: String,
    pub action: AuditAction,
    pub child_id: Option<String>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(
        actor: &ActorContext,
        action: AuditAction,
        child_id: Option<&str>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.guardian_id.clone(),
            device: actor.device.clone(),
            action,
            child_id: child_id.map(str::to_string),
            detail: detail.into(),
        }
    }
}
