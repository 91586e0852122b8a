//! backend/src/io/rest/mappers/audit_mapper.rs

use crate::domain::models::AuditEvent;
use shared::{AuditEntry, AuditLogResponse};

pub struct AuditMapper;

impl AuditMapper {
    pub fn to_dto(domain: AuditEvent) -> AuditEntry {
        AuditEntry {
            id: domain.id,
            timestamp: domain.timestamp.to_rfc3339(),
            actor: domain.actor,
            device: domain.device,
            action: domain.action,
            child_id: domain.child_id,
            detail: domain.detail,
        }
    }

    pub fn to_log_dto(events: Vec<AuditEvent>) -> AuditLogResponse {
        AuditLogResponse {
            entries: events.into_iter().map(Self::to_dto).collect(),
        }
    }
}
