//! backend/src/io/rest/mappers/credential_mapper.rs

use crate::domain::qr_credential::QrCredential as DomainCredential;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::{QrCredential as SharedCredential, QrCredentialResponse};

/// Mapper between shared QR credential DTOs and domain credentials.
pub struct CredentialMapper;

impl CredentialMapper {
    pub fn to_domain(dto: SharedCredential) -> Result<DomainCredential> {
        let issued_at = DateTime::parse_from_rfc3339(&dto.issued_at)
            .context("Failed to parse issued_at from shared DTO")?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&dto.updated_at)
            .context("Failed to parse updated_at from shared DTO")?
            .with_timezone(&Utc);

        Ok(DomainCredential {
            child_id: dto.child_id,
            enabled: dto.enabled,
            mode: dto.mode,
            rotation_interval_minutes: dto.rotation_interval_minutes,
            current_token: dto.current_token,
            issued_at,
            updated_at,
        })
    }

    pub fn to_dto(domain: DomainCredential) -> SharedCredential {
        SharedCredential {
            child_id: domain.child_id,
            enabled: domain.enabled,
            mode: domain.mode,
            rotation_interval_minutes: domain.rotation_interval_minutes,
            current_token: domain.current_token,
            issued_at: domain.issued_at.to_rfc3339(),
            updated_at: domain.updated_at.to_rfc3339(),
        }
    }

    pub fn to_response_dto(domain: DomainCredential, payload: String) -> QrCredentialResponse {
        QrCredentialResponse {
            credential: Self::to_dto(domain),
            payload,
        }
    }
}
