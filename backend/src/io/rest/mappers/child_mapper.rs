//! backend/src/io/rest/mappers/child_mapper.rs

use crate::domain::models::Child as DomainChild;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use shared::{Child as SharedChild, ChildListResponse};

/// Mapper to convert between shared Child DTOs and domain Child models.
pub struct ChildMapper;

impl ChildMapper {
    /// Converts a shared Child DTO to a domain Child model.
    pub fn to_domain(dto: SharedChild) -> Result<DomainChild> {
        let date_of_birth = dto
            .date_of_birth
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .context("Failed to parse date_of_birth from shared DTO")?;
        let created_at = DateTime::parse_from_rfc3339(&dto.created_at)
            .context("Failed to parse created_at from shared DTO")?
            .with_timezone(&Utc);

        Ok(DomainChild {
            id: dto.id,
            name: dto.name,
            school: dto.school,
            class_name: dto.class_name,
            stream: dto.stream,
            date_of_birth,
            currency: dto.currency,
            photo_requested: dto.photo_requested,
            linking_method: dto.linking_method,
            linked_code: dto.linked_code,
            created_at,
        })
    }

    /// Converts a domain Child model to a shared Child DTO.
    pub fn to_dto(domain: DomainChild) -> SharedChild {
        SharedChild {
            id: domain.id,
            name: domain.name,
            school: domain.school,
            class_name: domain.class_name,
            stream: domain.stream,
            date_of_birth: domain.date_of_birth.map(|d| d.format("%Y-%m-%d").to_string()),
            currency: domain.currency,
            photo_requested: domain.photo_requested,
            linking_method: domain.linking_method,
            linked_code: domain.linked_code,
            created_at: domain.created_at.to_rfc3339(),
        }
    }

    pub fn to_child_list_dto(domain_children: Vec<DomainChild>) -> ChildListResponse {
        ChildListResponse {
            children: domain_children.into_iter().map(Self::to_dto).collect(),
        }
    }
}
