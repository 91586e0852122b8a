//! backend/src/io/rest/mappers/session_mapper.rs

use crate::domain::credential_service::CredentialView;
use crate::domain::linking_service::{EventResult, LinkingCompletion as DomainCompletion};
use crate::domain::linking_wizard::{LinkingSession, WizardEvent};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use shared::{
    LinkingCompletion as SharedCompletion, LinkingSessionView, QrCredentialResponse,
    WizardEventRequest, WizardEventResponse,
};

use super::child_mapper::ChildMapper;
use super::credential_mapper::CredentialMapper;

/// Mapper between wizard sessions/events and their wire representation.
pub struct SessionMapper;

impl SessionMapper {
    pub fn to_view(session_id: &str, session: &LinkingSession) -> LinkingSessionView {
        LinkingSessionView {
            session_id: session_id.to_string(),
            step: session.step(),
            method: session.method(),
            child_name: session.child_name().to_string(),
            date_of_birth: session.date_of_birth().map(|d| d.format("%Y-%m-%d").to_string()),
            school: session.school().to_string(),
            class_name: session.class_name().to_string(),
            stream: session.stream().map(str::to_string),
            currency: session.currency(),
            photo_requested: session.photo_requested(),
            code: session.code().to_string(),
            code_status: session.code_status(),
            code_status_line: session.code_status_line().map(str::to_string),
            conflict_choice: session.conflict_choice(),
            existing_child_id: session.existing_child_id().map(str::to_string),
            confirm_guardian: session.confirm_guardian(),
            can_go_back: session.can_go_back(),
            can_advance: session.can_advance(),
            blocked_reason: session.advance_guard().err().map(|e| e.to_string()),
        }
    }

    /// Converts a request body into a wizard event. Dates must be `YYYY-MM-DD`.
    pub fn to_event(request: WizardEventRequest) -> Result<WizardEvent> {
        let event = match request {
            WizardEventRequest::SelectMethod { method } => WizardEvent::SelectMethod(method),
            WizardEventRequest::Next => WizardEvent::Next,
            WizardEventRequest::Back => WizardEvent::Back,
            WizardEventRequest::SetChildName { value } => WizardEvent::SetChildName(value),
            WizardEventRequest::SetDateOfBirth { value } => {
                let date = value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d"))
                    .transpose()
                    .context("Failed to parse date of birth, expected YYYY-MM-DD")?;
                WizardEvent::SetDateOfBirth(date)
            }
            WizardEventRequest::SetSchool { value } => WizardEvent::SetSchool(value),
            WizardEventRequest::SetClassName { value } => WizardEvent::SetClassName(value),
            WizardEventRequest::SetStream { value } => WizardEvent::SetStream(value),
            WizardEventRequest::SetCurrency { value } => WizardEvent::SetCurrency(value),
            WizardEventRequest::SetPhotoRequested { value } => WizardEvent::SetPhotoRequested(value),
            WizardEventRequest::SetCode { value } => WizardEvent::SetCode(value),
            WizardEventRequest::ChooseConflict { choice } => WizardEvent::ChooseConflict(choice),
            WizardEventRequest::SelectExistingChild { child_id } => {
                WizardEvent::SelectExistingChild(child_id)
            }
            WizardEventRequest::SetConfirmGuardian { value } => WizardEvent::SetConfirmGuardian(value),
        };
        Ok(event)
    }

    fn to_credential_dto(view: Option<CredentialView>) -> Option<QrCredentialResponse> {
        view.map(|v| CredentialMapper::to_response_dto(v.credential, v.payload))
    }

    pub fn to_completion_dto(domain: DomainCompletion) -> SharedCompletion {
        match domain {
            DomainCompletion::Created { child, credential } => SharedCompletion::Created {
                child: ChildMapper::to_dto(child),
                credential: Self::to_credential_dto(credential),
            },
            DomainCompletion::Linked { child, credential } => SharedCompletion::Linked {
                child: ChildMapper::to_dto(child),
                credential: Self::to_credential_dto(credential),
            },
            DomainCompletion::AttachedToExisting { child } => SharedCompletion::AttachedToExisting {
                child: ChildMapper::to_dto(child),
            },
            DomainCompletion::CreatedWithRosterCorrection { child, credential } => {
                SharedCompletion::CreatedWithRosterCorrection {
                    child: ChildMapper::to_dto(child),
                    credential: Self::to_credential_dto(credential),
                }
            }
            DomainCompletion::DuplicateAcknowledged { code } => {
                SharedCompletion::DuplicateAcknowledged { code }
            }
        }
    }

    pub fn to_event_response(session_id: &str, result: EventResult) -> WizardEventResponse {
        match result {
            EventResult::InProgress(session) => WizardEventResponse::InProgress {
                session: Self::to_view(session_id, &session),
            },
            EventResult::Completed(completion) => WizardEventResponse::Completed {
                completion: Self::to_completion_dto(completion),
            },
        }
    }
}
