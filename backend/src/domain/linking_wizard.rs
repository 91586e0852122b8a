//! # Linking Wizard
//!
//! State machine behind the "Add a child" flow:
//!
//! ```text
//! ChooseMethod (0) → Details (1) → Review (2) → Completed
//! ```
//!
//! A [`LinkingSession`] is an immutable value. Every user action is a
//! [`WizardEvent`] fed through [`transition`], which returns the next session.
//! Events that are not allowed in the current step, or a `Next` whose guard
//! fails, return the session unchanged; the UI disables those actions and uses
//! [`LinkingSession::advance_guard`] to explain why.
//!
//! ## Rules
//!
//! - `code_status` is recomputed from `code` on every code change and is never
//!   set directly.
//! - Selecting a method clears the code, its status and any conflict choice.
//! - `confirm_guardian` can only be set on Review and is cleared when leaving it.
//! - A completed session ignores all further events and yields exactly one
//!   [`LinkingOutcome`].

use chrono::NaiveDate;
use shared::{CodeStatus, ConflictChoice, Currency, LinkingMethod, WizardStep};

use super::code_validator::{self, classify};
use super::conflict_resolver::{self, ConflictResolution};

/// Minimum trimmed length of a new child's name
pub const MIN_CHILD_NAME_LENGTH: usize = 2;

/// Reason the wizard cannot move forward from its current step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardNotSatisfied {
    #[error("Choose how to add the child")]
    MethodNotSelected,
    #[error("Child name must be at least 2 characters")]
    ChildNameTooShort,
    #[error("School is required")]
    SchoolMissing,
    #[error("Class is required")]
    ClassMissing,
    #[error("Date of birth is required")]
    DateOfBirthMissing,
    #[error("Enter or scan a linking code")]
    CodeMissing,
    #[error("The linking code is not valid")]
    CodeInvalid,
    #[error("Choose how to resolve the school roster mismatch")]
    ConflictUnresolved,
    #[error("Select which existing child to link")]
    ExistingChildNotSelected,
    #[error("Confirm that you are the child's guardian")]
    GuardianNotConfirmed,
    #[error("This session is already completed")]
    SessionCompleted,
}

/// A single user action in the wizard
#[derive(Debug, Clone, PartialEq)]
pub enum WizardEvent {
    SelectMethod(LinkingMethod),
    Next,
    Back,
    SetChildName(String),
    SetDateOfBirth(Option<NaiveDate>),
    SetSchool(String),
    SetClassName(String),
    SetStream(Option<String>),
    SetCurrency(Currency),
    SetPhotoRequested(bool),
    /// Keystroke or scan result; replaces the whole code
    SetCode(String),
    ChooseConflict(ConflictChoice),
    SelectExistingChild(String),
    SetConfirmGuardian(bool),
}

/// Fields collected for a brand new child wallet
#[derive(Debug, Clone, PartialEq)]
pub struct ChildDraft {
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub school: String,
    pub class_name: String,
    pub stream: Option<String>,
    pub currency: Currency,
    pub photo_requested: bool,
}

/// What a completed session asks the rest of the system to do
#[derive(Debug, Clone, PartialEq)]
pub enum LinkingOutcome {
    CreateChild(ChildDraft),
    LinkByCode { method: LinkingMethod, code: String },
    AttachToExisting { code: String, child_id: String },
    /// New child from the roster record; the mismatch goes out as a correction request
    CreateFromConflict { method: LinkingMethod, code: String },
    /// The code is already linked to this guardian; nothing is created
    DuplicateAcknowledged { code: String },
}

/// State of one wizard invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkingSession {
    step: Step,
    method: Option<LinkingMethod>,
    child_name: String,
    date_of_birth: Option<NaiveDate>,
    school: String,
    class_name: String,
    stream: Option<String>,
    currency: Currency,
    photo_requested: bool,
    code: String,
    code_status: CodeStatus,
    conflict_choice: Option<ConflictChoice>,
    existing_child_id: Option<String>,
    confirm_guardian: bool,
}

// WizardStep lives in `shared` and has no Default
#[derive(Debug, Clone, Copy, PartialEq)]
struct Step(WizardStep);

impl Default for Step {
    fn default() -> Self {
        Step(WizardStep::ChooseMethod)
    }
}

impl LinkingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> WizardStep {
        self.step.0
    }

    pub fn method(&self) -> Option<LinkingMethod> {
        self.method
    }

    pub fn child_name(&self) -> &str {
        &self.child_name
    }

    pub fn date_of_birth(&self) -> Option<NaiveDate> {
        self.date_of_birth
    }

    pub fn school(&self) -> &str {
        &self.school
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn photo_requested(&self) -> bool {
        self.photo_requested
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn code_status(&self) -> CodeStatus {
        self.code_status
    }

    pub fn code_status_line(&self) -> Option<&'static str> {
        code_validator::status_line(self.code_status)
    }

    pub fn conflict_choice(&self) -> Option<ConflictChoice> {
        self.conflict_choice
    }

    pub fn existing_child_id(&self) -> Option<&str> {
        self.existing_child_id.as_deref()
    }

    pub fn confirm_guardian(&self) -> bool {
        self.confirm_guardian
    }

    pub fn is_completed(&self) -> bool {
        self.step() == WizardStep::Completed
    }

    pub fn can_go_back(&self) -> bool {
        matches!(self.step(), WizardStep::Details | WizardStep::Review)
    }

    pub fn can_advance(&self) -> bool {
        self.advance_guard().is_ok()
    }

    /// Check whether `Next` would be accepted from the current step
    pub fn advance_guard(&self) -> Result<(), GuardNotSatisfied> {
        match self.step() {
            WizardStep::ChooseMethod => self
                .method
                .map(|_| ())
                .ok_or(GuardNotSatisfied::MethodNotSelected),
            WizardStep::Details => match self.method {
                None => Err(GuardNotSatisfied::MethodNotSelected),
                Some(LinkingMethod::Create) => self.create_details_guard(),
                Some(_) => self.code_details_guard().map(|_| ()),
            },
            WizardStep::Review => {
                if self.confirm_guardian {
                    Ok(())
                } else {
                    Err(GuardNotSatisfied::GuardianNotConfirmed)
                }
            }
            WizardStep::Completed => Err(GuardNotSatisfied::SessionCompleted),
        }
    }

    fn create_details_guard(&self) -> Result<(), GuardNotSatisfied> {
        if self.child_name.trim().chars().count() < MIN_CHILD_NAME_LENGTH {
            return Err(GuardNotSatisfied::ChildNameTooShort);
        }
        if self.school.trim().is_empty() {
            return Err(GuardNotSatisfied::SchoolMissing);
        }
        if self.class_name.trim().is_empty() {
            return Err(GuardNotSatisfied::ClassMissing);
        }
        if self.date_of_birth.is_none() {
            return Err(GuardNotSatisfied::DateOfBirthMissing);
        }
        Ok(())
    }

    /// Duplicate codes pass; they are acknowledged on Review instead
    fn code_details_guard(&self) -> Result<Option<ConflictResolution>, GuardNotSatisfied> {
        if self.code.trim().is_empty() {
            return Err(GuardNotSatisfied::CodeMissing);
        }
        match self.code_status {
            CodeStatus::Invalid => Err(GuardNotSatisfied::CodeInvalid),
            CodeStatus::Idle => Err(GuardNotSatisfied::CodeMissing),
            CodeStatus::Conflict => conflict_resolver::resolve(
                self.conflict_choice,
                self.existing_child_id.as_deref(),
            )
            .map(Some),
            CodeStatus::Valid | CodeStatus::Duplicate => Ok(None),
        }
    }

    /// The single outcome of a completed session
    pub fn outcome(&self) -> Option<LinkingOutcome> {
        if !self.is_completed() {
            return None;
        }

        let method = self.method?;
        if method == LinkingMethod::Create {
            return Some(LinkingOutcome::CreateChild(ChildDraft {
                name: self.child_name.trim().to_string(),
                date_of_birth: self.date_of_birth?,
                school: self.school.trim().to_string(),
                class_name: self.class_name.trim().to_string(),
                stream: self
                    .stream
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                currency: self.currency,
                photo_requested: self.photo_requested,
            }));
        }

        let code = self.code.trim().to_string();
        match self.code_status {
            CodeStatus::Valid => Some(LinkingOutcome::LinkByCode { method, code }),
            CodeStatus::Duplicate => Some(LinkingOutcome::DuplicateAcknowledged { code }),
            CodeStatus::Conflict => match self.code_details_guard().ok()?? {
                ConflictResolution::AttachToExisting { child_id } => {
                    Some(LinkingOutcome::AttachToExisting { code, child_id })
                }
                ConflictResolution::CreateNew => {
                    Some(LinkingOutcome::CreateFromConflict { method, code })
                }
            },
            CodeStatus::Idle | CodeStatus::Invalid => None,
        }
    }

    fn clear_code(&mut self) {
        self.code.clear();
        self.code_status = CodeStatus::Idle;
        self.clear_conflict();
    }

    fn clear_conflict(&mut self) {
        self.conflict_choice = None;
        self.existing_child_id = None;
    }
}

/// Apply one event to a session and return the resulting session
pub fn transition(session: &LinkingSession, event: WizardEvent) -> LinkingSession {
    let step = session.step();
    if step == WizardStep::Completed {
        return session.clone();
    }

    let mut next = session.clone();
    let on_details = step == WizardStep::Details;

    match event {
        WizardEvent::SelectMethod(method) => {
            if matches!(step, WizardStep::ChooseMethod | WizardStep::Details) {
                next.method = Some(method);
                next.clear_code();
            }
        }
        WizardEvent::Next => {
            if session.advance_guard().is_ok() {
                next.step = Step(match step {
                    WizardStep::ChooseMethod => WizardStep::Details,
                    WizardStep::Details => WizardStep::Review,
                    WizardStep::Review | WizardStep::Completed => WizardStep::Completed,
                });
            }
        }
        WizardEvent::Back => match step {
            WizardStep::Details => next.step = Step(WizardStep::ChooseMethod),
            WizardStep::Review => {
                next.step = Step(WizardStep::Details);
                next.confirm_guardian = false;
            }
            WizardStep::ChooseMethod | WizardStep::Completed => {}
        },
        WizardEvent::SetChildName(value) if on_details => next.child_name = value,
        WizardEvent::SetDateOfBirth(value) if on_details => next.date_of_birth = value,
        WizardEvent::SetSchool(value) if on_details => next.school = value,
        WizardEvent::SetClassName(value) if on_details => next.class_name = value,
        WizardEvent::SetStream(value) if on_details => next.stream = value,
        WizardEvent::SetCurrency(value) if on_details => next.currency = value,
        WizardEvent::SetPhotoRequested(value) if on_details => next.photo_requested = value,
        WizardEvent::SetCode(value) if on_details => {
            if session.method.map_or(false, |m| m.is_code_based()) {
                next.code_status = classify(&value);
                next.code = value;
                if next.code_status != CodeStatus::Conflict {
                    next.clear_conflict();
                }
            }
        }
        WizardEvent::ChooseConflict(choice) if on_details => {
            if session.code_status == CodeStatus::Conflict {
                next.conflict_choice = Some(choice);
                if choice == ConflictChoice::CreateNew {
                    next.existing_child_id = None;
                }
            }
        }
        WizardEvent::SelectExistingChild(child_id) if on_details => {
            if session.conflict_choice == Some(ConflictChoice::LinkToExisting) {
                next.existing_child_id = Some(child_id);
            }
        }
        WizardEvent::SetConfirmGuardian(value) if step == WizardStep::Review => {
            next.confirm_guardian = value;
        }
        // Field edits outside their own step
        _ => {}
    }

    next
}
