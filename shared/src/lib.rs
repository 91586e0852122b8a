use serde::{Deserialize, Serialize};
use std::fmt;

/// How a guardian brings a child wallet into their account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkingMethod {
    /// Create a brand new child wallet from scratch
    Create,
    /// Link an existing wallet using a code or QR scan
    Link,
    /// Approve a pending request raised by the child or school
    ApproveRequest,
    /// Accept an invite issued by the school
    SchoolInvite,
}

impl LinkingMethod {
    /// Whether this method is driven by a linking code rather than form fields
    pub fn is_code_based(&self) -> bool {
        !matches!(self, LinkingMethod::Create)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LinkingMethod::Create => "Create new child wallet",
            LinkingMethod::Link => "Link with code or QR",
            LinkingMethod::ApproveRequest => "Approve pending request",
            LinkingMethod::SchoolInvite => "Accept school invite",
        }
    }
}

/// Classification of a raw linking code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    #[default]
    Idle,
    Valid,
    Invalid,
    Duplicate,
    Conflict,
}

/// Guardian's answer to a school roster mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictChoice {
    LinkToExisting,
    CreateNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Currency {
    #[default]
    UGX,
    USD,
}

/// Position of a linking session in the wizard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WizardStep {
    ChooseMethod,
    Details,
    Review,
    Completed,
}

impl WizardStep {
    /// Zero-based step index shown in the progress indicator
    pub fn ordinal(&self) -> u8 {
        match self {
            WizardStep::ChooseMethod => 0,
            WizardStep::Details => 1,
            WizardStep::Review => 2,
            WizardStep::Completed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QrMode {
    /// Fixed payload, no token
    Static,
    /// Payload embeds a token that the guardian can rotate
    Dynamic,
}

/// Kind of action recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    ChildCreated,
    ChildLinked,
    AttachedToExisting,
    DuplicateAcknowledged,
    CredentialIssued,
    CredentialRotated,
    CredentialEnabled,
    CredentialDisabled,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::ChildCreated => "child_created",
            AuditAction::ChildLinked => "child_linked",
            AuditAction::AttachedToExisting => "attached_to_existing",
            AuditAction::DuplicateAcknowledged => "duplicate_acknowledged",
            AuditAction::CredentialIssued => "credential_issued",
            AuditAction::CredentialRotated => "credential_rotated",
            AuditAction::CredentialEnabled => "credential_enabled",
            AuditAction::CredentialDisabled => "credential_disabled",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child_created" => Ok(AuditAction::ChildCreated),
            "child_linked" => Ok(AuditAction::ChildLinked),
            "attached_to_existing" => Ok(AuditAction::AttachedToExisting),
            "duplicate_acknowledged" => Ok(AuditAction::DuplicateAcknowledged),
            "credential_issued" => Ok(AuditAction::CredentialIssued),
            "credential_rotated" => Ok(AuditAction::CredentialRotated),
            "credential_enabled" => Ok(AuditAction::CredentialEnabled),
            "credential_disabled" => Ok(AuditAction::CredentialDisabled),
            other => Err(format!("Unknown audit action: {}", other)),
        }
    }
}

/// A child wallet linked to the guardian account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Child {
    /// Format: "child_<epoch_millis>"
    pub id: String,
    pub name: String,
    pub school: String,
    pub class_name: String,
    pub stream: Option<String>,
    /// ISO 8601 date (YYYY-MM-DD), only known for wallets created by the guardian
    pub date_of_birth: Option<String>,
    pub currency: Currency,
    pub photo_requested: bool,
    pub linking_method: LinkingMethod,
    /// Code used to link the wallet, if any
    pub linked_code: Option<String>,
    /// RFC 3339
    pub created_at: String,
}

impl Child {
    /// Generate a child ID based on timestamp
    pub fn generate_id(epoch_millis: u64) -> String {
        format!("child_{}", epoch_millis)
    }

    /// Parse a child ID to extract the timestamp
    pub fn parse_id(id: &str) -> Result<u64, ChildIdError> {
        let millis = id.strip_prefix("child_").ok_or(ChildIdError::InvalidFormat)?;
        millis.parse::<u64>().map_err(|_| ChildIdError::InvalidTimestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildIdError {
    InvalidFormat,
    InvalidTimestamp,
}

impl fmt::Display for ChildIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildIdError::InvalidFormat => write!(f, "Invalid child ID format"),
            ChildIdError::InvalidTimestamp => write!(f, "Invalid timestamp in child ID"),
        }
    }
}

impl std::error::Error for ChildIdError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildListResponse {
    pub children: Vec<Child>,
}

/// Snapshot of a linking session as the wizard UI renders it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkingSessionView {
    pub session_id: String,
    pub step: WizardStep,
    pub method: Option<LinkingMethod>,
    pub child_name: String,
    pub date_of_birth: Option<String>,
    pub school: String,
    pub class_name: String,
    pub stream: Option<String>,
    pub currency: Currency,
    pub photo_requested: bool,
    pub code: String,
    pub code_status: CodeStatus,
    /// Status line for the current code, e.g. "Already linked to this guardian account"
    pub code_status_line: Option<String>,
    pub conflict_choice: Option<ConflictChoice>,
    pub existing_child_id: Option<String>,
    pub confirm_guardian: bool,
    pub can_go_back: bool,
    pub can_advance: bool,
    /// Why the Next button is disabled, if it is
    pub blocked_reason: Option<String>,
}

/// Events the wizard UI sends for a linking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WizardEventRequest {
    SelectMethod { method: LinkingMethod },
    Next,
    Back,
    SetChildName { value: String },
    /// YYYY-MM-DD, or null to clear
    SetDateOfBirth { value: Option<String> },
    SetSchool { value: String },
    SetClassName { value: String },
    SetStream { value: Option<String> },
    SetCurrency { value: Currency },
    SetPhotoRequested { value: bool },
    SetCode { value: String },
    ChooseConflict { choice: ConflictChoice },
    SelectExistingChild { child_id: String },
    SetConfirmGuardian { value: bool },
}

/// Result of the final step of a linking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkingCompletion {
    Created { child: Child, credential: Option<QrCredentialResponse> },
    Linked { child: Child, credential: Option<QrCredentialResponse> },
    AttachedToExisting { child: Child },
    /// New child created from a mismatched roster record; a correction request was flagged
    CreatedWithRosterCorrection { child: Child, credential: Option<QrCredentialResponse> },
    DuplicateAcknowledged { code: String },
}

/// Response to a wizard event: either the updated session or its completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WizardEventResponse {
    InProgress { session: LinkingSessionView },
    Completed { completion: LinkingCompletion },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoCodesResponse {
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrCredential {
    pub child_id: String,
    pub enabled: bool,
    pub mode: QrMode,
    pub rotation_interval_minutes: Option<i64>,
    pub current_token: Option<String>,
    /// RFC 3339
    pub issued_at: String,
    /// RFC 3339
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueCredentialRequest {
    pub mode: QrMode,
    pub rotation_interval_minutes: Option<i64>,
}

/// Credential together with the payload the UI displays or copies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrCredentialResponse {
    pub credential: QrCredential,
    pub payload: String,
}

/// Guardian actions on a child's QR credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialAction {
    Rotate,
    Enable,
    Disable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrRenderResponse {
    pub payload: String,
    pub grid_size: usize,
    pub canvas_px: u32,
    pub cell_px: f64,
    /// Row-major, `grid_size` rows of `grid_size` cells
    pub cells: Vec<Vec<bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// RFC 3339
    pub timestamp: String,
    pub actor: String,
    pub device: String,
    pub action: AuditAction,
    pub child_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogResponse {
    pub entries: Vec<AuditEntry>,
}
