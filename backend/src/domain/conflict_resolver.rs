//! Resolution of the school roster mismatch branch.
//!
//! A `conflict` code means the roster record behind the code does not match what
//! the guardian expects. The guardian picks one of two resolutions; nothing here
//! is computed on their behalf.

use shared::ConflictChoice;

use super::linking_wizard::GuardNotSatisfied;

/// What completing a conflicted session does downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Attach the code to a child the guardian already has
    AttachToExisting { child_id: String },
    /// Create a new child and flag the roster mismatch for correction
    CreateNew,
}

impl ConflictResolution {
    pub fn requests_roster_correction(&self) -> bool {
        matches!(self, ConflictResolution::CreateNew)
    }
}

/// Turn the guardian's choice into a resolution.
///
/// `LinkToExisting` is only resolved once an existing child has been selected.
pub fn resolve(
    choice: Option<ConflictChoice>,
    existing_child_id: Option<&str>,
) -> Result<ConflictResolution, GuardNotSatisfied> {
    match choice {
        None => Err(GuardNotSatisfied::ConflictUnresolved),
        Some(ConflictChoice::CreateNew) => Ok(ConflictResolution::CreateNew),
        Some(ConflictChoice::LinkToExisting) => match existing_child_id {
            Some(id) if !id.trim().is_empty() => Ok(ConflictResolution::AttachToExisting {
                child_id: id.trim().to_string(),
            }),
            _ => Err(GuardNotSatisfied::ExistingChildNotSelected),
        },
    }
}
