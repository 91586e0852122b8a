//! Classification of raw linking codes.
//!
//! Codes arrive from keystrokes, camera scans or the demo code picker and are
//! classified again on every change. The sentinel values let support staff and
//! demos drive each branch of the wizard without a live roster.

use shared::CodeStatus;

/// Minimum trimmed length of a code that does not match a sentinel
pub const MIN_CODE_LENGTH: usize = 6;

/// Codes offered by the demo code picker, one per wizard branch
pub const DEMO_CODES: [&str; 4] = ["EDU-4821-KLA", "DUPLICATE", "CONFLICT", "INVALID"];

/// Classify a raw linking code.
///
/// Total over all inputs: anything that is not blank and not a sentinel falls
/// through to the length rule.
pub fn classify(code: &str) -> CodeStatus {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return CodeStatus::Idle;
    }

    if trimmed.eq_ignore_ascii_case("INVALID") {
        CodeStatus::Invalid
    } else if trimmed.eq_ignore_ascii_case("DUPLICATE") {
        CodeStatus::Duplicate
    } else if trimmed.eq_ignore_ascii_case("CONFLICT") {
        CodeStatus::Conflict
    } else if trimmed.chars().count() >= MIN_CODE_LENGTH {
        CodeStatus::Valid
    } else {
        CodeStatus::Invalid
    }
}

/// Line shown under the code field and on the Review step
pub fn status_line(status: CodeStatus) -> Option<&'static str> {
    match status {
        CodeStatus::Idle => None,
        CodeStatus::Valid => Some("Code verified"),
        CodeStatus::Invalid => Some("This code is not valid. Check it and try again."),
        CodeStatus::Duplicate => Some("Already linked to this guardian account"),
        CodeStatus::Conflict => Some("School roster mismatch: choose how to resolve it"),
    }
}
