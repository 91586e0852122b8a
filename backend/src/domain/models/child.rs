use chrono::{DateTime, NaiveDate, Utc};
use shared::{Currency, LinkingMethod};

/// A child wallet owned by the guardian account
#[derive(Debug, Clone, PartialEq)]
pub struct Child {
    pub id: String,
    pub name: String,
    pub school: String,
    pub class_name: String,
    pub stream: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub currency: Currency,
    pub photo_requested: bool,
    pub linking_method: LinkingMethod,
    pub linked_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Child {
    pub fn generate_id(now_millis: u64) -> String {
        shared::Child::generate_id(now_millis)
    }
}

/// A school roster entry that a linking code points at
#[derive(Debug, Clone, PartialEq)]
pub struct RosterRecord {
    pub code: String,
    pub name: String,
    pub school: String,
    pub class_name: String,
    pub stream: Option<String>,
}
