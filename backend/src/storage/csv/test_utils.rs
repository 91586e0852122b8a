/// Test utilities module for automatic cleanup and consistent test infrastructure
///
/// This module provides RAII-based cleanup that guarantees test data is removed
/// even if tests panic or fail.
use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use std::path::PathBuf;
use tempfile::TempDir;

use super::connection::CsvConnection;
use crate::domain::models::Child as DomainChild;
use shared::{Currency, LinkingMethod};

/// RAII Test Environment that automatically cleans up on drop
pub struct TestEnvironment {
    /// The temporary directory - kept alive to prevent auto-cleanup until drop
    _temp_dir: TempDir,
    pub connection: CsvConnection,
    /// Base directory path for manual inspection if needed
    pub base_path: PathBuf,
}

impl TestEnvironment {
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let base_path = temp_dir.path().to_path_buf();
        let connection = CsvConnection::new(&base_path)?;

        Ok(TestEnvironment {
            _temp_dir: temp_dir,
            connection,
            base_path,
        })
    }

    /// Write `roster.csv` from (code, name, school, class_name, stream) rows
    pub fn write_roster(&self, rows: &[(&str, &str, &str, &str, &str)]) -> Result<()> {
        let mut writer = csv::Writer::from_path(self.connection.roster_path())?;
        writer.write_record(["code", "name", "school", "class_name", "stream"])?;
        for (code, name, school, class_name, stream) in rows {
            writer.write_record([code, name, school, class_name, stream])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// A created-by-guardian child with fixed dates
pub fn sample_child(id: &str, name: &str) -> DomainChild {
    DomainChild {
        id: id.to_string(),
        name: name.to_string(),
        school: "Kampala Parents School".to_string(),
        class_name: "P.5".to_string(),
        stream: None,
        date_of_birth: NaiveDate::from_ymd_opt(2015, 6, 15),
        currency: Currency::UGX,
        photo_requested: false,
        linking_method: LinkingMethod::Create,
        linked_code: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
    }
}
