//! # CSV Roster
//!
//! School roster records that linking codes resolve to, read from
//! `{data}/roster.csv`:
//!
//! ```csv
//! code,name,school,class_name,stream
//! EDU-4821-KLA,Amani Okello,Kampala Parents School,P.5,Blue
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::Reader;
use log::debug;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;

use super::connection::CsvConnection;
use crate::domain::models::RosterRecord;
use crate::storage::traits::RosterLookup;

#[derive(Debug, Deserialize)]
struct RosterRow {
    code: String,
    name: String,
    school: String,
    class_name: String,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Clone)]
pub struct CsvRosterDirectory {
    connection: CsvConnection,
}

impl CsvRosterDirectory {
    pub fn new(connection: CsvConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RosterLookup for CsvRosterDirectory {
    async fn find_by_code(&self, code: &str) -> Result<Option<RosterRecord>> {
        let path = self.connection.roster_path();
        if !path.exists() {
            debug!("No roster file at {}", path.display());
            return Ok(None);
        }

        let wanted = code.trim();
        let mut reader = Reader::from_reader(BufReader::new(File::open(&path)?));
        for result in reader.deserialize() {
            let row: RosterRow = result.with_context(|| format!("Malformed row in {}", path.display()))?;
            if row.code.trim().eq_ignore_ascii_case(wanted) {
                return Ok(Some(RosterRecord {
                    code: row.code.trim().to_string(),
                    name: row.name,
                    school: row.school,
                    class_name: row.class_name,
                    stream: row.stream.filter(|s| !s.trim().is_empty()),
                }));
            }
        }
        Ok(None)
    }
}
