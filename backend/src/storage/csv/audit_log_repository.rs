//! # CSV Audit Log
//!
//! Append-only audit trail in `{data}/audit_log.csv`:
//!
//! ```csv
//! id,timestamp,actor,device,action,child_id,detail
//! 3f2c...,2024-01-15T10:30:00+00:00,guardian_1,Pixel 7,credential_rotated,child_1705314600000,dynamic token replaced
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{Reader, Writer};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Mutex};

use super::connection::CsvConnection;
use crate::domain::models::AuditEvent;
use crate::storage::traits::AuditSink;

/// CSV record structure for audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRecord {
    id: String,
    timestamp: String,
    actor: String,
    device: String,
    action: String,
    child_id: String,
    detail: String,
}

impl From<&AuditEvent> for AuditRecord {
    fn from(event: &AuditEvent) -> Self {
        AuditRecord {
            id: event.id.clone(),
            timestamp: event.timestamp.to_rfc3339(),
            actor: event.actor.clone(),
            device: event.device.clone(),
            action: event.action.to_string(),
            child_id: event.child_id.clone().unwrap_or_default(),
            detail: event.detail.clone(),
        }
    }
}

impl TryFrom<AuditRecord> for AuditEvent {
    type Error = anyhow::Error;

    fn try_from(record: AuditRecord) -> Result<Self> {
        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .with_context(|| format!("Invalid audit timestamp: {}", record.timestamp))?
            .with_timezone(&Utc);
        let action = record
            .action
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        Ok(AuditEvent {
            id: record.id,
            timestamp,
            actor: record.actor,
            device: record.device,
            action,
            child_id: Some(record.child_id).filter(|id| !id.is_empty()),
            detail: record.detail,
        })
    }
}

/// CSV-backed audit sink
#[derive(Clone)]
pub struct CsvAuditLog {
    connection: CsvConnection,
    // Serialises appends from concurrent requests
    write_lock: Arc<Mutex<()>>,
}

impl CsvAuditLog {
    pub fn new(connection: CsvConnection) -> Self {
        Self {
            connection,
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl AuditSink for CsvAuditLog {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Audit log lock poisoned"))?;

        let path = self.connection.audit_log_path();
        let file_exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;

        let mut writer = Writer::from_writer(BufWriter::new(file));
        if !file_exists {
            writer.write_record(["id", "timestamp", "actor", "device", "action", "child_id", "detail"])?;
        }
        let record = AuditRecord::from(event);
        writer.write_record([
            &record.id,
            &record.timestamp,
            &record.actor,
            &record.device,
            &record.action,
            &record.child_id,
            &record.detail,
        ])?;
        writer.flush()?;

        debug!("Appended audit event {} ({})", record.id, record.action);
        Ok(())
    }

    async fn recent_events(&self, limit: Option<u32>) -> Result<Vec<AuditEvent>> {
        let path = self.connection.audit_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = Reader::from_reader(BufReader::new(File::open(&path)?));
        let mut events = Vec::new();
        for result in reader.deserialize() {
            let record: AuditRecord = result?;
            events.push(AuditEvent::try_from(record)?);
        }

        events.reverse();
        if let Some(limit) = limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }
}
