use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::fs;
use std::path::PathBuf;

use super::connection::CsvConnection;
use crate::domain::qr_credential::QrCredential;
use crate::io::rest::mappers::credential_mapper::CredentialMapper;
use crate::storage::traits::CredentialStorage;

/// File-based credential repository: `qr_credential.yaml` next to `child.yaml`.
/// Writing replaces the file, so a child never has two stored credentials.
#[derive(Clone)]
pub struct CredentialRepository {
    connection: CsvConnection,
}

impl CredentialRepository {
    pub fn new(connection: CsvConnection) -> Self {
        Self { connection }
    }

    fn credential_path(&self, child_id: &str) -> PathBuf {
        self.connection
            .child_directory(child_id)
            .join("qr_credential.yaml")
    }
}

#[async_trait]
impl CredentialStorage for CredentialRepository {
    async fn store_credential(&self, credential: &QrCredential) -> Result<()> {
        self.connection.ensure_child_directory(&credential.child_id)?;

        let yaml_content = serde_yaml::to_string(&CredentialMapper::to_dto(credential.clone()))?;
        self.connection
            .write_atomic(&self.credential_path(&credential.child_id), &yaml_content)?;

        info!(
            "Stored {:?} QR credential for child {} (enabled: {})",
            credential.mode, credential.child_id, credential.enabled
        );
        Ok(())
    }

    async fn get_credential(&self, child_id: &str) -> Result<Option<QrCredential>> {
        if child_id.is_empty() || child_id.contains(['/', '\\']) || child_id.starts_with('.') {
            return Ok(None);
        }
        let path = self.credential_path(child_id);
        if !path.exists() {
            return Ok(None);
        }

        let yaml_content = fs::read_to_string(&path)?;
        let dto: shared::QrCredential = serde_yaml::from_str(&yaml_content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(CredentialMapper::to_domain(dto)?))
    }
}
