use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// CsvConnection owns the data directory and the layout of files inside it
///
/// ```text
/// data/
/// ├── eduwallet.yaml
/// ├── roster.csv
/// ├── audit_log.csv
/// └── children/
///     └── {child_id}/
///         ├── child.yaml
///         └── qr_credential.yaml
/// ```
#[derive(Debug, Clone)]
pub struct CsvConnection {
    base_directory: PathBuf,
}

impl CsvConnection {
    /// Create a new connection, creating the base directory if needed
    pub fn new<P: AsRef<Path>>(base_directory: P) -> Result<Self> {
        let base_path = base_directory.as_ref().to_path_buf();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).with_context(|| {
                format!("Failed to create data directory {}", base_path.display())
            })?;
            info!("Created data directory: {}", base_path.display());
        }

        Ok(Self {
            base_directory: base_path,
        })
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    pub fn children_directory(&self) -> PathBuf {
        self.base_directory.join("children")
    }

    pub fn child_directory(&self, child_id: &str) -> PathBuf {
        self.children_directory().join(child_id)
    }

    pub fn roster_path(&self) -> PathBuf {
        self.base_directory.join("roster.csv")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.base_directory.join("audit_log.csv")
    }

    /// Make sure a child's directory exists and return it
    pub fn ensure_child_directory(&self, child_id: &str) -> Result<PathBuf> {
        let dir = self.child_directory(child_id);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("Created child directory: {:?}", dir);
        }
        Ok(dir)
    }

    /// Write a file through a temp file and rename, so readers never see half a file.
    /// Each call gets its own temp file, so concurrent writers never share one.
    pub fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, contents)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(())
    }
}
