//! # Configuration
//!
//! Settings live in `eduwallet.yaml` inside the data directory. The data
//! directory defaults to `~/Documents/EduWallet` and can be moved with
//! `EDUWALLET_DATA_DIR`; `EDUWALLET_BIND` overrides the listen address.
//!
//! ```yaml
//! bind_address: 127.0.0.1:3000
//! allowed_origin: http://localhost:8080
//! qr:
//!   scheme: eduwallet
//!   grid_size: 25
//!   canvas_px: 260
//!   issue_on_link: true
//!   default_mode: Dynamic
//!   default_rotation_minutes: 5
//! audit:
//!   default_actor: guardian
//!   default_device: unknown-device
//! ```

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use shared::QrMode;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::pseudo_qr::{
    DEFAULT_CANVAS_PX, DEFAULT_GRID_SIZE, FINDER_SIZE, MAX_CANVAS_PX, MAX_GRID_SIZE,
};
use crate::domain::qr_credential::DEFAULT_SCHEME;

pub const CONFIG_FILE_NAME: &str = "eduwallet.yaml";
pub const DATA_DIR_ENV: &str = "EDUWALLET_DATA_DIR";
pub const BIND_ENV: &str = "EDUWALLET_BIND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Not read from the file; always the directory the file was found in
    #[serde(skip)]
    pub data_directory: PathBuf,
    pub bind_address: String,
    pub allowed_origin: String,
    pub qr: QrConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    pub scheme: String,
    pub grid_size: usize,
    pub canvas_px: u32,
    /// Issue a credential as soon as a child is linked
    pub issue_on_link: bool,
    pub default_mode: QrMode,
    pub default_rotation_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Used when a request carries no guardian header
    pub default_actor: String,
    /// Used when a request carries no device header
    pub default_device: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            bind_address: "127.0.0.1:3000".to_string(),
            allowed_origin: "http://localhost:8080".to_string(),
            qr: QrConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            grid_size: DEFAULT_GRID_SIZE,
            canvas_px: DEFAULT_CANVAS_PX,
            issue_on_link: false,
            default_mode: QrMode::Static,
            default_rotation_minutes: 5,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_actor: "guardian".to_string(),
            default_device: "unknown-device".to_string(),
        }
    }
}

/// `~/Documents/EduWallet`, or `~/EduWallet` where there is no Documents folder
pub fn default_data_directory() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("EduWallet")
}

impl AppConfig {
    /// Load configuration honouring the environment overrides
    pub fn load() -> Result<Self> {
        let data_directory = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_directory);

        let mut config = Self::load_from_directory(&data_directory)?;
        if let Ok(bind) = std::env::var(BIND_ENV) {
            info!("Bind address overridden by {}: {}", BIND_ENV, bind);
            config.bind_address = bind;
        }
        Ok(config)
    }

    /// Read `eduwallet.yaml` from a data directory, falling back to defaults
    pub fn load_from_directory(data_directory: &Path) -> Result<Self> {
        let path = data_directory.join(CONFIG_FILE_NAME);

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            info!("No {} in {}, using defaults", CONFIG_FILE_NAME, data_directory.display());
            AppConfig::default()
        };

        config.data_directory = data_directory.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.qr.scheme.trim().is_empty() || self.qr.scheme.contains("://") {
            anyhow::bail!("qr.scheme must be a bare scheme name, got {:?}", self.qr.scheme);
        }
        if !(FINDER_SIZE..=MAX_GRID_SIZE).contains(&self.qr.grid_size) {
            anyhow::bail!(
                "qr.grid_size must be between {} and {}, got {}",
                FINDER_SIZE,
                MAX_GRID_SIZE,
                self.qr.grid_size
            );
        }
        if !(1..=MAX_CANVAS_PX).contains(&self.qr.canvas_px) {
            anyhow::bail!(
                "qr.canvas_px must be between 1 and {}, got {}",
                MAX_CANVAS_PX,
                self.qr.canvas_px
            );
        }
        if self.qr.default_mode == QrMode::Dynamic && self.qr.default_rotation_minutes <= 0 {
            anyhow::bail!("qr.default_rotation_minutes must be positive for dynamic mode");
        }
        Ok(())
    }
}
