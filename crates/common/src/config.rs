//! Builder configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::partition::PartitionLimits;
use crate::types::{DEFAULT_MAX_VESSELS, DEFAULT_RESERVED_PERCENTAGE};
use crate::validation;
use crate::{Error, Result};

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub listen: String,

    /// Public URL prefix used in download links
    pub base_url: String,

    /// Partition configuration
    pub partition: PartitionConfig,

    /// Key configuration
    pub keys: KeysConfig,

    /// Installer configuration
    pub installers: InstallerConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            listen: "127.0.0.1:8080".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            partition: PartitionConfig::default(),
            keys: KeysConfig::default(),
            installers: InstallerConfig::default(),
        }
    }
}

/// Partition sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Share of every node kept for the reserved vessel
    pub reserved_percentage: u32,

    /// Maximum number of user-defined vessels
    pub max_vessels: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            reserved_percentage: DEFAULT_RESERVED_PERCENTAGE,
            max_vessels: DEFAULT_MAX_VESSELS,
        }
    }
}

/// Key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Owner key of the reserved vessel (hex). Generated under the store if unset.
    pub reserved_public_key: Option<String>,

    /// Path of the generated reserved owner key
    pub reserved_key_path: Option<PathBuf>,
}

/// Installer locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Directory holding the base installers
    pub base_installer_root: Option<PathBuf>,

    /// Directory builds are written to
    pub build_root: Option<PathBuf>,
}

impl BuilderConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self =
                toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // the reserved vessel always exists, and users need a share too
        if !(1..100).contains(&self.partition.reserved_percentage) {
            return Err(Error::InvalidConfig(format!(
                "reserved_percentage must be between 1 and 99 (got {})",
                self.partition.reserved_percentage
            )));
        }
        if self.partition.max_vessels == 0 {
            return Err(Error::InvalidConfig("max_vessels must be at least 1".to_string()));
        }
        if let Some(key) = &self.keys.reserved_public_key {
            validation::validate_public_key(key)
                .map_err(|_| Error::InvalidConfig("reserved_public_key is not a valid key".to_string()))?;
        }
        Ok(())
    }

    pub fn limits(&self) -> PartitionLimits {
        PartitionLimits::from_reserved(
            self.partition.reserved_percentage,
            self.partition.max_vessels,
        )
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("builder.db")
    }

    /// Get the reserved owner key path
    pub fn reserved_key_path(&self) -> PathBuf {
        self.keys
            .reserved_key_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("reserved.key"))
    }

    /// Get the base installer directory
    pub fn base_installer_root(&self) -> PathBuf {
        self.installers
            .base_installer_root
            .clone()
            .unwrap_or_else(|| self.store_path.join("base_installers"))
    }

    /// Get the build output directory
    pub fn build_root(&self) -> PathBuf {
        self.installers
            .build_root
            .clone()
            .unwrap_or_else(|| self.store_path.join("builds"))
    }
}
