//! Core types for the Custom Installer Builder

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::validation::ValidationError;

/// Version string reported by the build API
pub const API_VERSION: &str = "2.0";

/// Default share of every node kept back for the reserved vessel
pub const DEFAULT_RESERVED_PERCENTAGE: u32 = 20;

/// Default upper bound on user-defined vessels
pub const DEFAULT_MAX_VESSELS: usize = 8;

/// Name of the generated vessel configuration file
pub const VESSEL_INFO_FILENAME: &str = "vesselinfo";

/// Location of the vesselinfo file inside an installer bundle
pub const VESSEL_INFO_BUNDLE_PATH: &str = "seattle/seattle_repy/vesselinfo";

/// Directory names used for key material inside a build directory
pub const PUBLIC_KEY_DIR: &str = "public_keys";
pub const PRIVATE_KEY_DIR: &str = "private_keys";

/// Platforms an installer can be packaged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Mac,
    Windows,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Linux, Platform::Mac, Platform::Windows];

    /// File name of the base installer this platform is built from
    pub fn bundle_name(&self) -> &'static str {
        match self {
            Platform::Linux => "seattle_linux.tgz",
            Platform::Mac => "seattle_mac.tgz",
            Platform::Windows => "seattle_win.zip",
        }
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        match self {
            Platform::Linux | Platform::Mac => ArchiveFormat::TarGz,
            Platform::Windows => ArchiveFormat::Zip,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Mac => write!(f, "mac"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Platform::Linux),
            "mac" => Ok(Platform::Mac),
            "windows" => Ok(Platform::Windows),
            other => Err(ValidationError::InvalidPlatform(other.to_string())),
        }
    }
}

/// Container format of an installer bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

/// Which key bundle to download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Public,
    Private,
}

impl KeyKind {
    pub fn bundle_name(&self) -> &'static str {
        match self {
            KeyKind::Public => "public_keys.zip",
            KeyKind::Private => "private_keys.zip",
        }
    }

    pub fn directory(&self) -> &'static str {
        match self {
            KeyKind::Public => PUBLIC_KEY_DIR,
            KeyKind::Private => PRIVATE_KEY_DIR,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            KeyKind::Public => "publickey",
            KeyKind::Private => "privatekey",
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Public => write!(f, "public"),
            KeyKind::Private => write!(f, "private"),
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(KeyKind::Public),
            "private" => Ok(KeyKind::Private),
            other => Err(ValidationError::InvalidKeyKind(other.to_string())),
        }
    }
}

/// A user known to a build session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl UserRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }
}

/// Public key information handed back after a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltUser {
    pub public_key: String,
    pub has_private_key: bool,
}

/// Outcome of preparing a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResults {
    pub build_id: String,
    pub installers: BTreeMap<Platform, String>,
    pub users: BTreeMap<String, BuiltUser>,
}

/// Stored record of a prepared build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub vessels: Vec<crate::partition::Vessel>,
    pub users: BTreeMap<String, BuiltUser>,
    #[serde(default)]
    pub keys_downloaded: Vec<KeyKind>,
    pub created_at: i64,
}

impl BuildRecord {
    pub fn has_private_keys(&self) -> bool {
        self.users.values().any(|u| u.has_private_key)
    }
}
