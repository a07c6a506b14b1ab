//! Custom Installer Builder common library
//!
//! Vessel partition model, build sessions, key provisioning and installer
//! packaging shared by the web service and the command line.

pub mod builder;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod keys;
pub mod packager;
pub mod partition;
pub mod session;
pub mod store;
pub mod types;
pub mod validation;
pub mod view;

// Re-export commonly used types
pub use builder::{BuildManager, BuildStatus, CleanReport, UserData};
pub use config::BuilderConfig;
pub use crypto::KeyPair;
pub use db::Database;
pub use error::{Error, Result};
pub use keys::{DirectoryKeyProvider, KeyProvider};
pub use packager::{ArchivePackager, Packager};
pub use partition::{Partition, PartitionError, PartitionLimits, Role, Vessel};
pub use session::{BuildSession, BuildState};
pub use store::SessionStore;
pub use types::*;
pub use validation::ValidationError;
pub use view::PartitionView;

/// Builder version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".cib")
}

/// Default configuration file
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
