//! LocalGrid Common Library
//!
//! Shared types, errors and artifact provisioning for the LocalGrid launcher.

pub mod artifact;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod types;

// Re-export commonly used types
pub use artifact::{
    ArchiveKind, ArtifactSelection, ArtifactSource, ArtifactStore, DownloadRequest, Fetch,
    HttpSource, LocalArtifact, StoreConfig,
};
pub use digest::DigestAlgorithm;
pub use error::{Error, Result};
pub use manifest::{ArtifactDescriptor, Manifest};
pub use types::*;

/// LocalGrid version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default home directory (`~/.localgrid`)
pub fn default_home_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".localgrid")
}

/// Default config file path
pub fn default_config_path() -> std::path::PathBuf {
    default_home_dir().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
