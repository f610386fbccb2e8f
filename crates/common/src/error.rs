//! Error types for LocalGrid

use thiserror::Error;

/// Result type alias using LocalGrid Error
pub type Result<T> = std::result::Result<T, Error>;

/// LocalGrid error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unsupported file format: {0}. Supported file types are .zip, .tar, .jar, .tar.bz2 and .tar.gz")]
    UnsupportedFileType(String),

    #[error("Cannot infer checksum algorithm for '{0}': expected 40 (SHA1) or 32 (MD5) hex characters")]
    ChecksumAlgorithm(String),

    #[error("Artifact '{name}' has no manifest entry for platform {platform}")]
    ManifestEntryMissing { name: String, platform: String },

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Failed to spawn {component}: {reason}")]
    Spawn { component: String, reason: String },

    #[error("{component} can not be contacted on {host}:{port} after {attempts} attempts")]
    ReadinessTimeout {
        component: String,
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error(
        "Port {port} is already in use. Please shutdown the service listening on this port or configure a different port for the {component}"
    )]
    PortInUse { port: u16, component: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Provisioning errors that indicate a structurally broken setup.
    ///
    /// These are never retried: retrying cannot change the outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFileType(_)
                | Error::ChecksumAlgorithm(_)
                | Error::ManifestEntryMissing { .. }
                | Error::Manifest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::UnsupportedFileType("exe".into()).is_fatal());
        assert!(Error::ChecksumAlgorithm("abc".into()).is_fatal());
        assert!(!Error::Download {
            url: "http://x".into(),
            reason: "reset".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_readiness_timeout_names_component_and_port() {
        let err = Error::ReadinessTimeout {
            component: "hub".into(),
            host: "127.0.0.1".into(),
            port: 4444,
            attempts: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("hub"));
        assert!(msg.contains("4444"));
    }
}
