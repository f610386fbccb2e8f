//! Download manifest
//!
//! The manifest is a JSON array of artifacts:
//!
//! ```json
//! [
//!   {
//!     "name": "chromedriver",
//!     "roles": ["node", "standalone"],
//!     "linux": { "url": "https://.../chromedriver_linux64.zip", "checksum": "<sha1 or md5>" },
//!     "mac":   { "url": "https://.../chromedriver_mac64.zip",   "checksum": "..." }
//!   },
//!   {
//!     "name": "selenium-server",
//!     "roles": ["hub", "node", "standalone"],
//!     "any": { "url": "https://.../selenium-server-standalone.jar", "checksum": "..." }
//!   }
//! ]
//! ```
//!
//! An `any` block wins over an OS-specific block.

use crate::digest::DigestAlgorithm;
use crate::types::{InstanceRole, OsFamily};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Per-platform download location
#[derive(Debug, Clone, Deserialize)]
pub struct UrlChecksum {
    pub url: String,
    pub checksum: String,
}

/// Raw manifest entry as it appears on disk
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub any: Option<UrlChecksum>,
    #[serde(default)]
    pub linux: Option<UrlChecksum>,
    #[serde(default)]
    pub mac: Option<UrlChecksum>,
    #[serde(default)]
    pub windows: Option<UrlChecksum>,
}

impl ManifestEntry {
    /// Resolve the URL/checksum pair for `os`
    fn resolve(&self, os: OsFamily) -> Option<&UrlChecksum> {
        if self.any.is_some() {
            return self.any.as_ref();
        }
        match os {
            OsFamily::Linux => self.linux.as_ref(),
            OsFamily::Mac => self.mac.as_ref(),
            OsFamily::Windows => self.windows.as_ref(),
        }
    }

    fn has_role(&self, role: InstanceRole) -> bool {
        self.roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case(role.friendly_name()))
    }
}

/// Where a resolved artifact may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactPlatform {
    Any,
    Os(OsFamily),
}

/// A downloadable unit resolved for one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub url: String,
    pub checksum: String,
    pub algorithm: DigestAlgorithm,
    pub platform: ArtifactPlatform,
    pub roles: Vec<String>,
}

impl ArtifactDescriptor {
    /// Last path segment of the URL, used as the local file name
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Parsed download manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load and validate a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("unable to open {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let entries: Vec<ManifestEntry> = serde_json::from_str(content)
            .map_err(|e| Error::Manifest(format!("JSON parse error: {}", e)))?;

        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.to_ascii_lowercase()) {
                return Err(Error::Manifest(format!(
                    "artifact '{}' is listed more than once",
                    entry.name
                )));
            }
        }

        debug!("Loaded manifest with {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every artifact used by `role` that resolves on `os`
    pub fn for_role(&self, role: InstanceRole, os: OsFamily) -> Result<Vec<ArtifactDescriptor>> {
        self.entries
            .iter()
            .filter(|e| e.has_role(role))
            .filter_map(|e| e.resolve(os).map(|r| (e, r)))
            .map(|(e, r)| descriptor(e, r, os))
            .collect()
    }

    /// Look up artifacts by name (case-insensitive).
    ///
    /// A name without an entry resolving on `os` is an error.
    pub fn by_names<S: AsRef<str>>(
        &self,
        names: &[S],
        os: OsFamily,
    ) -> Result<Vec<ArtifactDescriptor>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.entries
                    .iter()
                    .find(|e| e.name.eq_ignore_ascii_case(name))
                    .and_then(|e| e.resolve(os).map(|r| (e, r)))
                    .ok_or_else(|| Error::ManifestEntryMissing {
                        name: name.to_string(),
                        platform: os.to_string(),
                    })
                    .and_then(|(e, r)| descriptor(e, r, os))
            })
            .collect()
    }
}

fn descriptor(
    entry: &ManifestEntry,
    resolved: &UrlChecksum,
    os: OsFamily,
) -> Result<ArtifactDescriptor> {
    Ok(ArtifactDescriptor {
        name: entry.name.clone(),
        url: resolved.url.clone(),
        checksum: resolved.checksum.clone(),
        algorithm: DigestAlgorithm::infer(&resolved.checksum)?,
        platform: if entry.any.is_some() {
            ArtifactPlatform::Any
        } else {
            ArtifactPlatform::Os(os)
        },
        roles: entry.roles.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
    const MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn sample() -> Manifest {
        let json = serde_json::json!([
            {
                "name": "selenium-server",
                "roles": ["hub", "node"],
                "any": { "url": "https://example.com/selenium-server-3.0.jar", "checksum": SHA1 }
            },
            {
                "name": "chromedriver",
                "roles": ["node"],
                "linux": { "url": "https://example.com/chromedriver_linux64.zip", "checksum": MD5 },
                "mac": { "url": "https://example.com/chromedriver_mac64.zip?sig=1", "checksum": MD5 }
            },
            {
                "name": "selendroid",
                "roles": ["selendroid"],
                "any": { "url": "https://example.com/selendroid-standalone.jar", "checksum": SHA1 }
            }
        ]);
        Manifest::parse(&json.to_string()).unwrap()
    }

    #[test]
    fn test_for_role_filters_roles_and_platform() {
        let manifest = sample();

        let node_linux = manifest.for_role(InstanceRole::Node, OsFamily::Linux).unwrap();
        let names: Vec<_> = node_linux.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["selenium-server", "chromedriver"]);

        // chromedriver has no windows block
        let node_windows = manifest.for_role(InstanceRole::Node, OsFamily::Windows).unwrap();
        assert_eq!(node_windows.len(), 1);

        let hub = manifest.for_role(InstanceRole::Hub, OsFamily::Mac).unwrap();
        assert_eq!(hub.len(), 1);
        assert_eq!(hub[0].platform, ArtifactPlatform::Any);
        assert_eq!(hub[0].algorithm, DigestAlgorithm::Sha1);
    }

    #[test]
    fn test_by_names_is_case_insensitive_and_strict() {
        let manifest = sample();
        let found = manifest.by_names(&["ChromeDriver"], OsFamily::Mac).unwrap();
        assert_eq!(found[0].algorithm, DigestAlgorithm::Md5);
        assert_eq!(found[0].file_name(), "chromedriver_mac64.zip");

        let err = manifest.by_names(&["chromedriver"], OsFamily::Windows).unwrap_err();
        assert!(matches!(err, Error::ManifestEntryMissing { .. }));

        let err = manifest.by_names(&["iedriver"], OsFamily::Linux).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = serde_json::json!([
            { "name": "a", "any": { "url": "https://x/a.jar", "checksum": SHA1 } },
            { "name": "A", "any": { "url": "https://x/b.jar", "checksum": SHA1 } }
        ]);
        assert!(matches!(
            Manifest::parse(&json.to_string()),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn test_bad_checksum_is_fatal_misconfiguration() {
        let json = serde_json::json!([
            {
                "name": "a",
                "roles": ["hub"],
                "any": { "url": "https://x/a.jar", "checksum": "deadbeef" }
            }
        ]);
        let manifest = Manifest::parse(&json.to_string()).unwrap();
        let err = manifest.for_role(InstanceRole::Hub, OsFamily::Linux).unwrap_err();
        assert!(matches!(err, Error::ChecksumAlgorithm(_)));
    }
}
