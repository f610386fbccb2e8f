//! Artifact provisioning
//!
//! Resolves artifacts against the download manifest and materializes them on disk:
//! - checksum-verified downloads (SHA1 or MD5), reusing a cached file when it still matches
//! - an allow-list of archive types, enforced before any network call
//! - extraction of the first known driver executable from zip/tar archives
//! - cleanup of everything materialized during this run

use crate::digest::{checksums_match, hash_file, DigestAlgorithm};
use crate::manifest::{ArtifactDescriptor, Manifest};
use crate::types::{executable_names, InstanceRole, OsFamily};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

// ============================================================================
// Archive types
// ============================================================================

/// Allow-listed download formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Jar,
    Tar,
    /// bzip2-wrapped archive, normally `.tar.bz2`
    Bzip2,
    /// gzip-wrapped archive, `.tar.gz` or `.tgz`
    Gzip,
}

impl ArchiveKind {
    /// Classify by file name. Anything outside the allow-list is rejected.
    pub fn from_file_name(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        let kind = if lower.ends_with(".zip") {
            ArchiveKind::Zip
        } else if lower.ends_with(".jar") {
            ArchiveKind::Jar
        } else if lower.ends_with(".tar") {
            ArchiveKind::Tar
        } else if lower.ends_with(".bz2") {
            ArchiveKind::Bzip2
        } else if lower.ends_with(".gz") || lower.ends_with(".tgz") {
            ArchiveKind::Gzip
        } else {
            let ext = lower.rsplit('.').next().unwrap_or(&lower).to_string();
            return Err(Error::UnsupportedFileType(ext));
        };
        Ok(kind)
    }

    /// Whether the file has to be decompressed before its entries can be read
    pub fn is_compressed(&self) -> bool {
        matches!(self, ArchiveKind::Bzip2 | ArchiveKind::Gzip)
    }
}

/// How a materialized artifact is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Used as-is (jars go straight onto a classpath)
    Direct,
    /// Needs extraction before a runnable binary exists
    Archive(ArchiveKind),
}

/// A verified file on disk
#[derive(Debug, Clone)]
pub struct LocalArtifact {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Files produced by extraction (intermediate archives and the binary)
    pub extracted: Vec<PathBuf>,
}

/// Result of a single `ensure` attempt
#[derive(Debug, Clone)]
pub enum Fetch {
    Ready(LocalArtifact),
    /// Downloaded content did not hash to the expected value. Nothing was kept.
    ChecksumMismatch { expected: String, actual: String },
}

// ============================================================================
// Download sources
// ============================================================================

/// An in-flight download yielding body chunks
#[async_trait]
pub trait Download: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Where artifact bytes come from
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Download>>;
}

/// HTTP(S) source backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

struct HttpDownload {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl Download for HttpDownload {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(|e| Error::Download {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn Download>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(HttpDownload {
            url: url.to_string(),
            response,
        }))
    }
}

// ============================================================================
// Store
// ============================================================================

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Jars and extracted binaries land here
    pub home_dir: PathBuf,
    /// Non-jar archives land here
    pub downloads_dir: PathBuf,
    /// OS used to resolve manifest entries and executable names
    pub os: OsFamily,
    /// Network failures tolerated per artifact before giving up
    pub max_network_attempts: u32,
    /// Pause between retries
    pub retry_delay: Duration,
}

impl StoreConfig {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        Self {
            downloads_dir: home_dir.join("downloads"),
            home_dir,
            os: OsFamily::current(),
            max_network_attempts: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Which artifacts a download request covers
#[derive(Debug, Clone, Default)]
pub struct ArtifactSelection {
    /// All artifacts listing this role
    pub role: Option<InstanceRole>,
    /// Artifacts that must exist in the manifest
    pub names: Vec<String>,
}

impl ArtifactSelection {
    pub fn role(role: InstanceRole) -> Self {
        Self {
            role: Some(role),
            names: Vec::new(),
        }
    }

    pub fn names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            role: None,
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.names.is_empty()
    }

    /// Named artifacts first, then role matches, deduplicated by name
    pub fn resolve(&self, manifest: &Manifest, os: OsFamily) -> Result<Vec<ArtifactDescriptor>> {
        let mut selected = manifest.by_names(&self.names, os)?;
        if let Some(role) = self.role {
            selected.extend(manifest.for_role(role, os)?);
        }

        let mut seen = HashSet::new();
        selected.retain(|d| seen.insert(d.name.to_ascii_lowercase()));
        Ok(selected)
    }
}

/// A provisioning request gated on the manifest's modification time
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub manifest_path: PathBuf,
    pub selection: ArtifactSelection,
    /// Skip everything when the manifest is unchanged since the last check
    pub check_timestamp: bool,
    /// Remove previously materialized files before provisioning again
    pub cleanup: bool,
}

/// Downloads, verifies and extracts artifacts
pub struct ArtifactStore {
    config: StoreConfig,
    source: Arc<dyn ArtifactSource>,
    /// Every path written during this run, for `cleanup`
    materialized: Mutex<Vec<PathBuf>>,
    manifest_modified: Mutex<Option<SystemTime>>,
}

impl ArtifactStore {
    pub fn new(config: StoreConfig, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            config,
            source,
            materialized: Mutex::new(Vec::new()),
            manifest_modified: Mutex::new(None),
        }
    }

    /// Store backed by the real network
    pub fn with_http(config: StoreConfig) -> Result<Self> {
        Ok(Self::new(config, Arc::new(HttpSource::new()?)))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Where the artifact lives once downloaded
    pub fn local_path(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf> {
        let file_name = descriptor.file_name();
        let dir = match ArchiveKind::from_file_name(file_name)? {
            ArchiveKind::Jar => &self.config.home_dir,
            _ => &self.config.downloads_dir,
        };
        Ok(dir.join(file_name))
    }

    /// Make sure a verified copy of `descriptor` exists locally.
    ///
    /// A cached file with a matching checksum is returned without touching the network.
    /// Otherwise the file is downloaded once; a checksum mismatch comes back as
    /// [`Fetch::ChecksumMismatch`] for the caller to retry.
    pub async fn ensure(&self, descriptor: &ArtifactDescriptor) -> Result<Fetch> {
        let kind = ArchiveKind::from_file_name(descriptor.file_name())?;
        let path = self.local_path(descriptor)?;
        let artifact = LocalArtifact {
            name: descriptor.name.clone(),
            path: path.clone(),
            kind: match kind {
                ArchiveKind::Jar => ArtifactKind::Direct,
                other => ArtifactKind::Archive(other),
            },
            extracted: Vec::new(),
        };

        if fs::try_exists(&path).await? {
            let actual = hash_file(&path, descriptor.algorithm).await?;
            if checksums_match(&descriptor.checksum, &actual) {
                debug!("Checksum matched for {}", path.display());
                return Ok(Fetch::Ready(artifact));
            }
            debug!("Checksum did not match for {}, downloading again", path.display());
            fs::remove_file(&path).await?;
        }

        info!(
            "Downloading from {} with checksum {} [{}]",
            descriptor.url, descriptor.checksum, descriptor.algorithm
        );
        let actual = self
            .download_verified(&descriptor.url, &path, &descriptor.checksum, descriptor.algorithm)
            .await?;

        if checksums_match(&descriptor.checksum, &actual) {
            Ok(Fetch::Ready(artifact))
        } else {
            error!(
                "Checksum mismatch for {}: expected {}, got {}",
                descriptor.url, descriptor.checksum, actual
            );
            Ok(Fetch::ChecksumMismatch {
                expected: descriptor.checksum.clone(),
                actual,
            })
        }
    }

    /// `ensure` until a verified file exists.
    ///
    /// Checksum mismatches are retried without bound. Network failures are retried up to
    /// `max_network_attempts` times. Fatal errors return immediately.
    pub async fn ensure_verified(&self, descriptor: &ArtifactDescriptor) -> Result<LocalArtifact> {
        let mut network_failures = 0u32;

        loop {
            match self.ensure(descriptor).await {
                Ok(Fetch::Ready(artifact)) => return Ok(artifact),
                Ok(Fetch::ChecksumMismatch { .. }) => {
                    warn!("Error downloading the file {}. Retrying....", descriptor.url);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    network_failures += 1;
                    if network_failures >= self.config.max_network_attempts {
                        error!(
                            "Giving up on {} after {} failed attempts: {}",
                            descriptor.url, network_failures, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Error downloading the file {} ({}). Retrying ({}/{})....",
                        descriptor.url, e, network_failures, self.config.max_network_attempts
                    );
                }
            }

            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
    }

    /// Stream `url` into `dest` while hashing. Only content matching `expected` is moved
    /// into place; the actual digest is returned either way.
    async fn download_verified(
        &self,
        url: &str,
        dest: &Path,
        expected: &str,
        algorithm: DigestAlgorithm,
    ) -> Result<String> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);

        let result = self.stream_to(url, &part, algorithm).await;
        let actual = match result {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if checksums_match(expected, &actual) {
            fs::rename(&part, dest).await?;
        } else {
            fs::remove_file(&part).await?;
        }
        Ok(actual)
    }

    async fn stream_to(
        &self,
        url: &str,
        path: &Path,
        algorithm: DigestAlgorithm,
    ) -> Result<String> {
        let mut download = self.source.open(url).await?;
        let mut file = fs::File::create(path).await?;
        let mut hasher = algorithm.hasher();
        let mut total = 0u64;

        while let Some(chunk) = download.next_chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from {}", total, url);
        Ok(hasher.finalize_hex())
    }

    /// Extract the first known executable from an archive
    pub async fn extract(&self, archive: &Path) -> Result<Vec<PathBuf>> {
        let archive = archive.to_path_buf();
        let home_dir = self.config.home_dir.clone();
        let names = executable_names(self.config.os);

        tokio::task::spawn_blocking(move || extract_archive(&archive, &home_dir, &names))
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
    }

    /// Ensure and, for archives, extract every descriptor in order
    pub async fn provision(
        &self,
        descriptors: &[ArtifactDescriptor],
    ) -> Result<Vec<LocalArtifact>> {
        debug!("Current platform: {}", self.config.os);
        let mut artifacts = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let mut artifact = self.ensure_verified(descriptor).await?;
            self.record(artifact.path.clone());

            if let ArtifactKind::Archive(_) = artifact.kind {
                artifact.extracted = self.extract(&artifact.path).await?;
                for path in &artifact.extracted {
                    self.record(path.clone());
                }
            }
            artifacts.push(artifact);
        }

        debug!("Files after download and extract: {:?}", self.materialized());
        Ok(artifacts)
    }

    /// Provision `request.selection` unless the manifest timestamp gate says nothing changed.
    ///
    /// Returns `None` when the gate skipped the work.
    pub async fn check_for_downloads(
        &self,
        request: &DownloadRequest,
    ) -> Result<Option<Vec<LocalArtifact>>> {
        let modified = fs::metadata(&request.manifest_path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| {
                Error::Manifest(format!(
                    "unable to open {}: {}",
                    request.manifest_path.display(),
                    e
                ))
            })?;

        if request.check_timestamp && *self.manifest_modified.lock() == Some(modified) {
            debug!("Manifest unchanged, skipping downloads");
            return Ok(None);
        }

        if request.cleanup {
            self.cleanup().await;
        }

        let manifest = Manifest::load(&request.manifest_path)?;
        let descriptors = request.selection.resolve(&manifest, self.config.os)?;
        let artifacts = self.provision(&descriptors).await?;

        // the gate only closes once this manifest has been fully provisioned
        *self.manifest_modified.lock() = Some(modified);
        Ok(Some(artifacts))
    }

    /// Delete every file materialized during this run. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.materialized.lock());
        let mut removed = 0;

        for path in paths {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        debug!("Cleaned up {} artifact files", removed);
        removed
    }

    /// Paths materialized so far
    pub fn materialized(&self) -> Vec<PathBuf> {
        self.materialized.lock().clone()
    }

    fn record(&self, path: PathBuf) {
        let mut materialized = self.materialized.lock();
        if !materialized.contains(&path) {
            materialized.push(path);
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

// ============================================================================
// Extraction
// ============================================================================

/// Extract the first entry whose basename is in `executable_names` into `out_dir`.
///
/// Compressed archives are decompressed next to themselves first; the intermediate file
/// is part of the returned list.
pub fn extract_archive(
    archive: &Path,
    out_dir: &Path,
    executable_names: &[String],
) -> Result<Vec<PathBuf>> {
    info!("Extracting {}", archive.display());

    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Extraction(format!("not a file: {}", archive.display())))?;
    let kind = ArchiveKind::from_file_name(&file_name)?;

    let mut files = Vec::new();
    let working = if kind.is_compressed() {
        let output = decompressed_path(archive);
        debug!("Decompressing {} to {}", archive.display(), output.display());
        decompress(kind, archive, &output)?;
        files.push(output.clone());
        output
    } else {
        archive.to_path_buf()
    };

    let wanted: Vec<String> = executable_names.iter().map(|n| n.to_ascii_lowercase()).collect();
    debug!("Executable list: {:?}", wanted);

    let is_tar = working
        .to_string_lossy()
        .to_ascii_lowercase()
        .ends_with(".tar");
    let binary = match kind {
        ArchiveKind::Jar => None,
        _ if is_tar => extract_from_tar(&working, out_dir, &wanted)?,
        _ => extract_from_zip(&working, out_dir, &wanted)?,
    };

    match binary {
        Some(path) => files.push(path),
        None => debug!("No known executable found in {}", working.display()),
    }
    Ok(files)
}

/// `x.tar.bz2` => `x.tar`, `x.tgz` => `x.tar`
fn decompressed_path(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = name.to_ascii_lowercase();

    let stem = if lower.ends_with(".tgz") {
        format!("{}.tar", &name[..name.len() - 4])
    } else {
        match name.rfind('.') {
            Some(idx) => name[..idx].to_string(),
            None => name.clone(),
        }
    };
    archive.with_file_name(stem)
}

fn decompress(kind: ArchiveKind, input: &Path, output: &Path) -> Result<()> {
    let file = File::open(input)?;
    let mut reader: Box<dyn Read> = match kind {
        ArchiveKind::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        ArchiveKind::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        other => {
            return Err(Error::Extraction(format!("{:?} is not a compressed format", other)));
        }
    };
    let mut out = File::create(output)?;
    std::io::copy(&mut reader, &mut out)
        .map_err(|e| Error::Extraction(format!("decompressing {}: {}", input.display(), e)))?;
    Ok(())
}

fn basename(entry: &str) -> &str {
    entry.rsplit(['/', '\\']).next().unwrap_or(entry)
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

fn extract_from_tar(archive: &Path, out_dir: &Path, wanted: &[String]) -> Result<Option<PathBuf>> {
    let mut tar = tar::Archive::new(File::open(archive)?);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();

        if has_parent_component(&entry_path) {
            return Err(Error::Extraction(format!(
                "path traversal in {}: {}",
                archive.display(),
                entry_path.display()
            )));
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = basename(&entry_path.to_string_lossy()).to_string();
        if wanted.contains(&name.to_ascii_lowercase()) {
            let dest = out_dir.join(&name);
            write_executable(&dest, &mut entry)?;
            return Ok(Some(dest));
        }
    }
    Ok(None)
}

fn extract_from_zip(archive: &Path, out_dir: &Path, wanted: &[String]) -> Result<Option<PathBuf>> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)
        .map_err(|e| Error::Extraction(format!("zip {}: {}", archive.display(), e)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::Extraction(format!("zip entry: {}", e)))?;
        let entry_name = entry.name().to_string();

        if has_parent_component(Path::new(&entry_name)) {
            return Err(Error::Extraction(format!(
                "path traversal in {}: {}",
                archive.display(),
                entry_name
            )));
        }
        if entry.is_dir() {
            continue;
        }

        let name = basename(&entry_name).to_string();
        if wanted.contains(&name.to_ascii_lowercase()) {
            let dest = out_dir.join(&name);
            write_executable(&dest, &mut entry)?;
            return Ok(Some(dest));
        }
    }
    Ok(None)
}

fn write_executable(dest: &Path, reader: &mut dyn Read) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        std::fs::remove_file(dest)?;
    }

    debug!("Creating output file {}", dest.display());
    let mut out = File::create(dest)?;
    std::io::copy(reader, &mut out)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_allow_list() {
        assert_eq!(ArchiveKind::from_file_name("a.zip").unwrap(), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_file_name("a.JAR").unwrap(), ArchiveKind::Jar);
        assert_eq!(ArchiveKind::from_file_name("a.tar.bz2").unwrap(), ArchiveKind::Bzip2);
        assert_eq!(ArchiveKind::from_file_name("a.tgz").unwrap(), ArchiveKind::Gzip);

        match ArchiveKind::from_file_name("setup.exe") {
            Err(Error::UnsupportedFileType(ext)) => assert_eq!(ext, "exe"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ArchiveKind::from_file_name("driver.7z").unwrap_err().is_fatal());
    }

    #[test]
    fn test_decompressed_path() {
        assert_eq!(
            decompressed_path(Path::new("/d/phantomjs-2.1.tar.bz2")),
            PathBuf::from("/d/phantomjs-2.1.tar")
        );
        assert_eq!(
            decompressed_path(Path::new("/d/driver.tgz")),
            PathBuf::from("/d/driver.tar")
        );
    }

    #[test]
    fn test_basename_handles_both_separators() {
        assert_eq!(basename("phantomjs-2.1/bin/phantomjs"), "phantomjs");
        assert_eq!(basename("win\\chromedriver.exe"), "chromedriver.exe");
    }

    #[test]
    fn test_local_path_splits_jars_and_archives() {
        struct NoSource;
        #[async_trait]
        impl ArtifactSource for NoSource {
            async fn open(&self, url: &str) -> Result<Box<dyn Download>> {
                Err(Error::Download {
                    url: url.to_string(),
                    reason: "offline".to_string(),
                })
            }
        }

        let store = ArtifactStore::new(StoreConfig::new("/home/grid"), Arc::new(NoSource));
        let jar = ArtifactDescriptor {
            name: "selenium-server".into(),
            url: "https://x/selenium-server.jar".into(),
            checksum: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
            algorithm: DigestAlgorithm::Sha1,
            platform: crate::manifest::ArtifactPlatform::Any,
            roles: vec![],
        };
        let zip = ArtifactDescriptor {
            url: "https://x/chromedriver.zip".into(),
            ..jar.clone()
        };

        assert_eq!(
            store.local_path(&jar).unwrap(),
            PathBuf::from("/home/grid/selenium-server.jar")
        );
        assert_eq!(
            store.local_path(&zip).unwrap(),
            PathBuf::from("/home/grid/downloads/chromedriver.zip")
        );
    }
}
