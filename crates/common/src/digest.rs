//! Checksum helpers
//!
//! Manifest checksums are plain hex strings; the algorithm is inferred from
//! their length (40 => SHA1, 32 => MD5).

use crate::{Error, Result};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Md5,
}

impl DigestAlgorithm {
    /// Infer the algorithm from a hex checksum
    pub fn infer(checksum: &str) -> Result<Self> {
        let is_hex = checksum.chars().all(|c| c.is_ascii_hexdigit());
        match (is_hex, checksum.len()) {
            (true, 40) => Ok(DigestAlgorithm::Sha1),
            (true, 32) => Ok(DigestAlgorithm::Md5),
            _ => Err(Error::ChecksumAlgorithm(checksum.to_string())),
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "SHA1"),
            DigestAlgorithm::Md5 => write!(f, "MD5"),
        }
    }
}

/// Incremental hasher over either supported algorithm
pub enum Hasher {
    Sha1(Sha1),
    Md5(Md5),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream a file through `algorithm` and return the hex digest
pub async fn hash_file(path: impl AsRef<Path>, algorithm: DigestAlgorithm) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; 64 * 1024]; // 64KB buffer

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Case-insensitive comparison of hex digests
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_algorithm() {
        assert_eq!(
            DigestAlgorithm::infer("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap(),
            DigestAlgorithm::Sha1
        );
        assert_eq!(
            DigestAlgorithm::infer("D41D8CD98F00B204E9800998ECF8427E").unwrap(),
            DigestAlgorithm::Md5
        );
        assert!(DigestAlgorithm::infer("deadbeef").is_err());
        assert!(DigestAlgorithm::infer("zz39a3ee5e6b4b0d3255bfef95601890afd80709").is_err());
    }

    #[test]
    fn test_known_digests_of_empty_input() {
        let sha1 = DigestAlgorithm::Sha1.hasher().finalize_hex();
        assert_eq!(sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709");

        let mut md5 = DigestAlgorithm::Md5.hasher();
        md5.update(b"");
        assert_eq!(md5.finalize_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_hash_file_streams_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();

        let digest = hash_file(&path, DigestAlgorithm::Sha1).await.unwrap();
        assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(checksums_match("A9993E364706816ABA3E25717850C26C9CD0D89D", &digest));
    }
}
