//! Checksum Engine
//!
//! Computes file attributes (checksum, content type) from stored bytes,
//! either inline or through a bounded background queue.

mod attributes;
mod engine;

pub use attributes::{detect_content_type, AttributeName};
pub use engine::{ChecksumEngine, ChecksumStats};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Start an incremental digest
    pub fn digester(&self) -> Digester {
        match self {
            ChecksumAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }

    /// Digest a complete buffer
    pub fn digest(&self, data: &[u8]) -> Checksum {
        let mut digester = self.digester();
        digester.update(data);
        digester.finish()
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(format!("Unsupported checksum algorithm: {}", other)),
        }
    }
}

/// Incremental digest over one of the supported algorithms
pub enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Checksum {
        let (algorithm, digest) = match self {
            Digester::Sha256(h) => (ChecksumAlgorithm::Sha256, hex::encode(h.finalize())),
            Digester::Sha512(h) => (ChecksumAlgorithm::Sha512, hex::encode(h.finalize())),
        };

        Checksum { algorithm, digest }
    }
}

/// A computed checksum, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let sha256 = ChecksumAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            sha256.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let sha512 = ChecksumAlgorithm::Sha512.digest(b"");
        assert!(sha512.digest.starts_with("cf83e1357eefb8bd"));
        assert_eq!(sha512.digest.len(), 128);
    }

    #[test]
    fn test_incremental_matches_whole() {
        let mut digester = ChecksumAlgorithm::Sha256.digester();
        digester.update(b"abcde");
        digester.update(b"fghij");

        assert_eq!(
            digester.finish(),
            ChecksumAlgorithm::Sha256.digest(b"abcdefghij")
        );
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("SHA256".parse(), Ok(ChecksumAlgorithm::Sha256));
        assert_eq!("sha-512".parse(), Ok(ChecksumAlgorithm::Sha512));
        assert!("md5".parse::<ChecksumAlgorithm>().is_err());
        assert_eq!(ChecksumAlgorithm::Sha512.to_string(), "sha512");
    }
}
