//! Declared checksums: `algorithm:hex`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumParseError {
    #[error("checksum '{0}' is missing the 'algorithm:' prefix (expected sha256:<hex> or blake3:<hex>)")]
    MissingAlgorithm(String),
    #[error("unsupported checksum algorithm '{0}' (supported: sha256, blake3)")]
    UnsupportedAlgorithm(String),
    #[error("checksum digest for {algorithm} must be {expected} hex characters, got '{digest}'")]
    InvalidDigest {
        algorithm: ChecksumAlgorithm,
        expected: usize,
        digest: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pinned digest. The hex part is always stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, ChecksumParseError> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumParseError::InvalidDigest {
                algorithm,
                expected: algorithm.hex_len(),
                digest,
            });
        }
        Ok(Self { algorithm, digest })
    }

    pub fn sha256(digest: &str) -> Result<Self, ChecksumParseError> {
        Self::new(ChecksumAlgorithm::Sha256, digest)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, digest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ChecksumParseError::MissingAlgorithm(s.to_owned()))?;
        let algorithm = match algo.to_ascii_lowercase().as_str() {
            "sha256" => ChecksumAlgorithm::Sha256,
            "blake3" => ChecksumAlgorithm::Blake3,
            other => return Err(ChecksumParseError::UnsupportedAlgorithm(other.to_owned())),
        };
        Self::new(algorithm, digest)
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}
