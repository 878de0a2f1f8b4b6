//! Subresource-integrity style content fingerprints (`sha256-<base64>`).

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::PatchError;

/// Content at or above this size is hashed on a blocking worker.
const OFFLOAD_THRESHOLD: usize = 1024 * 1024;

/// Hash algorithms understood in integrity strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hash-algorithm-prefixed, base64-encoded digest naming a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Integrity {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

impl Integrity {
    /// Hash `data` with SHA-256.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::with_algorithm(HashAlgorithm::Sha256, data)
    }

    pub fn with_algorithm(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }

    /// Hash owned content, moving large buffers onto the blocking pool.
    ///
    /// The buffer is handed back so callers can keep using it without a copy.
    pub async fn compute(data: Vec<u8>) -> Result<(Self, Vec<u8>), PatchError> {
        if data.len() < OFFLOAD_THRESHOLD {
            let integrity = Self::from_bytes(&data);
            return Ok((integrity, data));
        }

        tokio::task::spawn_blocking(move || {
            let integrity = Self::from_bytes(&data);
            (integrity, data)
        })
        .await
        .map_err(|e| PatchError::Internal(format!("Hashing task failed: {}", e)))
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex form of the digest, used for content-store paths.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Whether `data` hashes to this integrity value under the same algorithm.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.digest
    }

    /// Like [`Integrity::matches`] but reports the observed value on mismatch.
    pub fn check(&self, data: &[u8]) -> Result<(), PatchError> {
        let actual = Self::with_algorithm(self.algorithm, data);
        if actual.digest == self.digest {
            Ok(())
        } else {
            Err(PatchError::IntegrityMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, STANDARD.encode(&self.digest))
    }
}

impl FromStr for Integrity {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // SRI allows several space separated hashes and `?opt` suffixes; the
        // first entry is the one we store.
        let first = s
            .split_whitespace()
            .next()
            .ok_or_else(|| PatchError::InvalidIntegrity("empty integrity string".to_string()))?;
        let first = first.split('?').next().unwrap_or(first);

        let (algo, encoded) = first
            .split_once('-')
            .ok_or_else(|| PatchError::InvalidIntegrity(format!("missing algorithm in {}", s)))?;

        let algorithm = match algo {
            "sha256" => HashAlgorithm::Sha256,
            "sha512" => HashAlgorithm::Sha512,
            other => {
                return Err(PatchError::InvalidIntegrity(format!(
                    "unsupported algorithm {}",
                    other
                )))
            }
        };

        let digest = STANDARD
            .decode(encoded)
            .map_err(|e| PatchError::InvalidIntegrity(format!("bad base64 in {}: {}", s, e)))?;

        if digest.len() != algorithm.digest_len() {
            return Err(PatchError::InvalidIntegrity(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                digest.len()
            )));
        }

        Ok(Self { algorithm, digest })
    }
}

impl TryFrom<String> for Integrity {
    type Error = PatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Integrity> for String {
    fn from(value: Integrity) -> Self {
        value.to_string()
    }
}
