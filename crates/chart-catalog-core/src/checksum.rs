//! Content fingerprinting for repository indexes
//!
//! A fingerprint is a digest over the raw bytes of a repository index. The syncer
//! compares it against the last stored value to decide whether an index changed
//! since the previous pass.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use crate::error::{CatalogError, Result};

/// Supported hashing algorithms for fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    /// SHA-256 (most widely supported)
    SHA256,
    /// BLAKE3 (fastest, most modern)
    BLAKE3,
}

impl HashAlgorithm {
    /// Get the expected length of the hash in bytes
    pub fn hash_length(&self) -> usize {
        match self {
            HashAlgorithm::SHA256 => 32,
            HashAlgorithm::BLAKE3 => 32,
        }
    }

    /// Get the expected length of the hash in hexadecimal characters
    pub fn hex_length(&self) -> usize {
        self.hash_length() * 2
    }

    /// Validate that a hash string has the correct length for this algorithm
    pub fn validate_hash_format(&self, hash: &str) -> Result<()> {
        let expected_len = self.hex_length();
        let actual_len = hash.len();

        if actual_len != expected_len {
            return Err(CatalogError::InvalidChecksum(format!(
                "invalid hash length for {}: expected {} characters, got {}",
                self, expected_len, actual_len
            )));
        }

        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CatalogError::InvalidChecksum(
                "hash must be a hexadecimal string".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::SHA256 => write!(f, "SHA256"),
            HashAlgorithm::BLAKE3 => write!(f, "BLAKE3"),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::SHA256
    }
}

impl FromStr for HashAlgorithm {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::SHA256),
            "BLAKE3" => Ok(HashAlgorithm::BLAKE3),
            _ => Err(CatalogError::InvalidChecksum(format!(
                "unknown hash algorithm: {}",
                s
            ))),
        }
    }
}

/// Digest of some content together with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// The hashing algorithm used
    pub algorithm: HashAlgorithm,
    /// The hash value as a lowercase hexadecimal string
    pub value: String,
}

impl Checksum {
    /// Create a new checksum, validating the hash format for the algorithm
    pub fn new(algorithm: HashAlgorithm, value: String) -> Result<Self> {
        let normalized_value = value.to_lowercase();
        algorithm.validate_hash_format(&normalized_value)?;

        Ok(Self {
            algorithm,
            value: normalized_value,
        })
    }

    /// Returns true if both the algorithm and value match exactly.
    pub fn verify(&self, other: &Checksum) -> bool {
        self.algorithm == other.algorithm && self.value == other.value
    }

    /// Get a reference to the hash value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Get the algorithm used
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Checksum {
    type Err = CatalogError;

    /// Parse the `ALGORITHM:hex` form produced by `Display`
    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, value) = s.split_once(':').ok_or_else(|| {
            CatalogError::InvalidChecksum(format!("expected ALGORITHM:hex, got {}", s))
        })?;
        Checksum::new(algorithm.parse()?, value.to_string())
    }
}

/// Computes fingerprints over raw index bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fingerprinter {
    algorithm: HashAlgorithm,
}

impl Fingerprinter {
    /// Create a fingerprinter for the given algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Algorithm used by this fingerprinter
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Fingerprint an in-memory buffer
    pub fn fingerprint(&self, data: &[u8]) -> Checksum {
        let value = match self.algorithm {
            HashAlgorithm::SHA256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                format!("{:x}", hasher.finalize())
            }
            HashAlgorithm::BLAKE3 => blake3::hash(data).to_hex().to_string(),
        };

        Checksum {
            algorithm: self.algorithm,
            value,
        }
    }

    /// Fingerprint everything readable from `reader`.
    ///
    /// Read failures are returned unchanged as I/O errors.
    pub fn fingerprint_reader<R: Read>(&self, mut reader: R) -> std::io::Result<Checksum> {
        let mut buf = [0u8; 8192];
        let value = match self.algorithm {
            HashAlgorithm::SHA256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                format!("{:x}", hasher.finalize())
            }
            HashAlgorithm::BLAKE3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hasher.finalize().to_hex().to_string()
            }
        };

        Ok(Checksum {
            algorithm: self.algorithm,
            value,
        })
    }
}

/// Fingerprint bytes with the default algorithm (SHA-256)
pub fn fingerprint(data: &[u8]) -> Checksum {
    Fingerprinter::default().fingerprint(data)
}
