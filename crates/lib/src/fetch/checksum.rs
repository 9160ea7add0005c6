//! Content checksums declared by formulas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  /// Legacy digests found in older formulas; kept for verification only.
  Sha1,
  Sha256,
  Sha512,
}

impl HashAlgorithm {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Sha1 => "sha1",
      Self::Sha256 => "sha256",
      Self::Sha512 => "sha512",
    }
  }

  fn hex_len(&self) -> usize {
    match self {
      Self::Sha1 => 40,
      Self::Sha256 => 64,
      Self::Sha512 => 128,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumParseError {
  #[error("unsupported checksum algorithm '{0}' (supported: sha1, sha256, sha512)")]
  UnsupportedAlgorithm(String),

  #[error("{algorithm} checksum must be {expected} hex characters, got {actual}")]
  BadLength {
    algorithm: &'static str,
    expected: usize,
    actual: usize,
  },

  #[error("checksum contains non-hex characters: {0}")]
  NotHex(String),

  #[error("cannot infer checksum algorithm from a {0}-character digest; use 'sha1:', 'sha256:' or 'sha512:'")]
  Ambiguous(usize),
}

/// A declared content digest, stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
  algorithm: HashAlgorithm,
  hex: String,
}

impl Checksum {
  pub fn new(algorithm: HashAlgorithm, hex: &str) -> Result<Self, ChecksumParseError> {
    let hex = hex.trim().to_ascii_lowercase();
    if hex.len() != algorithm.hex_len() {
      return Err(ChecksumParseError::BadLength {
        algorithm: algorithm.as_str(),
        expected: algorithm.hex_len(),
        actual: hex.len(),
      });
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(ChecksumParseError::NotHex(hex));
    }
    Ok(Self { algorithm, hex })
  }

  /// Digest `bytes` with this checksum's algorithm.
  pub fn of_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
    let hex = match algorithm {
      HashAlgorithm::Sha1 => hex::encode(Sha1::digest(bytes)),
      HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
      HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
    };
    Self { algorithm, hex }
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.algorithm
  }

  pub fn hex(&self) -> &str {
    &self.hex
  }

  /// True when `bytes` digest to this checksum.
  pub fn verify(&self, bytes: &[u8]) -> bool {
    Self::of_bytes(self.algorithm, bytes).hex == self.hex
  }

  /// Directory name used for this checksum in the source cache.
  pub fn cache_key(&self) -> String {
    format!("{}-{}", self.algorithm.as_str(), self.hex)
  }
}

impl fmt::Display for Checksum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
  }
}

impl FromStr for Checksum {
  type Err = ChecksumParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    match s.split_once(':') {
      Some((algo, hex)) => {
        let algorithm = match algo.to_ascii_lowercase().as_str() {
          "sha1" => HashAlgorithm::Sha1,
          "sha256" => HashAlgorithm::Sha256,
          "sha512" => HashAlgorithm::Sha512,
          other => return Err(ChecksumParseError::UnsupportedAlgorithm(other.to_string())),
        };
        Self::new(algorithm, hex)
      }
      None => match s.len() {
        40 => Self::new(HashAlgorithm::Sha1, s),
        64 => Self::new(HashAlgorithm::Sha256, s),
        128 => Self::new(HashAlgorithm::Sha512, s),
        other => Err(ChecksumParseError::Ambiguous(other)),
      },
    }
  }
}

impl TryFrom<String> for Checksum {
  type Error = ChecksumParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Checksum> for String {
  fn from(value: Checksum) -> Self {
    value.to_string()
  }
}
