//! Content identifiers for DAG nodes.
//!
//! A CID is the SHA-256 digest of a node's canonical encoding. CIDs are
//! totally ordered bytewise, which is what replicas use to break priority
//! ties deterministically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::str::FromStr;

/// A 32-byte SHA-256 content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The all-zero CID. Sorts below every real digest, so it marks writes
    /// that have not been published yet.
    pub fn zero() -> Self {
        Cid([0; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lowercase hex encoding, used in datastore keys.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }

    /// Parse the output of [`Cid::to_hex`].
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (slot, pair) in bytes.iter_mut().zip(s.as_bytes().chunks_exact(2)) {
            let pair = std::str::from_utf8(pair).ok()?;
            *slot = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Cid(bytes))
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl FromStr for Cid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::from_hex(s).ok_or_else(|| format!("invalid CID: {:?}", s))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Default for Cid {
    fn default() -> Self {
        Cid::zero()
    }
}

/// Incremental SHA-256 over a node's canonical encoding.
#[derive(Default)]
pub struct Hasher {
    digest: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> Cid {
        Cid(self.digest.finalize().into())
    }

    /// One-shot digest.
    pub fn hash(data: &[u8]) -> Cid {
        Cid(Sha256::digest(data).into())
    }
}
