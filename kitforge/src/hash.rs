//! Content hashing primitives shared by the BLOS, the integrity DB, and the
//! manifest/metadata machinery.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use blake2::Blake2b512;
use digest::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

#[derive(Display, EnumString, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Sha512,
    Sha256,
    Blake2b,
}

impl HashKind {
    fn digest_hex(&self, data: &[u8]) -> String {
        match self {
            HashKind::Sha512 => hex_digest::<Sha512>(data),
            HashKind::Sha256 => hex_digest::<Sha256>(data),
            HashKind::Blake2b => hex_digest::<Blake2b512>(data),
        }
    }
}

fn hex_digest<D: Digest>(data: &[u8]) -> String {
    let mut hasher = D::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Filesize plus a family of cryptographic digests. Equality of the SHA-512
/// value is identity; all hashes present on both sides of a comparison must
/// agree for the objects to be considered the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHash {
    pub size: u64,
    pub digests: BTreeMap<HashKind, String>,
}

impl ContentHash {
    pub fn new(size: u64) -> Self {
        Self { size, digests: BTreeMap::new() }
    }

    pub fn with(mut self, kind: HashKind, hex: impl Into<String>) -> Self {
        self.digests.insert(kind, hex.into());
        self
    }

    pub fn sha512(&self) -> Option<&str> {
        self.digests.get(&HashKind::Sha512).map(String::as_str)
    }

    /// Compute the requested hash kinds over the given bytes plus size.
    pub fn compute(data: &[u8], kinds: &[HashKind]) -> Self {
        let mut hash = ContentHash::new(data.len() as u64);
        for kind in kinds {
            hash.digests.insert(*kind, kind.digest_hex(data));
        }
        hash
    }

    /// Compute the requested hash kinds over a file's contents.
    pub fn compute_file(path: &Path, kinds: &[HashKind]) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Io(format!("failed reading {}: {e}", path.display())))?;
        Ok(Self::compute(&data, kinds))
    }

    /// Every digest kind common to both sides must agree, and the sizes must
    /// match. Returns the set of hash kinds that disagreed, empty if none.
    pub fn disagreements(&self, other: &ContentHash) -> std::collections::HashSet<String> {
        let mut bad = std::collections::HashSet::new();
        if self.size != other.size {
            bad.insert("size".to_string());
        }
        for (kind, value) in &self.digests {
            if let Some(other_value) = other.digests.get(kind) {
                if value != other_value {
                    bad.insert(kind.to_string());
                }
            }
        }
        bad
    }

    /// Splay a SHA-512 hex digest into the BLOS's 3-level directory prefix.
    pub fn splay_path(sha512: &str) -> Option<(String, String, String)> {
        if sha512.len() < 6 {
            return None;
        }
        Some((sha512[0..2].to_string(), sha512[2..4].to_string(), sha512[4..6].to_string()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.size)?;
        for (kind, value) in &self.digests {
            write!(f, " {kind} {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_and_splay() {
        let hash = ContentHash::compute(b"hello", &[HashKind::Sha512, HashKind::Sha256]);
        assert_eq!(hash.size, 5);
        let sha512 = hash.sha512().unwrap();
        let (a, b, c) = ContentHash::splay_path(sha512).unwrap();
        assert_eq!(format!("{a}{b}{c}"), sha512[0..6]);
    }

    #[test]
    fn disagreements_ignore_missing_kinds() {
        let a = ContentHash::compute(b"data", &[HashKind::Sha512]);
        let b = ContentHash::compute(b"data", &[HashKind::Sha256]);
        assert!(a.disagreements(&b).is_empty());
    }

    #[test]
    fn disagreements_catch_mismatch() {
        let a = ContentHash::compute(b"data", &[HashKind::Sha512]);
        let b = ContentHash::compute(b"other", &[HashKind::Sha512]);
        assert!(a.disagreements(&b).contains("sha512"));
    }
}
