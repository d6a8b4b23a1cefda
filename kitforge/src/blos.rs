//! Base Layer Object Store: content-addressed storage of immutable blobs on disk,
//! indexed by SHA-512, with a record store tracking the full hash bundle known
//! for each object.

use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStrategy {
    None,
    Desired,
    All,
}

#[derive(Debug, Clone)]
pub struct BlosConfig {
    pub required_client_hashes: HashSet<HashKind>,
    pub required_record_hashes: HashSet<HashKind>,
    pub desired_hashes: HashSet<HashKind>,
    pub disk_verify_hashes: HashSet<HashKind>,
    pub backfill_strategy: BackfillStrategy,
}

impl Default for BlosConfig {
    fn default() -> Self {
        Self {
            required_client_hashes: HashSet::from([HashKind::Sha512]),
            required_record_hashes: HashSet::from([HashKind::Sha512]),
            desired_hashes: HashSet::from([HashKind::Sha512, HashKind::Blake2b, HashKind::Sha256]),
            disk_verify_hashes: HashSet::from([HashKind::Sha512]),
            backfill_strategy: BackfillStrategy::Desired,
        }
    }
}

/// Reference to a successfully resolved BLOS object.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub disk_path: Utf8PathBuf,
    pub verified_hashes: HashSet<HashKind>,
}

pub struct HashingStore {
    root: Utf8PathBuf,
    config: BlosConfig,
    conn: std::sync::Mutex<Connection>,
}

impl HashingStore {
    pub fn open(root: Utf8PathBuf, config: BlosConfig) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let conn = Connection::open(root.join("blos.sqlite"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects (
                sha512 TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                sha256 TEXT,
                blake2b TEXT
            )",
        )?;
        Ok(Self { root, config, conn: std::sync::Mutex::new(conn) })
    }

    /// The splayed on-disk path for a given SHA-512 digest: `<root>/xx/yy/zz/<sha512>`.
    pub fn disk_path(&self, sha512: &str) -> Result<Utf8PathBuf> {
        let (a, b, c) = ContentHash::splay_path(sha512)
            .ok_or_else(|| Error::InvalidRequest(format!("invalid sha512: {sha512}")))?;
        Ok(self.root.join(a).join(b).join(c).join(sha512))
    }

    fn record_to_hash(row: &rusqlite::Row) -> rusqlite::Result<ContentHash> {
        let sha512: String = row.get("sha512")?;
        let size: i64 = row.get("size")?;
        let sha256: Option<String> = row.get("sha256")?;
        let blake2b: Option<String> = row.get("blake2b")?;
        let mut hash = ContentHash::new(size as u64).with(HashKind::Sha512, sha512);
        if let Some(v) = sha256 {
            hash = hash.with(HashKind::Sha256, v);
        }
        if let Some(v) = blake2b {
            hash = hash.with(HashKind::Blake2b, v);
        }
        Ok(hash)
    }

    fn load_record(&self, sha512: &str) -> Result<Option<ContentHash>> {
        let conn = self.conn.lock().expect("blos db lock poisoned");
        conn.query_row(
            "SELECT sha512, size, sha256, blake2b FROM objects WHERE sha512 = ?1",
            params![sha512],
            Self::record_to_hash,
        )
        .optional()
        .map_err(Error::from)
    }

    fn upsert_record(&self, hash: &ContentHash) -> Result<()> {
        let sha512 = hash.sha512().ok_or_else(|| Error::InvalidRequest("missing sha512".into()))?;
        let conn = self.conn.lock().expect("blos db lock poisoned");
        conn.execute(
            "INSERT INTO objects (sha512, size, sha256, blake2b) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sha512) DO UPDATE SET
               size = excluded.size,
               sha256 = COALESCE(objects.sha256, excluded.sha256),
               blake2b = COALESCE(objects.blake2b, excluded.blake2b)",
            params![
                sha512,
                hash.size as i64,
                hash.digests.get(&HashKind::Sha256),
                hash.digests.get(&HashKind::Blake2b),
            ],
        )?;
        Ok(())
    }

    /// Hard-link `temp_path` into the store under its SHA-512, recording the
    /// given (possibly partial) hash bundle. Idempotent: inserting the same
    /// object twice succeeds without error, keeping the richer of the two
    /// hash records.
    pub fn insert(&self, temp_path: &Utf8Path, pregen_hashes: &ContentHash) -> Result<ObjectRef> {
        let missing: HashSet<_> = self
            .config
            .required_client_hashes
            .iter()
            .filter(|k| !pregen_hashes.digests.contains_key(k))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "missing hashes in insert request: {missing:?}"
            )));
        }

        let sha512 = pregen_hashes
            .sha512()
            .ok_or_else(|| Error::InvalidRequest("insert requires sha512".into()))?;
        let disk_path = self.disk_path(sha512)?;

        if let Some(parent) = disk_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::hard_link(temp_path, &disk_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Racing inserts of the same object are idempotent: any winner is accepted.
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("source file not found: {temp_path}")));
            }
            Err(e) => return Err(e.into()),
        }

        self.upsert_record(pregen_hashes)?;
        Ok(ObjectRef { disk_path, verified_hashes: pregen_hashes.digests.keys().copied().collect() })
    }

    /// Resolve an object by its caller-supplied hashes, verifying that
    /// caller, record, and on-disk bytes all agree on every hash kind they
    /// have in common.
    pub fn get(&self, caller_hashes: &ContentHash) -> Result<ObjectRef> {
        let missing: HashSet<_> = self
            .config
            .required_client_hashes
            .iter()
            .filter(|k| !caller_hashes.digests.contains_key(k))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "missing hashes in get request: {missing:?}"
            )));
        }

        let sha512 = caller_hashes
            .sha512()
            .ok_or_else(|| Error::InvalidRequest("get requires sha512".into()))?;
        let disk_path = self.disk_path(sha512)?;
        if !disk_path.exists() {
            return Err(Error::NotFound(format!("object not on disk: {sha512}")));
        }

        let record = self
            .load_record(sha512)?
            .ok_or_else(|| Error::NotFound(format!("object on disk but no record: {sha512}")))?;

        let missing_record: HashSet<_> = self
            .config
            .required_record_hashes
            .iter()
            .filter(|k| !record.digests.contains_key(k))
            .collect();
        if self.config.backfill_strategy == BackfillStrategy::None && !missing_record.is_empty() {
            return Err(Error::IncompleteRecord(format!(
                "record missing required hashes: {missing_record:?}"
            )));
        }

        let disk_hash = ContentHash::compute_file(
            disk_path.as_std_path(),
            &self.config.disk_verify_hashes.iter().copied().collect::<Vec<_>>(),
        )?;

        let mut corrupt = false;
        let mut invalid = HashSet::new();
        let mut verified = HashSet::new();

        for (kind, caller_value) in &caller_hashes.digests {
            let Some(record_value) = record.digests.get(kind) else { continue };
            verified.insert(*kind);
            if let Some(disk_value) = disk_hash.digests.get(kind) {
                if caller_value == record_value && record_value == disk_value {
                    continue;
                }
                if record_value != disk_value {
                    corrupt = true;
                }
                invalid.insert(kind.to_string());
            } else if caller_value == record_value {
                continue;
            } else {
                invalid.insert(kind.to_string());
            }
        }
        if caller_hashes.size != record.size {
            invalid.insert("size".to_string());
        }
        if disk_hash.size != record.size {
            corrupt = true;
            invalid.insert("size".to_string());
        }

        if corrupt {
            let _ = fs::remove_file(&disk_path);
            return Err(Error::Corruption(format!("{sha512}: {invalid:?}")));
        } else if !invalid.is_empty() {
            return Err(Error::HashMismatch(invalid));
        }

        if self.config.backfill_strategy != BackfillStrategy::None {
            let mut backfilled = record.clone();
            let wanted: Vec<HashKind> = self
                .config
                .desired_hashes
                .iter()
                .filter(|k| !record.digests.contains_key(k))
                .copied()
                .collect();
            if !wanted.is_empty() {
                let fresh = ContentHash::compute_file(disk_path.as_std_path(), &wanted)?;
                backfilled.digests.extend(fresh.digests);
                self.upsert_record(&backfilled)?;
            }
        }

        Ok(ObjectRef { disk_path, verified_hashes: verified })
    }

    /// Administrative removal of an object and its record.
    pub fn delete(&self, sha512: &str) -> Result<()> {
        let disk_path = self.disk_path(sha512)?;
        if disk_path.exists() {
            fs::remove_file(&disk_path)?;
        }
        let conn = self.conn.lock().expect("blos db lock poisoned");
        conn.execute("DELETE FROM objects WHERE sha512 = ?1", params![sha512])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, HashingStore) {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("blos")).unwrap();
        let store = HashingStore::open(root, BlosConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let (dir, store) = store();
        let tmp = Utf8PathBuf::from_path_buf(dir.path().join("src")).unwrap();
        std::fs::write(&tmp, b"payload").unwrap();
        let hash = ContentHash::compute(b"payload", &[HashKind::Sha512]);

        let inserted = store.insert(&tmp, &hash).unwrap();
        assert!(inserted.disk_path.exists());

        let got = store.get(&hash).unwrap();
        assert_eq!(got.disk_path, inserted.disk_path);
    }

    #[test]
    fn corrupt_object_is_quarantined() {
        let (dir, store) = store();
        let tmp = Utf8PathBuf::from_path_buf(dir.path().join("src")).unwrap();
        std::fs::write(&tmp, b"payload").unwrap();
        let hash = ContentHash::compute(b"payload", &[HashKind::Sha512]);
        let obj = store.insert(&tmp, &hash).unwrap();

        std::fs::write(&obj.disk_path, b"tampered").unwrap();

        let err = store.get(&hash).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert!(!obj.disk_path.exists());
    }

    #[test]
    fn caller_wrong_hash_is_mismatch_not_corruption_when_record_matches_disk() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("blos")).unwrap();
        let mut config = BlosConfig::default();
        config.disk_verify_hashes.insert(HashKind::Sha256);
        let store = HashingStore::open(root, config).unwrap();

        let tmp = Utf8PathBuf::from_path_buf(dir.path().join("src")).unwrap();
        std::fs::write(&tmp, b"payload").unwrap();
        let hash = ContentHash::compute(b"payload", &[HashKind::Sha512, HashKind::Sha256]);
        let obj = store.insert(&tmp, &hash).unwrap();

        let mut wrong_caller = hash.clone();
        wrong_caller.digests.insert(HashKind::Sha256, "0".repeat(64));

        let err = store.get(&wrong_caller).unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)));
        assert!(obj.disk_path.exists(), "a caller/record disagreement must not touch the object on disk");
    }

    #[test]
    fn insert_requires_sha512() {
        let (dir, store) = store();
        let tmp = Utf8PathBuf::from_path_buf(dir.path().join("src")).unwrap();
        std::fs::write(&tmp, b"payload").unwrap();
        let hash = ContentHash::compute(b"payload", &[HashKind::Sha256]);
        let err = store.insert(&tmp, &hash).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn get_not_found() {
        let (_dir, store) = store();
        let hash = ContentHash::compute(b"nonexistent", &[HashKind::Sha512]);
        let err = store.get(&hash).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
