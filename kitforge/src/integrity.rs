//! Per-scope mapping from a logical key (an authoritative URL, or an
//! autogen-id + filename pair) to the canonical content hash recorded for it
//! in the BLOS.

use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS integrity (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    sha512 TEXT NOT NULL,
    size INTEGER NOT NULL,
    sha256 TEXT,
    blake2b TEXT,
    ref_info TEXT,
    updated_on INTEGER NOT NULL,
    PRIMARY KEY (scope, key)
);
"#;

pub struct IntegrityDb {
    conn: std::sync::Mutex<Connection>,
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

impl IntegrityDb {
    pub fn open(path: Utf8PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    fn row_to_hash(row: &rusqlite::Row) -> rusqlite::Result<ContentHash> {
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

    /// Resolve `key` within `scope`. If `expected` is supplied, verify equality
    /// with the recorded hashes before returning.
    pub fn resolve(&self, scope: &str, key: &str, expected: Option<&ContentHash>) -> Result<ContentHash> {
        let conn = self.conn.lock().expect("integrity db lock poisoned");
        let hash: Option<ContentHash> = conn
            .query_row(
                "SELECT sha512, size, sha256, blake2b FROM integrity WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                Self::row_to_hash,
            )
            .optional()?;
        let hash = hash.ok_or_else(|| Error::NotFound(format!("{scope}:{key}")))?;

        if let Some(expected) = expected {
            let bad = expected.disagreements(&hash);
            if !bad.is_empty() {
                return Err(Error::HashMismatch(bad));
            }
        }

        Ok(hash)
    }

    /// Upsert a record for `key` within `scope`.
    pub fn record(&self, scope: &str, key: &str, hash: &ContentHash, ref_info: Option<&str>) -> Result<()> {
        let sha512 = hash.sha512().ok_or_else(|| Error::InvalidRequest("record requires sha512".into()))?;
        let conn = self.conn.lock().expect("integrity db lock poisoned");
        conn.execute(
            "INSERT INTO integrity (scope, key, sha512, size, sha256, blake2b, ref_info, updated_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(scope, key) DO UPDATE SET
                sha512 = excluded.sha512, size = excluded.size, sha256 = excluded.sha256,
                blake2b = excluded.blake2b, ref_info = excluded.ref_info, updated_on = excluded.updated_on",
            params![
                scope,
                key,
                sha512,
                hash.size as i64,
                hash.digests.get(&HashKind::Sha256),
                hash.digests.get(&HashKind::Blake2b),
                ref_info,
                now_secs(),
            ],
        )?;
        Ok(())
    }

    /// Atomic swap used when upstream content has changed out from under a key.
    pub fn update(&self, scope: &str, key: &str, new_hashes: &ContentHash) -> Result<()> {
        self.record(scope, key, new_hashes, None)
    }
}
