//! Durable cache of HTTP responses, keyed by `(method_name, url, kwargs_digest)`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fetch_cache (
    method_name TEXT NOT NULL,
    url TEXT NOT NULL,
    kwargs_digest TEXT NOT NULL,
    body BLOB,
    fetched_on INTEGER,
    last_failure_on INTEGER,
    last_failure_reason TEXT,
    PRIMARY KEY (method_name, url, kwargs_digest)
);
CREATE INDEX IF NOT EXISTS idx_fetch_cache_url ON fetch_cache(url);
"#;

pub struct CacheEntry {
    pub body: Vec<u8>,
    pub fetched_on: SystemTime,
}

pub struct FetchCache {
    conn: std::sync::Mutex<Connection>,
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Digest a kwargs map into a stable key component. Order-independent because
/// `serde_json::Value::Object` is compared/serialized with sorted keys here.
pub fn kwargs_digest(kwargs: &Value) -> String {
    let mut map: std::collections::BTreeMap<String, Value> = Default::default();
    if let Value::Object(obj) = kwargs {
        for (k, v) in obj {
            map.insert(k.clone(), v.clone());
        }
    }
    let canonical = serde_json::to_string(&map).unwrap_or_default();
    crate::hash::ContentHash::compute(canonical.as_bytes(), &[crate::hash::HashKind::Sha256])
        .digests
        .get(&crate::hash::HashKind::Sha256)
        .cloned()
        .unwrap_or_default()
}

impl FetchCache {
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

    /// Read a cached response. Returns `None` (a cache miss) if no record exists, or if
    /// `refresh_interval`/`max_age` rule out the existing record's age.
    pub fn read(
        &self,
        method: &str,
        url: &str,
        kwargs: &Value,
        max_age: Option<Duration>,
        refresh_interval: Option<Duration>,
    ) -> Result<Option<CacheEntry>> {
        let digest = kwargs_digest(kwargs);
        let conn = self.conn.lock().expect("fetch cache lock poisoned");
        let row: Option<(Option<Vec<u8>>, Option<i64>)> = conn
            .query_row(
                "SELECT body, fetched_on FROM fetch_cache
                 WHERE method_name = ?1 AND url = ?2 AND kwargs_digest = ?3",
                params![method, url, digest],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((Some(body), Some(fetched_on))) = row else { return Ok(None) };
        let age = now_secs() - fetched_on;
        if age < 0 {
            return Ok(None);
        }
        if let Some(refresh) = refresh_interval {
            if age as u64 > refresh.as_secs() {
                return Ok(None);
            }
        }
        if let Some(max) = max_age {
            if age as u64 > max.as_secs() {
                return Ok(None);
            }
        }

        Ok(Some(CacheEntry {
            body,
            fetched_on: UNIX_EPOCH + Duration::from_secs(fetched_on as u64),
        }))
    }

    /// Upsert a fresh response body, stamping `fetched_on = now`.
    pub fn write(&self, method: &str, url: &str, kwargs: &Value, body: &[u8]) -> Result<()> {
        let digest = kwargs_digest(kwargs);
        let conn = self.conn.lock().expect("fetch cache lock poisoned");
        conn.execute(
            "INSERT INTO fetch_cache (method_name, url, kwargs_digest, body, fetched_on)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(method_name, url, kwargs_digest) DO UPDATE SET
                body = excluded.body, fetched_on = excluded.fetched_on,
                last_failure_on = NULL, last_failure_reason = NULL",
            params![method, url, digest, body, now_secs()],
        )?;
        Ok(())
    }

    /// Record a fetch failure without touching any previously cached body.
    pub fn record_failure(&self, method: &str, url: &str, kwargs: &Value, reason: &str) -> Result<()> {
        let digest = kwargs_digest(kwargs);
        let conn = self.conn.lock().expect("fetch cache lock poisoned");
        conn.execute(
            "INSERT INTO fetch_cache (method_name, url, kwargs_digest, last_failure_on, last_failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(method_name, url, kwargs_digest) DO UPDATE SET
                last_failure_on = excluded.last_failure_on,
                last_failure_reason = excluded.last_failure_reason",
            params![method, url, digest, now_secs(), reason],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_read_roundtrips() {
        let cache = FetchCache::open_in_memory().unwrap();
        let kwargs = json!({});
        cache.write("get_page", "https://example/x", &kwargs, b"hello").unwrap();
        let entry = cache
            .read("get_page", "https://example/x", &kwargs, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(entry.body, b"hello");
    }

    #[test]
    fn refresh_interval_exhausted_is_miss() {
        let cache = FetchCache::open_in_memory().unwrap();
        let kwargs = json!({});
        cache.write("get_page", "https://example/x", &kwargs, b"hello").unwrap();
        // backdate fetched_on to simulate a stale entry
        {
            let conn = cache.conn.lock().unwrap();
            conn.execute(
                "UPDATE fetch_cache SET fetched_on = fetched_on - 1000",
                [],
            )
            .unwrap();
        }
        let miss = cache
            .read(
                "get_page",
                "https://example/x",
                &kwargs,
                None,
                Some(Duration::from_secs(60)),
            )
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn missing_record_is_miss() {
        let cache = FetchCache::open_in_memory().unwrap();
        let kwargs = json!({});
        let miss = cache.read("get_page", "https://nope", &kwargs, None, None).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn record_failure_does_not_touch_body() {
        let cache = FetchCache::open_in_memory().unwrap();
        let kwargs = json!({});
        cache.write("get_page", "https://example/x", &kwargs, b"hello").unwrap();
        cache
            .record_failure("get_page", "https://example/x", &kwargs, "timeout")
            .unwrap();
        let entry = cache
            .read("get_page", "https://example/x", &kwargs, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(entry.body, b"hello");
    }
}
