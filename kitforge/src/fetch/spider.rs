//! Concurrent HTTP client: per-host semaphores, streaming downloads with
//! incremental hashing, in-flight download coalescing, and retry-with-backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blake2::Blake2b512;
use camino::{Utf8Path, Utf8PathBuf};
use digest::Digest;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Sha256, Sha512};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashKind};

const DEFAULT_USER_AGENT: &str = "kitforge/0.1 (+https://github.com/kitforge/kitforge)";

#[derive(Debug, Clone)]
pub struct HostCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SpiderConfig {
    pub per_host_connections: usize,
    pub max_attempts: usize,
    pub temp_dir: Utf8PathBuf,
    pub user_agent: String,
    pub host_credentials: HashMap<String, HostCredential>,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            per_host_connections: 8,
            max_attempts: 3,
            temp_dir: Utf8PathBuf::from("/tmp/kitforge-spider"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            host_credentials: HashMap::new(),
        }
    }
}

/// Outcome of a coalesced [`WebSpider::download`] call.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: Utf8PathBuf,
    pub hashes: ContentHash,
}

struct InFlight {
    sender: broadcast::Sender<std::result::Result<Download, String>>,
}

/// Guards a just-registered [`InFlight`] entry: whatever happens to the
/// future holding this guard, on drop it removes the entry and wakes any
/// subscribers. If the future is cancelled before a result is ever recorded
/// and no other caller subscribed in the meantime, the partial temp file is
/// unlinked instead of leaking.
struct InFlightCleanup<'a> {
    spider: &'a WebSpider,
    url: String,
    result: Option<std::result::Result<Download, String>>,
}

impl Drop for InFlightCleanup<'_> {
    fn drop(&mut self) {
        let in_flight = {
            let mut map = self.spider.in_flight.lock().expect("spider in-flight lock poisoned");
            map.remove(&self.url)
        };
        let Some(in_flight) = in_flight else { return };

        let cancelled = self.result.is_none();
        let no_other_awaiters = in_flight.sender.receiver_count() == 0;
        let outcome = self.result.take().unwrap_or_else(|| Err("in-flight download cancelled".to_string()));
        let _ = in_flight.sender.send(outcome);

        if cancelled && no_other_awaiters {
            let _ = std::fs::remove_file(self.spider.temp_path_for(&self.url));
        }
    }
}

pub struct WebSpider {
    client: Client,
    config: SpiderConfig,
    host_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    download_counter: AtomicU64,
}

fn is_retryable_status(status: StatusCode) -> bool {
    !matches!(status, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE)
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

impl WebSpider {
    pub fn new(config: SpiderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Configuration(format!("failed building http client: {e}")))?;
        Ok(Self {
            client,
            config,
            host_semaphores: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            download_counter: AtomicU64::new(0),
        })
    }

    fn semaphore_for(&self, url: &str) -> Arc<Semaphore> {
        let host = host_of(url);
        let mut map = self.host_semaphores.lock().expect("spider semaphore lock poisoned");
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_host_connections)))
            .clone()
    }

    fn authed_request(&self, url: &str, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let host = host_of(url);
        if let Some(cred) = self.config.host_credentials.get(&host) {
            builder.basic_auth(&cred.username, Some(&cred.password))
        } else {
            builder
        }
    }

    /// Fetch the full body of `url` as text, retrying non-4xx failures up to
    /// `max_attempts` times.
    pub async fn get_page(&self, url: &str) -> Result<String> {
        let semaphore = self.semaphore_for(url);
        let mut last_err: Option<Error> = None;

        for attempt in 1..=self.config.max_attempts {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let request = self.authed_request(url, self.client.get(url));
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .await
                        .map_err(|e| Error::fetch(url, e.to_string(), true));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry = is_retryable_status(status);
                    let err = Error::fetch(url, format!("http {status}"), retry);
                    if !retry || attempt == self.config.max_attempts {
                        return Err(err);
                    }
                    warn!(url, attempt, "fetch failed, retrying: {err}");
                    last_err = Some(err);
                }
                Err(e) => {
                    let err = Error::fetch(url, e.to_string(), true);
                    if attempt == self.config.max_attempts {
                        return Err(err);
                    }
                    warn!(url, attempt, "fetch transport error, retrying: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::fetch(url, "exhausted retries", false)))
    }

    /// Stream `url` to a temp file, computing every hash in `want_hashes` in one
    /// pass. Concurrent downloads of the same URL share a single in-flight
    /// transfer; every caller sees the same path and hashes.
    pub async fn download(&self, url: &str, want_hashes: &[HashKind]) -> Result<Download> {
        // Fast path: check (and possibly join) an in-flight transfer.
        let mut receiver = {
            let mut map = self.in_flight.lock().expect("spider in-flight lock poisoned");
            if let Some(existing) = map.get(url) {
                Some(existing.sender.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                map.insert(url.to_string(), Arc::new(InFlight { sender: tx }));
                None
            }
        };

        if let Some(rx) = receiver.take() {
            return self.await_coalesced(rx).await;
        }

        let mut cleanup = InFlightCleanup { spider: self, url: url.to_string(), result: None };
        let result = self.download_uncoalesced(url, want_hashes).await;
        cleanup.result = Some(result.clone().map_err(|e| e.to_string()));
        result
    }

    async fn await_coalesced(
        &self,
        mut rx: broadcast::Receiver<std::result::Result<Download, String>>,
    ) -> Result<Download> {
        match rx.recv().await {
            Ok(Ok(download)) => Ok(download),
            Ok(Err(msg)) => Err(Error::fetch("coalesced", msg, false)),
            Err(_) => Err(Error::fetch("coalesced", "in-flight download vanished", true)),
        }
    }

    async fn download_uncoalesced(&self, url: &str, want_hashes: &[HashKind]) -> Result<Download> {
        let semaphore = self.semaphore_for(url);
        let mut last_err: Option<Error> = None;

        for attempt in 1..=self.config.max_attempts {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            match self.try_download_once(url, want_hashes).await {
                Ok(download) => return Ok(download),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(url, attempt, "download failed, retrying: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::fetch(url, "exhausted retries", false)))
    }

    /// Each URL gets a deterministic temp path so a retry (or a crash between
    /// attempts) can resume a partial transfer with a `Range` request instead
    /// of restarting from zero.
    fn temp_path_for(&self, url: &str) -> Utf8PathBuf {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        url.hash(&mut hasher);
        self.config.temp_dir.join(format!("dl-{:016x}", hasher.finish()))
    }

    async fn try_download_once(&self, url: &str, want_hashes: &[HashKind]) -> Result<Download> {
        self.download_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = self.temp_path_for(url);

        let existing_size = tokio::fs::metadata(&temp_path).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.authed_request(url, self.client.get(url));
        if existing_size > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={existing_size}-"));
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                let retry = e.status().map(is_retryable_status).unwrap_or(true);
                Error::fetch(url, e.to_string(), retry)
            })?;

        let resuming = existing_size > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let mut hashers = StreamingHashers::new(want_hashes);
        let mut size: u64;
        let mut file = if resuming {
            let existing = tokio::fs::read(&temp_path)
                .await
                .map_err(|e| Error::Io(format!("failed reading partial {temp_path}: {e}")))?;
            size = existing.len() as u64;
            hashers.update(&existing);
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await
                .map_err(|e| Error::Io(format!("failed reopening temp file: {temp_path}: {e}")))?
        } else {
            size = 0;
            tokio::fs::File::create(&temp_path)
                .await
                .map_err(|e| Error::Io(format!("failed creating temp file: {temp_path}: {e}")))?
        };

        if existing_size > 0 && !resuming {
            debug!(url, "server ignored Range request, restarting download from scratch");
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::fetch(url, format!("stream error: {e}"), true))?;
            hashers.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Io(format!("failed writing {temp_path}: {e}")))?;
        }
        file.flush().await.map_err(|e| Error::Io(e.to_string()))?;
        debug!(url, size, resumed = resuming, "download complete");

        Ok(Download { path: temp_path, hashes: hashers.finish(size) })
    }

    /// Single-hop, non-following redirect lookup.
    pub async fn get_redirect(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e.to_string(), true))?;
        if response.status().is_redirection() {
            Ok(response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string))
        } else {
            Ok(None)
        }
    }

    /// HEAD-equivalent: request headers only, for `Content-Disposition` filename
    /// sniffing and status-only checks.
    pub async fn head(&self, url: &str) -> Result<reqwest::header::HeaderMap> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e.to_string(), true))?;
        Ok(response.headers().clone())
    }

    /// Extract a filename from a response's `Content-Disposition` header, if present.
    pub async fn head_filename(&self, url: &str) -> Result<Option<String>> {
        let headers = self.head(url).await?;
        Ok(headers
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition_filename))
    }
}

fn parse_content_disposition_filename(value: &str) -> Option<String> {
    let idx = value.find("filename=")?;
    let rest = value[idx + "filename=".len()..].trim();
    let rest = rest.trim_start_matches('"');
    let end = rest.find('"').unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Incrementally updates every digest family a download wants at once, one
/// chunk at a time, instead of buffering the whole body.
#[derive(Default)]
struct StreamingHashers {
    sha512: Option<Sha512>,
    sha256: Option<Sha256>,
    blake2b: Option<Blake2b512>,
}

impl StreamingHashers {
    fn new(wanted: &[HashKind]) -> Self {
        let want = |kind| wanted.contains(&kind);
        Self {
            sha512: want(HashKind::Sha512).then(Sha512::new),
            sha256: want(HashKind::Sha256).then(Sha256::new),
            blake2b: want(HashKind::Blake2b).then(Blake2b512::new),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        if let Some(h) = &mut self.sha512 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.sha256 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.blake2b {
            h.update(chunk);
        }
    }

    fn finish(self, size: u64) -> ContentHash {
        let mut hash = ContentHash::new(size);
        if let Some(h) = self.sha512 {
            hash.digests.insert(HashKind::Sha512, hex::encode(h.finalize()));
        }
        if let Some(h) = self.sha256 {
            hash.digests.insert(HashKind::Sha256, hex::encode(h.finalize()));
        }
        if let Some(h) = self.blake2b {
            hash.digests.insert(HashKind::Blake2b, hex::encode(h.finalize()));
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_filename_parses() {
        assert_eq!(
            parse_content_disposition_filename(r#"attachment; filename="foo.tar.gz""#),
            Some("foo.tar.gz".to_string())
        );
        assert_eq!(
            parse_content_disposition_filename("attachment; filename=foo.tar.gz"),
            Some("foo.tar.gz".to_string())
        );
        assert_eq!(parse_content_disposition_filename("attachment"), None);
    }

    #[test]
    fn retryable_status_codes() {
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::GONE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://example.com/path"), "example.com");
    }
}
