//! Policy layer tying [`crate::fetch::cache::FetchCache`] and
//! [`crate::fetch::spider::WebSpider`] together: try the cache within its
//! refresh window, else fetch live and write the cache, falling back to a
//! possibly-stale cache entry (bounded by `max_age`) if the live fetch fails.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fetch::cache::FetchCache;
use crate::fetch::spider::WebSpider;

pub struct FetchHarness<'a> {
    spider: &'a WebSpider,
    cache: &'a FetchCache,
}

/// Per-call override of the ambient refresh/max-age defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPolicy {
    pub refresh_interval: Option<Duration>,
    pub max_age: Option<Duration>,
}

impl<'a> FetchHarness<'a> {
    pub fn new(spider: &'a WebSpider, cache: &'a FetchCache) -> Self {
        Self { spider, cache }
    }

    /// Fetch `url` as text, consulting the cache first. On a live-fetch
    /// failure, falls back to a cached body no older than `policy.max_age`
    /// before giving up.
    pub async fn get_page(&self, url: &str, kwargs: &Value, policy: FetchPolicy) -> Result<String> {
        if let Some(entry) = self.cache.read("get_page", url, kwargs, None, policy.refresh_interval)? {
            debug!(url, "cache hit within refresh window");
            return Ok(String::from_utf8_lossy(&entry.body).into_owned());
        }

        match self.spider.get_page(url).await {
            Ok(body) => {
                self.cache.write("get_page", url, kwargs, body.as_bytes())?;
                Ok(body)
            }
            Err(live_err) => self.fallback_or_fail(url, kwargs, policy, live_err).await,
        }
    }

    /// Like [`FetchHarness::get_page`], but parses the result as JSON. A
    /// live response that fails to parse is treated the same as a live-fetch
    /// failure: fall back to the cache rather than propagate a parse error
    /// for data that may have briefly been served malformed upstream.
    pub async fn get_json(&self, url: &str, kwargs: &Value, policy: FetchPolicy) -> Result<Value> {
        if let Some(entry) = self.cache.read("get_page", url, kwargs, None, policy.refresh_interval)? {
            if let Ok(value) = serde_json::from_slice::<Value>(&entry.body) {
                debug!(url, "cache hit within refresh window");
                return Ok(value);
            }
        }

        match self.spider.get_page(url).await {
            Ok(body) => match serde_json::from_str::<Value>(&body) {
                Ok(value) => {
                    self.cache.write("get_page", url, kwargs, body.as_bytes())?;
                    Ok(value)
                }
                Err(parse_err) => {
                    warn!(url, "live response failed to parse as json, falling back to cache: {parse_err}");
                    self.json_from_stale_cache(url, kwargs, policy)
                        .await
                        .map_err(|_| Error::fetch(url, format!("invalid json: {parse_err}"), false))
                }
            },
            Err(live_err) => {
                let fallback = self.json_from_stale_cache(url, kwargs, policy).await;
                fallback.map_err(|_| live_err)
            }
        }
    }

    async fn json_from_stale_cache(&self, url: &str, kwargs: &Value, policy: FetchPolicy) -> Result<Value> {
        let entry = self
            .cache
            .read("get_page", url, kwargs, policy.max_age, None)?
            .ok_or_else(|| Error::NotFound(format!("no cache fallback for {url}")))?;
        serde_json::from_slice(&entry.body).map_err(Error::from)
    }

    async fn fallback_or_fail(
        &self,
        url: &str,
        kwargs: &Value,
        policy: FetchPolicy,
        live_err: Error,
    ) -> Result<String> {
        if let Some(entry) = self.cache.read("get_page", url, kwargs, policy.max_age, None)? {
            warn!(url, "live fetch failed, serving stale cache entry: {live_err}");
            return Ok(String::from_utf8_lossy(&entry.body).into_owned());
        }
        self.cache.record_failure("get_page", url, kwargs, &live_err.to_string())?;
        Err(live_err)
    }

    /// Resolve a redirect chain's terminal URL, one hop.
    pub async fn resolve_redirect(&self, url: &str) -> Result<Option<String>> {
        self.spider.get_redirect(url).await
    }

    /// Stream-download `url` with hash computation, bypassing the text/JSON
    /// cache entirely (artifact bytes live in the BLOS, not here).
    pub async fn download_via_spider(
        &self,
        url: &str,
        want_hashes: &[crate::hash::HashKind],
    ) -> Result<crate::fetch::spider::Download> {
        self.spider.download(url, want_hashes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::spider::SpiderConfig;
    use camino::Utf8PathBuf;
    use serde_json::json;

    fn harness_parts(tmp: &tempfile::TempDir) -> (WebSpider, FetchCache) {
        let spider = WebSpider::new(SpiderConfig {
            temp_dir: Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap(),
            ..SpiderConfig::default()
        })
        .unwrap();
        let cache = FetchCache::open_in_memory().unwrap();
        (spider, cache)
    }

    #[tokio::test]
    async fn cache_hit_within_refresh_window_skips_network() {
        let tmp = tempfile::tempdir().unwrap();
        let (spider, cache) = harness_parts(&tmp);
        let kwargs = json!({});
        cache.write("get_page", "https://example/x", &kwargs, b"cached body").unwrap();
        let harness = FetchHarness::new(&spider, &cache);
        let policy = FetchPolicy { refresh_interval: Some(Duration::from_secs(3600)), max_age: None };
        let body = harness.get_page("https://example/x", &kwargs, policy).await.unwrap();
        assert_eq!(body, "cached body");
    }

    #[tokio::test]
    async fn json_falls_back_to_cache_on_parse_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (spider, cache) = harness_parts(&tmp);
        let kwargs = json!({});
        cache
            .write("get_page", "https://example/good.json", &kwargs, br#"{"ok":true}"#)
            .unwrap();
        let harness = FetchHarness::new(&spider, &cache);
        // No refresh window, so this goes straight to live fetch, which will fail
        // (no real network in tests) and fall back to the cached, valid JSON via max_age.
        let policy = FetchPolicy { refresh_interval: None, max_age: Some(Duration::from_secs(86_400)) };
        let value = harness.get_json("https://example/good.json", &kwargs, policy).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }
}
