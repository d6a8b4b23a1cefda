//! Process-wide configuration and shared service handles.
//!
//! This replaces the mutable, dynamically-augmented "hub" object of the
//! system this engine is modeled on with an explicit, immutable-after-
//! construction [`Context`] that is handed to components by [`Arc`] rather
//! than reached for through ambient/global state.

use std::env;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::autogen::registry::GeneratorRegistry;
use crate::blos::{BlosConfig, HashingStore};
use crate::error::Result;
use crate::fetch::cache::FetchCache;
use crate::fetch::spider::{SpiderConfig, WebSpider};
use crate::integrity::IntegrityDb;

/// XDG-style resolved directories for a named application.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub cache: Utf8PathBuf,
    pub config: Utf8PathBuf,
    pub data: Utf8PathBuf,
    pub db: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
}

impl ConfigPaths {
    pub fn new(name: &str) -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/root".to_string());

        let cache = match env::var("XDG_CACHE_HOME") {
            Ok(x) => Utf8PathBuf::from(x).join(name),
            Err(_) => Utf8PathBuf::from(home.clone()).join(".cache").join(name),
        };
        let config = match env::var("XDG_CONFIG_HOME") {
            Ok(x) => Utf8PathBuf::from(x).join(name),
            Err(_) => Utf8PathBuf::from(home.clone()).join(".config").join(name),
        };
        let data = match env::var("XDG_DATA_HOME") {
            Ok(x) => Utf8PathBuf::from(x).join(name),
            Err(_) => Utf8PathBuf::from(home.clone()).join(".local/share").join(name),
        };
        let db = data.join("db");
        let tmp = cache.join("tmp");

        Self { cache, config, data, db, tmp }
    }

    /// Override every path to live under a single root; used by tests and by the CLI's
    /// `--root` flag to sandbox a whole run.
    pub fn rooted(root: &Utf8PathBuf) -> Self {
        Self {
            cache: root.join("cache"),
            config: root.join("config"),
            data: root.join("data"),
            db: root.join("db"),
            tmp: root.join("tmp"),
        }
    }
}

/// Operational knobs that aren't paths: concurrency limits, fetch policy defaults,
/// and the `doit --immediate` override.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub autogen_workers: usize,
    pub per_host_connections: usize,
    pub fetch_attempts: usize,
    pub fetch_cache_interval: Option<std::time::Duration>,
    /// Forces `refresh_interval = Some(Duration::ZERO)` for the whole run, the
    /// equivalent of the original `doit --immediate` flag.
    pub immediate: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            autogen_workers: 16,
            per_host_connections: 8,
            fetch_attempts: 3,
            fetch_cache_interval: Some(std::time::Duration::from_secs(15 * 60)),
            immediate: false,
        }
    }
}

impl EngineSettings {
    /// The effective refresh interval for a fetch, honoring `--immediate`.
    pub fn effective_refresh_interval(
        &self,
        explicit: Option<std::time::Duration>,
    ) -> Option<std::time::Duration> {
        if self.immediate {
            Some(std::time::Duration::ZERO)
        } else {
            explicit.or(self.fetch_cache_interval)
        }
    }
}

/// Shared handle carrying every long-lived service the engine's components need:
/// the content store, the fetch cache, the spider, the integrity DB, an HTTP
/// client, and the generator registry. Constructed once per process and passed
/// around as an `Arc<Context>`.
pub struct Context {
    pub paths: ConfigPaths,
    pub settings: EngineSettings,
    pub blos: HashingStore,
    pub fetch_cache: FetchCache,
    pub integrity: IntegrityDb,
    pub spider: WebSpider,
    pub generators: GeneratorRegistry,
}

impl Context {
    pub fn new(name: &str, settings: EngineSettings) -> Result<Arc<Self>> {
        let paths = ConfigPaths::new(name);
        Self::build(paths, settings)
    }

    pub fn rooted(root: &Utf8PathBuf, settings: EngineSettings) -> Result<Arc<Self>> {
        let paths = ConfigPaths::rooted(root);
        Self::build(paths, settings)
    }

    fn build(paths: ConfigPaths, settings: EngineSettings) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&paths.cache)?;
        std::fs::create_dir_all(&paths.db)?;
        std::fs::create_dir_all(&paths.tmp)?;

        let blos = HashingStore::open(paths.data.join("blos"), BlosConfig::default())?;
        let fetch_cache = FetchCache::open(paths.db.join("fetch_cache.sqlite"))?;
        let integrity = IntegrityDb::open(paths.db.join("integrity.sqlite"))?;
        let spider = WebSpider::new(SpiderConfig {
            per_host_connections: settings.per_host_connections,
            max_attempts: settings.fetch_attempts,
            temp_dir: paths.tmp.join("spider_temp"),
            ..SpiderConfig::default()
        })?;
        let generators = GeneratorRegistry::default();

        Ok(Arc::new(Self { paths, settings, blos, fetch_cache, integrity, spider, generators }))
    }
}
