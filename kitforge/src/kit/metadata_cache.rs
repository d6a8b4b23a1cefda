//! Per-`(kit, branch)` JSON cache of ebuild metadata, keyed by atom, with
//! freshness gated on `(ebuild_md5, manifest_md5, eclass_hashes)`.

use std::collections::HashSet;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::files::atomic_write_file;

const CACHE_DATA_VERSION: &str = "1.0.6";

/// A single atom's cached metadata: the AUXDB field dict, the pre-rendered
/// `metadata/md5-cache/<atom>` block, and the freshness fingerprint it was
/// computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitMetadataRecord {
    pub ebuild_md5: String,
    pub manifest_md5: Option<String>,
    pub eclass_hashes: Vec<(String, String)>,
    pub metadata: IndexMap<String, String>,
    pub metadata_out: String,
    #[serde(default)]
    pub licenses: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    cache_data_version: String,
    atoms: IndexMap<String, KitMetadataRecord>,
}

pub struct KitMetadataCache {
    path: Utf8PathBuf,
    atoms: Mutex<IndexMap<String, KitMetadataRecord>>,
    retrieved: Mutex<HashSet<String>>,
    writes: Mutex<HashSet<String>>,
}

impl KitMetadataCache {
    /// Load the cache file at `path`, treating a version mismatch or
    /// missing/corrupt file as an empty cache.
    pub fn load(path: Utf8PathBuf) -> Result<Self> {
        let atoms = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<CacheFile>(&text) {
                Ok(file) if file.cache_data_version == CACHE_DATA_VERSION => file.atoms,
                _ => IndexMap::new(),
            },
            Err(_) => IndexMap::new(),
        };
        Ok(Self {
            path,
            atoms: Mutex::new(atoms),
            retrieved: Mutex::new(HashSet::new()),
            writes: Mutex::new(HashSet::new()),
        })
    }

    /// Return the cached record for `atom` iff it matches the current
    /// `(ebuild_md5, manifest_md5, eclass_hashes)` fingerprint; otherwise a
    /// miss, even if a (now stale) record exists.
    pub fn get(
        &self,
        atom: &str,
        ebuild_md5: &str,
        manifest_md5: Option<&str>,
        eclass_hashes: &[(String, String)],
    ) -> Option<KitMetadataRecord> {
        let atoms = self.atoms.lock().expect("metadata cache lock poisoned");
        let record = atoms.get(atom)?;
        let fresh = record.ebuild_md5 == ebuild_md5
            && record.manifest_md5.as_deref() == manifest_md5
            && record.eclass_hashes == eclass_hashes;
        if fresh {
            self.retrieved.lock().expect("retrieved lock poisoned").insert(atom.to_string());
            Some(record.clone())
        } else {
            None
        }
    }

    pub fn put(&self, atom: &str, record: KitMetadataRecord) {
        self.atoms.lock().expect("metadata cache lock poisoned").insert(atom.to_string(), record);
        self.writes.lock().expect("writes lock poisoned").insert(atom.to_string());
    }

    /// Write the cache atomically. If `prune`, drop any atom neither
    /// retrieved nor written to in this run.
    pub fn save(&self, prune: bool) -> Result<()> {
        let mut atoms = self.atoms.lock().expect("metadata cache lock poisoned").clone();
        if prune {
            let retrieved = self.retrieved.lock().expect("retrieved lock poisoned");
            let writes = self.writes.lock().expect("writes lock poisoned");
            atoms.retain(|atom, _| retrieved.contains(atom) || writes.contains(atom));
        }

        let file = CacheFile { cache_data_version: CACHE_DATA_VERSION.to_string(), atoms };
        let body = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write_file(&self.path, &body)
    }

    pub fn len(&self) -> usize {
        self.atoms.lock().expect("metadata cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sorted, deduplicated `_eclasses_` source: name/md5 pairs to lay down in
/// AUXDB order.
pub fn eclass_hashes_line(hashes: &[(String, String)]) -> String {
    let mut unique: IndexSet<(String, String)> = IndexSet::new();
    for pair in hashes {
        unique.insert(pair.clone());
    }
    unique.iter().flat_map(|(name, md5)| [name.as_str(), md5.as_str()]).collect::<Vec<_>>().join("\t")
}
