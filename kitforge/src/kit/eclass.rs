//! Eclasses and the hash set used to validate metadata cache freshness.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashKind};

struct Inner {
    name: String,
    path: Utf8PathBuf,
    md5: String,
}

/// A single eclass: name, on-disk location, and its MD5 checksum.
#[derive(Debug, Clone)]
pub struct Eclass(Arc<Inner>);

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eclass").field("name", &self.name).field("path", &self.path).finish()
    }
}

impl Eclass {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let name = path
            .file_stem()
            .filter(|_| path.extension() == Some("eclass"))
            .ok_or_else(|| Error::Configuration(format!("not an eclass: {path}")))?
            .to_string();
        let md5 = ContentHash::compute_file(path.as_std_path(), &[HashKind::Sha256])?
            .digests
            .get(&HashKind::Sha256)
            .cloned()
            .unwrap_or_default();
        Ok(Self(Arc::new(Inner { name, path: path.to_path_buf(), md5 })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn path(&self) -> &Utf8Path {
        &self.0.path
    }

    pub fn md5(&self) -> &str {
        &self.0.md5
    }
}

impl PartialEq for Eclass {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}
impl Eq for Eclass {}

impl Hash for Eclass {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl Borrow<str> for Eclass {
    fn borrow(&self) -> &str {
        &self.0.name
    }
}

impl Ord for Eclass {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.name.cmp(&other.0.name)
    }
}
impl PartialOrd for Eclass {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A concurrency-safe registry of eclasses by name; inserting a duplicate
/// name from a different path is a fatal configuration error identifying
/// both locations.
#[derive(Default)]
pub struct EclassHashSet {
    by_name: Mutex<HashMap<String, Eclass>>,
}

impl EclassHashSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, eclass: Eclass) -> Result<()> {
        let mut map = self.by_name.lock().expect("eclass set lock poisoned");
        if let Some(existing) = map.get(eclass.name()) {
            if existing.path() != eclass.path() {
                return Err(Error::Configuration(format!(
                    "duplicate eclass {}: {} and {}",
                    eclass.name(),
                    existing.path(),
                    eclass.path()
                )));
            }
            return Ok(());
        }
        map.insert(eclass.name().to_string(), eclass);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Eclass> {
        self.by_name.lock().expect("eclass set lock poisoned").get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_name.lock().expect("eclass set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered `(name, md5)` pairs, sorted by name, for `_eclasses_` lines.
    pub fn sorted_hashes(&self) -> Vec<(String, String)> {
        let map = self.by_name.lock().expect("eclass set lock poisoned");
        let mut out: Vec<_> = map.values().map(|e| (e.name().to_string(), e.md5().to_string())).collect();
        out.sort();
        out
    }

    /// Merge `this` on top of `masters`, last wins on a name collision
    /// (masters' eclasses are shadowed by a same-named local one, not
    /// rejected as duplicates).
    pub fn effective(masters: &EclassHashSet, this: &EclassHashSet) -> EclassHashSet {
        let merged = EclassHashSet::new();
        for (_, eclass) in masters.by_name.lock().expect("lock poisoned").iter() {
            merged.by_name.lock().expect("lock poisoned").insert(eclass.name().to_string(), eclass.clone());
        }
        for (_, eclass) in this.by_name.lock().expect("lock poisoned").iter() {
            merged.by_name.lock().expect("lock poisoned").insert(eclass.name().to_string(), eclass.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_eclass(dir: &std::path::Path, name: &str, body: &str) -> Utf8PathBuf {
        let path = dir.join(format!("{name}.eclass"));
        std::fs::write(&path, body).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn duplicate_name_same_path_is_ok() {
        let dir = tempdir().unwrap();
        let path = write_eclass(dir.path(), "foo", "# foo");
        let set = EclassHashSet::new();
        set.insert(Eclass::load(&path).unwrap()).unwrap();
        set.insert(Eclass::load(&path).unwrap()).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn duplicate_name_different_path_is_fatal() {
        let dir = tempdir().unwrap();
        let sub_a = dir.path().join("a");
        let sub_b = dir.path().join("b");
        std::fs::create_dir_all(&sub_a).unwrap();
        std::fs::create_dir_all(&sub_b).unwrap();
        let path_a = write_eclass(&sub_a, "foo", "# foo a");
        let path_b = write_eclass(&sub_b, "foo", "# foo b");

        let set = EclassHashSet::new();
        set.insert(Eclass::load(&path_a).unwrap()).unwrap();
        let err = set.insert(Eclass::load(&path_b).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn effective_masters_then_local_last_wins() {
        let dir = tempdir().unwrap();
        let path_master = write_eclass(dir.path(), "shared", "# master");
        let masters = EclassHashSet::new();
        masters.insert(Eclass::load(&path_master).unwrap()).unwrap();

        let local_dir = dir.path().join("local");
        std::fs::create_dir_all(&local_dir).unwrap();
        let path_local = write_eclass(&local_dir, "shared", "# local override, different content");
        let this = EclassHashSet::new();
        this.insert(Eclass::load(&path_local).unwrap()).unwrap();

        let effective = EclassHashSet::effective(&masters, &this);
        assert_eq!(effective.get("shared").unwrap().path(), path_local);
    }
}
