//! Ebuild rendering and artifact completion: turns a [`BreezyBuild`] into an
//! ebuild file plus `DIST` manifest lines.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_yaml::Mapping;

use crate::blos::HashingStore;
use crate::error::{Error, Result};
use crate::fetch::harness::FetchHarness;
use crate::hash::{ContentHash, HashKind};
use crate::integrity::IntegrityDb;

/// A named downloadable referenced by one or more [`BreezyBuild`]s.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub final_name: String,
    pub src_uris: Vec<String>,
    pub expected_hashes: Option<ContentHash>,
    pub key: Option<String>,
}

/// One ebuild-to-be: `cat/name/name-version[-rN].ebuild` plus the artifacts
/// it references.
#[derive(Debug, Clone)]
pub struct BreezyBuild {
    pub cat: String,
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub template_ref: String,
    pub template_vars: Mapping,
    pub artifacts: Vec<Artifact>,
}

impl BreezyBuild {
    /// `name-version.ebuild` when `revision == 0`, else `name-version-rN.ebuild`.
    pub fn ebuild_filename(&self) -> String {
        render_ebuild_filename(&self.name, &self.version, self.revision)
    }

    pub fn catpkg_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.cat).join(&self.name)
    }
}

pub fn render_ebuild_filename(name: &str, version: &str, revision: u32) -> String {
    if revision == 0 {
        format!("{name}-{version}.ebuild")
    } else {
        format!("{name}-{version}-r{revision}.ebuild")
    }
}

/// `DIST <final_name> <size> <HASH_NAME> <hex>[ <HASH_NAME> <hex>]…`, hash
/// names sorted lexicographically.
pub fn dist_line(artifact_name: &str, hash: &ContentHash) -> String {
    let mut parts = vec![format!("DIST {artifact_name} {}", hash.size)];
    let mut kinds: Vec<_> = hash.digests.keys().copied().collect();
    kinds.sort_by_key(|k| k.to_string());
    for kind in kinds {
        let hex = &hash.digests[&kind];
        parts.push(format!("{} {hex}", kind.to_string().to_uppercase()));
    }
    parts.join(" ")
}

/// Per-catpkg set of `DIST` lines, deduped and written once after the
/// orchestrator's barrier.
#[derive(Default)]
pub struct ManifestAggregator {
    lines: Mutex<HashMap<Utf8PathBuf, BTreeSet<String>>>,
}

impl ManifestAggregator {
    pub fn add(&self, catpkg_dir: &Utf8PathBuf, line: String) {
        let mut map = self.lines.lock().expect("manifest aggregator lock poisoned");
        map.entry(catpkg_dir.clone()).or_default().insert(line);
    }

    /// Write every accumulated catpkg's `Manifest` file under `repo_root`,
    /// sorted lexicographically, exactly once.
    pub fn flush(&self, repo_root: &Utf8PathBuf) -> Result<()> {
        let map = self.lines.lock().expect("manifest aggregator lock poisoned");
        for (catpkg_dir, lines) in map.iter() {
            let manifest_path = repo_root.join(catpkg_dir).join("Manifest");
            if let Some(parent) = manifest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = lines.iter().cloned().collect::<Vec<_>>().join("\n") + "\n";
            crate::files::atomic_write_file(&manifest_path, body.as_bytes())?;
        }
        Ok(())
    }
}

pub struct EbuildBuilder<'a> {
    blos: &'a HashingStore,
    integrity: &'a IntegrityDb,
    manifest: &'a ManifestAggregator,
}

const WANT_HASHES: &[HashKind] = &[HashKind::Sha512, HashKind::Sha256, HashKind::Blake2b];

impl<'a> EbuildBuilder<'a> {
    pub fn new(blos: &'a HashingStore, integrity: &'a IntegrityDb, manifest: &'a ManifestAggregator) -> Self {
        Self { blos, integrity, manifest }
    }

    /// Ensure every artifact of `build` is fetched and hashed, then emit the
    /// ebuild file and register its `DIST` lines.
    pub async fn render(
        &self,
        build: &BreezyBuild,
        autogen_scope: &str,
        harness: &FetchHarness<'_>,
        dest_root: &Utf8PathBuf,
    ) -> Result<Utf8PathBuf> {
        let catpkg_dir = build.catpkg_dir();

        for artifact in &build.artifacts {
            let hash = self.complete_artifact(artifact, autogen_scope, harness).await?;
            self.manifest.add(&catpkg_dir, dist_line(&artifact.final_name, &hash));
        }

        let ebuild_path = dest_root.join(&catpkg_dir).join(build.ebuild_filename());
        if let Some(parent) = ebuild_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = render_ebuild_body(build);
        crate::files::atomic_write_file(&ebuild_path, body.as_bytes())?;
        Ok(ebuild_path)
    }

    async fn complete_artifact(
        &self,
        artifact: &Artifact,
        autogen_scope: &str,
        harness: &FetchHarness<'_>,
    ) -> Result<ContentHash> {
        if let Ok(hash) = self.integrity.resolve(autogen_scope, &artifact.final_name, artifact.expected_hashes.as_ref()) {
            if self.blos.get(&hash).is_ok() {
                return Ok(hash);
            }
        }

        let url = artifact
            .src_uris
            .first()
            .ok_or_else(|| Error::Recipe(format!("{}: no src_uris", artifact.final_name)))?;

        let fetched = harness.download_via_spider(url, WANT_HASHES).await?;
        if let Some(expected) = &artifact.expected_hashes {
            let bad = expected.disagreements(&fetched.hashes);
            if !bad.is_empty() {
                return Err(Error::HashMismatch(bad));
            }
        }

        let object = self.blos.insert(&fetched.path, &fetched.hashes)?;
        self.integrity.record(autogen_scope, &artifact.final_name, &fetched.hashes, Some(object.disk_path.as_str()))?;
        Ok(fetched.hashes)
    }
}

fn render_ebuild_body(build: &BreezyBuild) -> String {
    let mut body = format!(
        "# generated from template: {}\nEAPI=8\n",
        build.template_ref
    );
    let mut keys: Vec<_> = build.template_vars.iter().collect();
    keys.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));
    for (key, value) in keys {
        if let Some(key) = key.as_str() {
            body.push_str(&format!("{}=\"{}\"\n", key.to_uppercase(), render_scalar(value)));
        }
    }
    body
}

fn render_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_rule_zero_revision() {
        assert_eq!(render_ebuild_filename("foo", "1.0", 0), "foo-1.0.ebuild");
    }

    #[test]
    fn filename_rule_with_revision() {
        assert_eq!(render_ebuild_filename("foo", "1.0", 2), "foo-1.0-r2.ebuild");
    }

    #[test]
    fn dist_line_sorts_hash_names() {
        let hash = ContentHash::new(10)
            .with(HashKind::Sha512, "aaaa".to_string())
            .with(HashKind::Blake2b, "bbbb".to_string());
        let line = dist_line("foo.tar.gz", &hash);
        let blake_pos = line.find("BLAKE2B").unwrap();
        let sha_pos = line.find("SHA512").unwrap();
        assert!(blake_pos < sha_pos);
    }

    #[test]
    fn manifest_aggregator_dedupes_identical_lines() {
        let agg = ManifestAggregator::default();
        let dir = Utf8PathBuf::from("sys-apps/foo");
        agg.add(&dir, "DIST foo.tar.gz 10 SHA512 aaaa".to_string());
        agg.add(&dir, "DIST foo.tar.gz 10 SHA512 aaaa".to_string());
        let map = agg.lines.lock().unwrap();
        assert_eq!(map.get(&dir).unwrap().len(), 1);
    }
}
