//! Composes per-kit regeneration across a whole release: master/dependent
//! ordering, meta-repo metadata, commit, and mirroring.

use std::collections::BTreeMap;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::json;
use tracing::error;

use crate::autogen::orchestrator::Failure;
use crate::error::Result;
use crate::files::atomic_write_file;
use crate::git_tree::GitTree;
use crate::kit::model::{Kit, KitGraph, ReleaseDef};

/// One completed kit regeneration: the commit SHA recorded for `(kit, branch)`.
#[derive(Debug, Clone)]
pub struct KitJobResult {
    pub kit_name: String,
    pub branch: String,
    pub sha1: String,
}

/// `output_sha1s[kit_name][branch] = sha1`.
#[derive(Debug, Default)]
pub struct OutputSha1s {
    inner: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl OutputSha1s {
    pub fn record(&self, result: &KitJobResult) {
        self.inner
            .lock()
            .expect("output_sha1s lock poisoned")
            .entry(result.kit_name.clone())
            .or_default()
            .insert(result.branch.clone(), result.sha1.clone());
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.inner.lock().expect("output_sha1s lock poisoned").clone()
    }
}

pub struct MetaRepoController {
    pub meta_repo_root: Utf8PathBuf,
    pub release: ReleaseDef,
    pub graph: KitGraph,
    pub output_sha1s: OutputSha1s,
}

impl MetaRepoController {
    pub fn new(meta_repo_root: Utf8PathBuf, release: ReleaseDef) -> Result<Self> {
        let graph = KitGraph::build(&release)?;
        Ok(Self { meta_repo_root, release, graph, output_sha1s: OutputSha1s::default() })
    }

    /// Run `master_jobs` to completion before starting `dependent_jobs`,
    /// recording each job's output SHA. `run_kit` performs one kit's full
    /// assembly cycle and returns its commit SHA.
    pub fn process_all_kits_in_release(
        &self,
        mut run_kit: impl FnMut(&Kit) -> Result<String>,
    ) -> Result<Vec<KitJobResult>> {
        let mut results = Vec::new();
        for kit in self.graph.master_jobs() {
            results.push(self.run_and_record(kit, &mut run_kit)?);
        }
        for kit in self.graph.dependent_jobs() {
            results.push(self.run_and_record(kit, &mut run_kit)?);
        }
        Ok(results)
    }

    fn run_and_record(&self, kit: &Kit, run_kit: &mut impl FnMut(&Kit) -> Result<String>) -> Result<KitJobResult> {
        let sha1 = run_kit(kit)?;
        let branch = kit.spec().branch.clone().unwrap_or_else(|| "master".to_string());
        let result = KitJobResult { kit_name: kit.name().to_string(), branch, sha1 };
        self.output_sha1s.record(&result);
        Ok(result)
    }

    /// Log every accumulated autogen failure, grouped by kit, without
    /// aborting the run: per §5, a stuck subprocess hangs its own kit, not
    /// the others.
    pub fn display_error_summary(&self, kit_name: &str, failures: &[Failure]) {
        for failure in failures {
            error!(kit = kit_name, label = %failure.label, message = %failure.message, "autogen failure");
        }
    }

    /// Write `metadata/kit-sha1.json`, `metadata/kit-info.json`, and
    /// `metadata/version.json` into the meta-repo root.
    pub fn generate_metarepo_metadata(&self) -> Result<()> {
        let sha1s = self.output_sha1s.snapshot();
        atomic_write_file(
            self.meta_repo_root.join("metadata/kit-sha1.json"),
            serde_json::to_vec_pretty(&sha1s)?,
        )?;

        let kit_order: Vec<&str> = self.graph.kits.iter().map(Kit::name).collect();
        let mut kit_settings = serde_json::Map::new();
        let mut release_defs = serde_json::Map::new();
        for kit in &self.graph.kits {
            let spec = kit.spec();
            kit_settings.insert(
                kit.name().to_string(),
                json!({ "stability": spec.stability, "type": "auto" }),
            );
            if !spec.deprecated {
                let branch = spec.branch.clone().unwrap_or_else(|| "master".to_string());
                release_defs.insert(kit.name().to_string(), json!([branch]));
            }
        }

        let release_info = serde_json::to_value(&self.release.metadata)?;
        let kit_info = json!({
            "kit_order": kit_order,
            "kit_settings": kit_settings,
            "release_defs": release_defs,
            "release_info": release_info,
        });
        atomic_write_file(self.meta_repo_root.join("metadata/kit-info.json"), serde_json::to_vec_pretty(&kit_info)?)?;
        atomic_write_file(self.meta_repo_root.join("metadata/version.json"), serde_json::to_vec_pretty(&release_info)?)?;
        Ok(())
    }

    /// Commit the meta-repo with a fixed message, skipping the nested
    /// `kits/` tree (each kit is its own checkout committed separately).
    pub fn commit_meta_repo(&self, tree: &GitTree) -> Result<String> {
        tree.commit_all("kit updates", &["kits/"])
    }

    pub fn push_meta_repo(&self, tree: &GitTree, remote_name: &str) -> Result<()> {
        tree.push(remote_name, "refs/heads/master:refs/heads/master")
    }

    /// Mirror one local checkout to every declared mirror URL.
    pub fn mirror_repository(local_path: &Utf8PathBuf, mirror_urls: &[String]) -> Result<()> {
        for (idx, url) in mirror_urls.iter().enumerate() {
            let temp_dest = local_path.with_file_name(format!(
                "{}-mirror-{idx}",
                local_path.file_name().unwrap_or("repo")
            ));
            GitTree::mirror_to(local_path, &temp_dest, url)?;
        }
        Ok(())
    }

    /// Mirror every kit checkout plus the meta-repo itself.
    pub fn mirror_all_repositories(
        &self,
        kit_paths: &BTreeMap<String, Utf8PathBuf>,
        mirror_urls: &[String],
    ) -> Result<()> {
        for path in kit_paths.values() {
            Self::mirror_repository(path, mirror_urls)?;
        }
        Self::mirror_repository(&self.meta_repo_root, mirror_urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kit::model::{EclassSpec, KitDefinitions, KitEntry, KitKind, KitSpec, RepositoryDef};
    use std::collections::HashMap;

    fn spec(branch: &str, deprecated: bool) -> KitSpec {
        KitSpec {
            kind: Some(KitKind::Sourced),
            source: Some("x".into()),
            stability: HashMap::new(),
            branch: Some(branch.into()),
            eclasses: EclassSpec::default(),
            priority: None,
            aliases: vec![],
            masters: vec![],
            sync_url: None,
            settings: serde_yaml::Mapping::new(),
            deprecated,
        }
    }

    fn release() -> ReleaseDef {
        let mut repositories = HashMap::new();
        repositories.insert(
            "x".to_string(),
            RepositoryDef { url: "https://example/x".into(), branch: None, src_sha1: None, copyright: None, eclasses: vec![], notes: None },
        );
        ReleaseDef {
            kit_definitions: KitDefinitions {
                defaults: serde_yaml::Mapping::new(),
                kits: vec![
                    KitEntry { name: "core-kit".into(), spec: spec("master", false) },
                    KitEntry { name: "old-kit".into(), spec: spec("master", true) },
                ],
            },
            repositories,
            ..Default::default()
        }
    }

    #[test]
    fn process_all_kits_records_output_sha1s() {
        let controller = MetaRepoController::new(Utf8PathBuf::from("/tmp/meta"), release()).unwrap();
        let results = controller
            .process_all_kits_in_release(|kit| Ok(format!("sha-{}", kit.name())))
            .unwrap();
        assert_eq!(results.len(), 2);
        let snapshot = controller.output_sha1s.snapshot();
        assert_eq!(snapshot["core-kit"]["master"], "sha-core-kit");
    }

    #[test]
    fn metarepo_metadata_omits_deprecated_from_release_defs() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let controller = MetaRepoController::new(root.clone(), release()).unwrap();
        controller.process_all_kits_in_release(|kit| Ok(format!("sha-{}", kit.name()))).unwrap();
        controller.generate_metarepo_metadata().unwrap();

        let kit_info: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.join("metadata/kit-info.json")).unwrap()).unwrap();
        assert!(kit_info["release_defs"].get("core-kit").is_some());
        assert!(kit_info["release_defs"].get("old-kit").is_none());
    }
}
