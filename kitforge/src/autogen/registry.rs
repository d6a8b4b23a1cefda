//! Generator dispatch: a registry mapping `generator_name -> fn(Context, PkgInfo)`,
//! replacing dynamic plugin loading. Native generators are registered Rust
//! closures; recipe-local scripts are dispatched as external subprocesses
//! speaking a small JSON protocol over stdio (one `PkgInfo` on stdin, a JSON
//! array of rendered builds on stdout).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::autogen::ebuild::BreezyBuild;
use crate::config::Context;
use crate::error::{Error, Result};
use crate::recipe::model::PkgInfo;

pub type GenFuture = Pin<Box<dyn Future<Output = Result<Vec<BreezyBuild>>> + Send>>;
pub type GeneratorFn = Arc<dyn Fn(Arc<Context>, PkgInfo) -> GenFuture + Send + Sync>;

#[derive(Clone)]
pub enum ResolvedGenerator {
    Native(GeneratorFn),
    External(Utf8PathBuf),
}

#[derive(Default)]
pub struct GeneratorRegistry {
    native: HashMap<String, GeneratorFn>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, generator: GeneratorFn) {
        self.native.insert(name.into(), generator);
    }

    /// Generator lookup order: (1) local `generators/<name>` next to the
    /// YAML, (2) current-repo `generators/<name>`, (3) fixups-repo
    /// `generators/<name>`. Native Rust generators registered under `name`
    /// always take precedence, since they have no filesystem location to
    /// search for. Missing anywhere is fatal.
    pub fn resolve(
        &self,
        name: &str,
        gen_path: &Utf8Path,
        current_repo: Option<&Utf8Path>,
        fixups_repo: Option<&Utf8Path>,
    ) -> Result<ResolvedGenerator> {
        if let Some(native) = self.native.get(name) {
            return Ok(ResolvedGenerator::Native(native.clone()));
        }

        let candidates = [
            Some(gen_path.join("generators").join(name)),
            current_repo.map(|r| r.join("generators").join(name)),
            fixups_repo.map(|r| r.join("generators").join(name)),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                return Ok(ResolvedGenerator::External(candidate));
            }
        }

        Err(Error::Recipe(format!("generator not found: {name}")))
    }

    /// Resolve an optional `preprocess_packages` hook for `name`: same lookup
    /// tiers as [`Self::resolve`], but for the `<name>.preprocess` filename.
    /// Absent is not an error — most generators have no preprocessor.
    pub fn resolve_preprocess(
        &self,
        name: &str,
        gen_path: &Utf8Path,
        current_repo: Option<&Utf8Path>,
        fixups_repo: Option<&Utf8Path>,
    ) -> Option<Utf8PathBuf> {
        let preprocess_name = format!("{name}.preprocess");
        let candidates = [
            Some(gen_path.join("generators").join(&preprocess_name)),
            current_repo.map(|r| r.join("generators").join(&preprocess_name)),
            fixups_repo.map(|r| r.join("generators").join(&preprocess_name)),
        ];
        candidates.into_iter().flatten().find(|c| c.exists())
    }
}

/// Runs an external generator subprocess: pkginfo JSON on stdin, a JSON array
/// of [`BreezyBuild`]-shaped documents on stdout.
pub async fn run_external_generator(path: &Utf8Path, pkginfo: &PkgInfo) -> Result<Vec<BreezyBuild>> {
    let pkginfo_json = serde_json::to_string(&yaml_mapping_to_json(&pkginfo.0))?;

    let mut child = Command::new(path.as_std_path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Recipe(format!("failed to spawn generator {path}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(pkginfo_json.as_bytes())
            .await
            .map_err(|e| Error::Recipe(format!("failed writing to generator {path}: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Recipe(format!("generator {path} failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Recipe(format!("generator {path} exited non-zero: {stderr}")));
    }

    let raw: Vec<RawBreezyBuild> = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Recipe(format!("generator {path} emitted invalid output: {e}")))?;
    raw.into_iter().map(RawBreezyBuild::into_breezy_build).collect()
}

/// Runs an external `preprocess_packages` subprocess: the unit's full pkginfo
/// list as a JSON array on stdin, the (possibly rewritten) list back on stdout.
pub async fn run_external_preprocess(path: &Utf8Path, pkginfo_list: &[PkgInfo]) -> Result<Vec<PkgInfo>> {
    let input: Vec<serde_json::Value> = pkginfo_list.iter().map(|p| yaml_mapping_to_json(&p.0)).collect();
    let input_json = serde_json::to_string(&input)?;

    let mut child = Command::new(path.as_std_path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Recipe(format!("failed to spawn preprocessor {path}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input_json.as_bytes())
            .await
            .map_err(|e| Error::Recipe(format!("failed writing to preprocessor {path}: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Recipe(format!("preprocessor {path} failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Recipe(format!("preprocessor {path} exited non-zero: {stderr}")));
    }

    let raw: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Recipe(format!("preprocessor {path} emitted invalid output: {e}")))?;
    Ok(raw.into_iter().map(|v| PkgInfo::from_mapping(json_value_to_yaml_mapping(v))).collect())
}

fn json_value_to_yaml_mapping(value: serde_json::Value) -> serde_yaml::Mapping {
    match json_to_yaml_value(value) {
        serde_yaml::Value::Mapping(m) => m,
        _ => serde_yaml::Mapping::new(),
    }
}

/// Wire shape accepted from external generator subprocesses; intentionally
/// permissive (no hashes/artifacts expected up front — those are resolved by
/// [`crate::autogen::ebuild::EbuildBuilder`]).
#[derive(Debug, serde::Deserialize)]
struct RawBreezyBuild {
    cat: String,
    name: String,
    version: String,
    #[serde(default)]
    revision: u32,
    template_ref: String,
    #[serde(default)]
    template_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
}

#[derive(Debug, serde::Deserialize)]
struct RawArtifact {
    final_name: String,
    src_uris: Vec<String>,
    key: Option<String>,
}

impl RawBreezyBuild {
    fn into_breezy_build(self) -> Result<BreezyBuild> {
        let mut template_vars = serde_yaml::Mapping::new();
        for (k, v) in self.template_vars {
            template_vars.insert(serde_yaml::Value::from(k), json_to_yaml_value(v));
        }
        let artifacts = self
            .artifacts
            .into_iter()
            .map(|a| crate::autogen::ebuild::Artifact {
                final_name: a.final_name,
                src_uris: a.src_uris,
                expected_hashes: None,
                key: a.key,
            })
            .collect();
        Ok(BreezyBuild {
            cat: self.cat,
            name: self.name,
            version: self.version,
            revision: self.revision,
            template_ref: self.template_ref,
            template_vars,
            artifacts,
        })
    }
}

fn yaml_mapping_to_json(mapping: &serde_yaml::Mapping) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (k, v) in mapping {
        if let Some(key) = k.as_str() {
            out.insert(key.to_string(), yaml_to_json_value(v));
        }
    }
    serde_json::Value::Object(out)
}

fn yaml_to_json_value(value: &serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn json_to_yaml_value(value: serde_json::Value) -> serde_yaml::Value {
    serde_yaml::to_value(value).unwrap_or(serde_yaml::Value::Null)
}
