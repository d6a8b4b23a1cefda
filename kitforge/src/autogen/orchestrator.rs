//! Cooperative top-level loop plus a bounded worker pool dispatching each
//! discovered [`WorkUnit`] concurrently, with per-task error attribution and
//! manifest aggregation after a barrier.

use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Mapping;
use tokio::sync::Semaphore;
use tracing::error;

use crate::autogen::ebuild::{EbuildBuilder, ManifestAggregator};
use crate::autogen::registry::{run_external_generator, run_external_preprocess, ResolvedGenerator};
use crate::config::Context;
use crate::fetch::harness::FetchHarness;
use crate::recipe::merge::merge_layers;
use crate::recipe::model::{PkgInfo, WorkUnit};

/// An attributed, non-fatal failure recorded during a run. Carries the
/// `sub_path (cat/name)` (or unit id, if the failure predates pkginfo
/// resolution) and the error message; never aborts sibling units.
#[derive(Debug, Clone)]
pub struct Failure {
    pub label: String,
    pub message: String,
}

pub struct AutogenOrchestrator {
    workers: usize,
}

impl AutogenOrchestrator {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Run every work unit to completion, returning the accumulated failure
    /// list. Never panics the caller on a single unit's failure.
    ///
    /// `current_repo`/`fixups_repo` are the second and third tiers of
    /// generator (and `preprocess_packages`) lookup, per the generator
    /// resolution order: local `generators/<name>` next to the recipe, then
    /// the current repo's, then the fixups repo's.
    pub async fn run(
        &self,
        ctx: Arc<Context>,
        units: Vec<WorkUnit>,
        global_defaults: &Mapping,
        dest_root: &Utf8PathBuf,
        current_repo: Option<&Utf8Path>,
        fixups_repo: Option<&Utf8Path>,
    ) -> Vec<Failure> {
        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let manifest = Arc::new(ManifestAggregator::default());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let current_repo = current_repo.map(Utf8Path::to_path_buf);
        let fixups_repo = fixups_repo.map(Utf8Path::to_path_buf);

        let mut unit_handles = Vec::new();
        for unit in units {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let manifest = manifest.clone();
            let failures = failures.clone();
            let global_defaults = global_defaults.clone();
            let dest_root = dest_root.clone();
            let current_repo = current_repo.clone();
            let fixups_repo = fixups_repo.clone();
            unit_handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                run_unit(ctx, unit, global_defaults, manifest, failures, dest_root, current_repo, fixups_repo).await;
            }));
        }

        for handle in unit_handles {
            if let Err(join_err) = handle.await {
                error!("autogen unit task panicked: {join_err}");
            }
        }

        if let Err(e) = manifest.flush(dest_root) {
            record_failure(&failures, "manifest", e);
        }

        Arc::try_unwrap(failures)
            .map(|m| m.into_inner().expect("failures lock poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("failures lock poisoned").clone())
    }
}

async fn run_unit(
    ctx: Arc<Context>,
    unit: WorkUnit,
    global_defaults: Mapping,
    manifest: Arc<ManifestAggregator>,
    failures: Arc<Mutex<Vec<Failure>>>,
    dest_root: Utf8PathBuf,
    current_repo: Option<Utf8PathBuf>,
    fixups_repo: Option<Utf8PathBuf>,
) {
    let generator = match ctx.generators.resolve(
        &unit.generator_ref,
        &unit.gen_path,
        current_repo.as_deref(),
        fixups_repo.as_deref(),
    ) {
        Ok(g) => g,
        Err(e) => {
            record_failure(&failures, &unit.autogen_id, e);
            return;
        }
    };

    let mut pkginfo_list = unit.pkginfo_list;
    if let Some(preprocess_path) =
        ctx.generators.resolve_preprocess(&unit.generator_ref, &unit.gen_path, current_repo.as_deref(), fixups_repo.as_deref())
    {
        match run_external_preprocess(&preprocess_path, &pkginfo_list).await {
            Ok(rewritten) => pkginfo_list = rewritten,
            Err(e) => {
                record_failure(&failures, &unit.autogen_id, e);
                return;
            }
        }
    }

    let mut task_handles = Vec::new();
    for pkginfo in &pkginfo_list {
        let label = pkginfo.sub_path().unwrap_or_else(|_| unit.autogen_id.clone());
        let effective = effective_pkginfo(&global_defaults, &unit.defaults, pkginfo);
        let ctx = ctx.clone();
        let generator = generator.clone();
        let manifest = manifest.clone();
        let failures = failures.clone();
        let dest_root = dest_root.clone();
        let autogen_id = unit.autogen_id.clone();

        task_handles.push(tokio::spawn(async move {
            let builds = match dispatch_generator(&generator, ctx.clone(), effective).await {
                Ok(builds) => builds,
                Err(e) => {
                    record_failure(&failures, &label, e);
                    return;
                }
            };

            let harness = FetchHarness::new(&ctx.spider, &ctx.fetch_cache);
            let builder = EbuildBuilder::new(&ctx.blos, &ctx.integrity, &manifest);
            for build in &builds {
                if let Err(e) = builder.render(build, &autogen_id, &harness, &dest_root).await {
                    record_failure(&failures, &label, e);
                }
            }
        }));
    }

    for handle in task_handles {
        if let Err(join_err) = handle.await {
            error!("autogen pkginfo task panicked: {join_err}");
        }
    }
}

fn effective_pkginfo(global_defaults: &Mapping, rule_defaults: &Mapping, entry: &PkgInfo) -> PkgInfo {
    let merged = merge_layers(
        &serde_yaml::Value::Mapping(global_defaults.clone()),
        &serde_yaml::Value::Mapping(rule_defaults.clone()),
        &serde_yaml::Value::Mapping(entry.0.clone()),
    );
    match merged {
        serde_yaml::Value::Mapping(m) => PkgInfo::from_mapping(m),
        _ => entry.clone(),
    }
}

async fn dispatch_generator(
    generator: &ResolvedGenerator,
    ctx: Arc<Context>,
    pkginfo: PkgInfo,
) -> crate::error::Result<Vec<crate::autogen::ebuild::BreezyBuild>> {
    match generator {
        ResolvedGenerator::Native(f) => f(ctx, pkginfo).await,
        ResolvedGenerator::External(path) => run_external_generator(path, &pkginfo).await,
    }
}

fn record_failure(failures: &Arc<Mutex<Vec<Failure>>>, label: &str, error: impl std::fmt::Display) {
    error!(label, %error, "autogen task failed");
    failures
        .lock()
        .expect("failures lock poisoned")
        .push(Failure { label: label.to_string(), message: error.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    #[test]
    fn effective_pkginfo_respects_precedence() {
        let mut global = Mapping::new();
        global.insert(Value::from("a"), Value::from(1));
        let mut rule = Mapping::new();
        rule.insert(Value::from("a"), Value::from(2));
        let mut entry_map = Mapping::new();
        entry_map.insert(Value::from("name"), Value::from("foo"));
        let entry = PkgInfo::from_mapping(entry_map);

        let effective = effective_pkginfo(&global, &rule, &entry);
        assert_eq!(effective.get("a"), Some(&Value::from(2)));
        assert_eq!(effective.name().unwrap(), "foo");
    }
}
