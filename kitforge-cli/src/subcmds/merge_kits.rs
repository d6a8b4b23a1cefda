use std::collections::HashMap;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::Datelike;
use clap::Args;
use kitforge::autogen::orchestrator::{AutogenOrchestrator, Failure};
use kitforge::config::{Context, EngineSettings};
use kitforge::git_tree::GitTree;
use kitforge::kit::assembler::{KitAssembler, PackagesSpec};
use kitforge::kit::eclass::EclassHashSet;
use kitforge::kit::meta_repo::MetaRepoController;
use kitforge::kit::metadata_cache::KitMetadataCache;
use kitforge::kit::model::{Kit, ReleaseDef};
use kitforge::Error;
use tracing::{info, warn};

use crate::args::{env_opt, REPO_NAME};

/// Regenerate every kit in a release (master kits first, then kits that
/// declare them as masters) and refresh the meta-repo's own metadata.
#[derive(Debug, Args)]
pub struct Command {
    /// Path to the release's `repositories.yaml`
    #[arg(long)]
    release: Utf8PathBuf,

    /// Directory each kit is checked out under, one subdirectory per kit name
    #[arg(long)]
    kits_root: Utf8PathBuf,

    /// Directory each source repository is checked out under
    #[arg(long)]
    sources_root: Utf8PathBuf,

    /// Directory holding kit-fixups slices: `<root>/<kit>/{global,curated,<branch>}`
    #[arg(long)]
    fixups_root: Option<Utf8PathBuf>,

    /// Meta-repo checkout that receives `metadata/kit-sha1.json` etc
    #[arg(long)]
    meta_repo_root: Utf8PathBuf,

    /// Path to the external ebuild-metadata extraction subprocess
    #[arg(long)]
    metadata_extractor: Utf8PathBuf,

    /// Root directory for engine state (BLOS, fetch cache, integrity DB)
    #[arg(long)]
    root: Option<Utf8PathBuf>,

    /// Treat every fetch's cache as stale, forcing a live re-fetch
    #[arg(long)]
    immediate: bool,
}

impl Command {
    pub(super) async fn run(self) -> anyhow::Result<ExitCode> {
        let release = ReleaseDef::load(&self.release)?;
        let repo_name_override = env_opt(REPO_NAME);

        let settings = EngineSettings { immediate: self.immediate, ..EngineSettings::default() };
        let ctx = match &self.root {
            Some(root) => Context::rooted(root, settings)?,
            None => Context::new("kitforge", settings)?,
        };

        // check out every source repository once, shared across kits
        let mut source_repo_roots = HashMap::new();
        for (name, repo) in &release.repositories {
            let dest = self.sources_root.join(name);
            let tree = GitTree::open_or_clone(&dest, &repo.url)?;
            if let Some(branch) = &repo.branch {
                tree.checkout(branch)?;
            }
            source_repo_roots.insert(name.clone(), dest);
        }

        let controller = MetaRepoController::new(self.meta_repo_root.clone(), release.clone())?;
        let orchestrator = AutogenOrchestrator::new(ctx.settings.autogen_workers);
        let mut all_failures: Vec<(String, Vec<Failure>)> = Vec::new();
        let mut had_master_failure = false;

        let handle = tokio::runtime::Handle::current();
        let copyright = release.copyright.clone();
        let results = {
            let ctx = &ctx;
            let orchestrator = &orchestrator;
            let source_repo_roots = &source_repo_roots;
            let all_failures = &mut all_failures;
            let had_master_failure = &mut had_master_failure;
            let repo_name_override = &repo_name_override;
            controller.process_all_kits_in_release(|kit| {
                if *had_master_failure && !kit.spec().masters.is_empty() {
                    return Err(Error::Configuration(format!(
                        "{}: skipped, a master kit failed this run",
                        kit.name()
                    )));
                }
                // `process_all_kits_in_release` is synchronous; step out of the
                // async context instead of nesting a second `block_on` on it.
                let outcome = tokio::task::block_in_place(|| {
                    handle.block_on(run_one_kit(
                        kit,
                        &self,
                        &copyright,
                        ctx.clone(),
                        orchestrator,
                        source_repo_roots,
                        repo_name_override.as_deref(),
                    ))
                });
                match outcome {
                    Ok((sha1, failures)) => {
                        if !failures.is_empty() {
                            all_failures.push((kit.name().to_string(), failures));
                        }
                        Ok(sha1)
                    }
                    Err(e) => {
                        if kit.spec().masters.is_empty() {
                            *had_master_failure = true;
                        }
                        Err(e)
                    }
                }
            })
        };

        let results = match results {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "release regeneration aborted");
                return Ok(ExitCode::from(2));
            }
        };
        info!(kits = results.len(), "kit regeneration complete");

        controller.generate_metarepo_metadata()?;

        let mut exit = ExitCode::SUCCESS;
        for (kit_name, failures) in &all_failures {
            controller.display_error_summary(kit_name, failures);
            exit = ExitCode::from(1);
        }
        Ok(exit)
    }
}

async fn run_one_kit(
    kit: &Kit,
    cmd: &Command,
    copyright: &str,
    ctx: std::sync::Arc<Context>,
    orchestrator: &AutogenOrchestrator,
    source_repo_roots: &HashMap<String, Utf8PathBuf>,
    repo_name_override: Option<&str>,
) -> kitforge::Result<(String, Vec<Failure>)> {
    let spec = kit.spec();
    let branch = spec.branch.clone().unwrap_or_else(|| "master".to_string());
    let kit_name = repo_name_override.map(str::to_string).unwrap_or_else(|| kit.name().to_string());
    let dest_root = cmd.kits_root.join(kit.name());

    let sync_url = spec.sync_url.clone().ok_or_else(|| {
        Error::Configuration(format!("{}: no sync_url and no `remotes:` template resolution implemented", kit.name()))
    })?;
    let tree = GitTree::open_or_clone(&dest_root, &sync_url)?;

    let assembler = KitAssembler {
        dest_root: dest_root.clone(),
        kit_name: kit_name.clone(),
        branch: branch.clone(),
        spec,
        source_repo_roots: source_repo_roots.clone(),
        metadata_extractor: cmd.metadata_extractor.clone(),
    };

    assembler.clean()?;
    assembler.seed_metadata(copyright)?;

    let global_defaults = serde_yaml::Mapping::new();
    let mut failures = Vec::new();
    let fixups_repo = cmd.fixups_root.as_ref().map(|root| root.join(kit.name()));

    match kit {
        Kit::Sourced { repository, .. } => {
            let source_root = source_repo_roots
                .get(repository)
                .ok_or_else(|| Error::Configuration(format!("{}: unknown source repo {repository}", kit.name())))?;
            failures.extend(
                assembler
                    .populate_sourced(source_root, ctx.clone(), orchestrator, &global_defaults, fixups_repo.as_deref())
                    .await?,
            );
        }
        Kit::Autogenerated { collection, .. } => {
            let mut packages = HashMap::new();
            for repo_name in collection {
                if let Some(root) = source_repo_roots.get(repo_name) {
                    let all_catpkgs = collect_all_catpkgs(root)?;
                    packages.insert(repo_name.clone(), all_catpkgs);
                }
            }
            assembler.copy_packages(&packages)?;
        }
    }

    if let Some(fixups_root) = &cmd.fixups_root {
        let kit_fixups = fixups_root.join(kit.name());
        let current_repo = source_repo_roots.values().next();
        for slice in ["global", "curated", branch.as_str()] {
            let slice_root = kit_fixups.join(slice);
            let packages_yaml = slice_root.join("packages.yaml");
            let (packages_spec, eclass_override) = PackagesSpec::load(&packages_yaml)?;
            if !eclass_override.include.is_empty() {
                assembler.copy_eclasses(&eclass_override)?;
            }
            if let Some(repo_root) = current_repo {
                assembler.copy_files(&packages_spec.copyfiles, repo_root)?;
            }
            assembler.apply_excludes(&packages_spec.exclude)?;
            failures.extend(
                assembler
                    .apply_fixups_slice(
                        &slice_root,
                        ctx.clone(),
                        orchestrator,
                        &global_defaults,
                        current_repo.map(Utf8PathBuf::as_path),
                        &kit_fixups,
                    )
                    .await?,
            );
        }
    }

    assembler.copy_eclasses(&spec.eclasses)?;
    assembler.apply_excludes(&spec.eclasses.mask)?;

    let cur_year = chrono::Utc::now().year();
    assembler.post_process(&[copyright.to_string()], cur_year, kit.name() == "core-kit")?;

    let masters = master_eclass_set(kit, cmd)?;
    let this_kit = assembler.local_eclasses()?;
    let cache_path = ctx.paths.tmp.join("kit_cache").join(format!("{}-{branch}", kit.name()));
    let cache = KitMetadataCache::load(cache_path)?;
    let licenses = assembler.regenerate_metadata(&masters, &this_kit, &cache)?;
    cache.save(true)?;

    let source_order: Vec<Utf8PathBuf> = source_repo_roots.values().cloned().collect();
    assembler.copy_licenses(&licenses, &source_order)?;

    let sha1 = assembler.finalize(&HashMap::new(), &tree)?;
    Ok((sha1, failures))
}

/// Union every already-regenerated master kit's eclass set, last master wins
/// on a name collision (mirrors `EclassHashSet::effective`'s contract).
fn master_eclass_set(kit: &Kit, cmd: &Command) -> kitforge::Result<EclassHashSet> {
    let mut combined = EclassHashSet::new();
    for master_name in &kit.spec().masters {
        let master_eclass_dir = cmd.kits_root.join(master_name).join("eclass");
        let set = kitforge::kit::assembler::load_eclass_dir(&master_eclass_dir)?;
        combined = EclassHashSet::effective(&combined, &set);
    }
    Ok(combined)
}

fn collect_all_catpkgs(repo_root: &Utf8PathBuf) -> kitforge::Result<Vec<String>> {
    let mut out = Vec::new();
    for cat_entry in std::fs::read_dir(repo_root.as_std_path())? {
        let cat_entry = cat_entry?;
        if !cat_entry.file_type()?.is_dir() {
            continue;
        }
        let cat_name = cat_entry.file_name().to_string_lossy().to_string();
        if !(cat_name.contains('-') || cat_name == "virtual") {
            continue;
        }
        for pkg_entry in std::fs::read_dir(cat_entry.path())? {
            let pkg_entry = pkg_entry?;
            if pkg_entry.file_type()?.is_dir() {
                out.push(format!("{cat_name}/{}", pkg_entry.file_name().to_string_lossy()));
            }
        }
    }
    Ok(out)
}
