//! Per-kit regeneration cycle: clean, seed, populate, post-process,
//! regenerate metadata, copy licenses, finalize.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::autogen::orchestrator::{AutogenOrchestrator, Failure};
use crate::config::Context;
use crate::error::{Error, Result};
use crate::files::{atomic_write_file, clean_dir_except_dotfiles, sorted_dir_list_utf8};
use crate::git_tree::GitTree;
use crate::kit::eclass::{Eclass, EclassHashSet};
use crate::kit::metadata_cache::{eclass_hashes_line, KitMetadataCache, KitMetadataRecord};
use crate::kit::model::{EclassSpec, KitSpec};
use crate::metadata_extract::{build_extraction_env, parse_ebuild_ident, render_auxdb_block};
use crate::python_use::catpkg_python_use_lines;
use crate::recipe::discovery::{DiscoveryFilter, RecipeDiscovery};
use crate::utils::bounded_jobs;

/// `copyfiles:`/`packages:`/`exclude:` shape shared by per-kit package YAML.
#[derive(Debug, Clone, Default)]
pub struct PackagesSpec {
    /// `source_repo -> catpkgs`.
    pub packages: HashMap<String, Vec<String>>,
    pub copyfiles: Vec<(String, Option<String>)>,
    pub exclude: Vec<String>,
}

impl PackagesSpec {
    /// Parse a `<fixups>/<kit>[/<branch>|/curated]/packages.yaml`. `packages:`
    /// and `eclasses.include:` entries may nest arbitrarily; only string
    /// leaves are taken as catpkgs/eclass names.
    pub fn load(path: &Utf8Path) -> Result<(Self, EclassSpec)> {
        if !path.exists() {
            return Ok((Self::default(), EclassSpec::default()));
        }
        let text = std::fs::read_to_string(path)?;
        let doc: serde_yaml::Mapping = serde_yaml::from_str(&text)?;

        let mut packages = HashMap::new();
        if let Some(serde_yaml::Value::Sequence(items)) = doc.get("packages") {
            for item in items {
                if let serde_yaml::Value::Mapping(m) = item {
                    for (repo, value) in m {
                        let repo = repo.as_str().unwrap_or_default().to_string();
                        let mut leaves = Vec::new();
                        collect_string_leaves(value, &mut leaves);
                        packages.entry(repo).or_insert_with(Vec::new).extend(leaves);
                    }
                }
            }
        }

        let copyfiles = doc
            .get("copyfiles")
            .and_then(|v| v.as_sequence())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let m = item.as_mapping()?;
                        let src = m.get("src")?.as_str()?.to_string();
                        let dest = m.get("dest").and_then(|v| v.as_str()).map(str::to_string);
                        Some((src, dest))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let exclude = doc
            .get("exclude")
            .and_then(|v| v.as_sequence())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let eclasses = doc
            .get("eclasses")
            .map(|v| serde_yaml::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();

        Ok((Self { packages, copyfiles, exclude }, eclasses))
    }
}

/// Recursively collect every string leaf in a YAML value (a scalar, or any
/// nesting of sequences/mappings terminating in scalars).
fn collect_string_leaves(value: &serde_yaml::Value, out: &mut Vec<String>) {
    match value {
        serde_yaml::Value::String(s) => out.push(s.clone()),
        serde_yaml::Value::Sequence(items) => items.iter().for_each(|v| collect_string_leaves(v, out)),
        serde_yaml::Value::Mapping(m) => m.values().for_each(|v| collect_string_leaves(v, out)),
        _ => {}
    }
}

#[derive(Debug, Clone)]
pub struct LayoutConf {
    pub repo_name: String,
    pub aliases: Vec<String>,
    pub masters: Vec<String>,
}

impl LayoutConf {
    pub fn render(&self) -> String {
        let mut out = format!(
            "repo-name = {}\nthin-manifests = true\nsign-manifests = false\nprofile-formats = portage-2\ncache-formats = md5-dict\n",
            self.repo_name
        );
        if !self.aliases.is_empty() {
            out.push_str(&format!("aliases = {}\n", self.aliases.join(" ")));
        }
        if !self.masters.is_empty() {
            out.push_str(&format!("masters = {}\n", self.masters.join(" ")));
        }
        out
    }
}

pub struct KitAssembler<'a> {
    pub dest_root: Utf8PathBuf,
    pub kit_name: String,
    pub branch: String,
    pub spec: &'a KitSpec,
    pub source_repo_roots: HashMap<String, Utf8PathBuf>,
    pub metadata_extractor: Utf8PathBuf,
}

impl<'a> KitAssembler<'a> {
    /// Step 1: clean the destination tree of all non-dotfile contents.
    pub fn clean(&self) -> Result<()> {
        clean_dir_except_dotfiles(&self.dest_root)
    }

    /// Step 2: seed `metadata/layout.conf`, `profiles/repo_name`, `LICENSE.txt`.
    pub fn seed_metadata(&self, release_license: &str) -> Result<()> {
        let layout = LayoutConf { repo_name: self.kit_name.clone(), aliases: self.spec.aliases.clone(), masters: self.spec.masters.clone() };
        atomic_write_file(self.dest_root.join("metadata/layout.conf"), layout.render().as_bytes())?;
        atomic_write_file(self.dest_root.join("profiles/repo_name"), format!("{}\n", self.kit_name).as_bytes())?;
        atomic_write_file(self.dest_root.join("LICENSE.txt"), release_license.as_bytes())?;
        Ok(())
    }

    /// Step 3.1: copy eclasses per `eclasses_spec`. `*` copies every eclass
    /// from a repo except masked names; a named entry copies a single
    /// eclass, mask still applies.
    pub fn copy_eclasses(&self, spec: &EclassSpec) -> Result<()> {
        let mask: BTreeSet<&str> = spec.mask.iter().map(String::as_str).collect();
        for (repo_name, names) in &spec.include {
            let Some(repo_root) = self.source_repo_roots.get(repo_name) else { continue };
            let eclass_dir = repo_root.join("eclass");
            if !eclass_dir.exists() {
                continue;
            }
            let dest_dir = self.dest_root.join("eclass");
            std::fs::create_dir_all(&dest_dir)?;

            if names.iter().any(|n| n == "*") {
                for entry in sorted_dir_list_utf8(&eclass_dir)? {
                    let path = entry.path();
                    if path.extension() != Some("eclass") {
                        continue;
                    }
                    let name = path.file_stem().unwrap_or_default();
                    if mask.contains(name) {
                        continue;
                    }
                    std::fs::copy(path, dest_dir.join(path.file_name().unwrap_or_default()))?;
                }
            } else {
                for name in names {
                    if mask.contains(name.as_str()) {
                        continue;
                    }
                    let src = eclass_dir.join(format!("{name}.eclass"));
                    if src.exists() {
                        std::fs::copy(&src, dest_dir.join(format!("{name}.eclass")))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 3.2: copy `copyfiles:` entries.
    pub fn copy_files(&self, entries: &[(String, Option<String>)], repo_root: &Utf8Path) -> Result<()> {
        for (src, dest) in entries {
            let src_path = repo_root.join(src);
            let dest_path = self.dest_root.join(dest.clone().unwrap_or_else(|| src.clone()));
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src_path, &dest_path)?;
        }
        Ok(())
    }

    /// Step 3.3: copy full catpkg dirs from each source repo, replacing any
    /// existing destination dir and pruning `__pycache__`.
    pub fn copy_packages(&self, packages: &HashMap<String, Vec<String>>) -> Result<()> {
        for (repo_name, catpkgs) in packages {
            let Some(repo_root) = self.source_repo_roots.get(repo_name) else {
                return Err(Error::Configuration(format!("unknown source repo: {repo_name}")));
            };
            for catpkg in catpkgs {
                let src = repo_root.join(catpkg);
                if !src.exists() {
                    continue;
                }
                let dest = self.dest_root.join(catpkg);
                if dest.exists() {
                    std::fs::remove_dir_all(&dest)?;
                }
                copy_dir_pruned(&src, &dest, &["__pycache__"])?;
            }
        }
        Ok(())
    }

    /// Step 3.4: remove `exclude:` paths from the destination.
    pub fn apply_excludes(&self, exclude: &[String]) -> Result<()> {
        for rel in exclude {
            let path = self.dest_root.join(rel);
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else if path.is_file() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Run autogen in-place over `root`: every `autogen.yaml`/standalone
    /// recipe found renders its ebuilds directly into `root`, the way a
    /// sourced tree or kit-fixups slice is expected to be autogen-capable.
    /// `current_repo`/`fixups_repo` feed generator (and `preprocess_packages`)
    /// resolution's second and third lookup tiers.
    pub async fn run_autogen_in(
        root: &Utf8Path,
        ctx: Arc<Context>,
        orchestrator: &AutogenOrchestrator,
        global_defaults: &serde_yaml::Mapping,
        current_repo: Option<&Utf8Path>,
        fixups_repo: Option<&Utf8Path>,
    ) -> Result<Vec<Failure>> {
        let discovery = RecipeDiscovery::new(root.to_path_buf(), DiscoveryFilter::default());
        let units = discovery.discover(None)?;
        if units.is_empty() {
            return Ok(Vec::new());
        }
        Ok(orchestrator.run(ctx, units, global_defaults, &root.to_path_buf(), current_repo, fixups_repo).await)
    }

    /// Step 3 (sourced kit): run autogen inside the sourced tree if it's
    /// autogen-capable, then mirror its contents into the destination,
    /// excluding `profiles/repo_name`, `profiles/categories`, `metadata/**`.
    pub async fn populate_sourced(
        &self,
        source_root: &Utf8Path,
        ctx: Arc<Context>,
        orchestrator: &AutogenOrchestrator,
        global_defaults: &serde_yaml::Mapping,
        fixups_repo: Option<&Utf8Path>,
    ) -> Result<Vec<Failure>> {
        let failures =
            Self::run_autogen_in(source_root, ctx, orchestrator, global_defaults, Some(source_root), fixups_repo).await?;
        copy_dir_pruned_excluding(source_root, &self.dest_root, &[])?;
        let metadata_dir = self.dest_root.join("metadata");
        if metadata_dir.exists() {
            std::fs::remove_dir_all(&metadata_dir)?;
        }
        for stale in ["profiles/repo_name", "profiles/categories"] {
            let path = self.dest_root.join(stale);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(failures)
    }

    /// Step 3.5: apply one kit-fixups slice (`global`, `curated`, branch) in
    /// precedence order, copying eclass/licenses/profiles/README, running
    /// autogen in the slice, then inserting its ebuilds with replace
    /// semantics.
    pub async fn apply_fixups_slice(
        &self,
        slice_root: &Utf8Path,
        ctx: Arc<Context>,
        orchestrator: &AutogenOrchestrator,
        global_defaults: &serde_yaml::Mapping,
        current_repo: Option<&Utf8Path>,
        fixups_root: &Utf8Path,
    ) -> Result<Vec<Failure>> {
        if !slice_root.exists() {
            return Ok(Vec::new());
        }
        for (sub, excludes) in [("eclass", &[][..]), ("licenses", &[][..]), ("profiles", &["repo_name", "categories"][..])] {
            let src = slice_root.join(sub);
            if !src.exists() {
                continue;
            }
            copy_dir_pruned_excluding(&src, &self.dest_root.join(sub), excludes)?;
        }
        let readme = slice_root.join("README.rst");
        if readme.exists() {
            std::fs::copy(&readme, self.dest_root.join("README.rst"))?;
        }

        let failures =
            Self::run_autogen_in(slice_root, ctx, orchestrator, global_defaults, current_repo, Some(fixups_root)).await?;

        for entry in sorted_dir_list_utf8(slice_root)? {
            let entry_path = entry.path();
            if !entry_path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if matches!(name, "eclass" | "licenses" | "profiles") {
                continue;
            }
            // remaining top-level dirs are catpkg ebuild directories inserted with replace=true
            for catpkg_entry in sorted_dir_list_utf8(entry_path)? {
                let catpkg_path = catpkg_entry.path();
                if !catpkg_path.is_dir() {
                    continue;
                }
                let catpkg = format!("{name}/{}", catpkg_entry.file_name());
                let dest = self.dest_root.join(&catpkg);
                if dest.exists() {
                    std::fs::remove_dir_all(&dest)?;
                }
                copy_dir_pruned(catpkg_path, &dest, &["__pycache__"])?;
            }
        }
        Ok(failures)
    }

    /// Step 4: post-process. Removes `__pycache__`, writes `COPYRIGHT.rst`,
    /// strips ChangeLog files, reduces Manifests to DIST-only, rebuilds
    /// `profiles/categories`, and (core-kit only) rewrites thirdpartymirrors.
    pub fn post_process(&self, copyright_fragments: &[String], cur_year: i32, is_core_kit: bool) -> Result<()> {
        remove_named_dirs(&self.dest_root, "__pycache__")?;
        remove_named_files(&self.dest_root, |name| name.eq_ignore_ascii_case("changelog"))?;

        let mut copyright = String::new();
        for fragment in copyright_fragments {
            copyright.push_str(&fragment.replace("{{cur_year}}", &cur_year.to_string()));
            copyright.push('\n');
        }
        atomic_write_file(self.dest_root.join("COPYRIGHT.rst"), copyright.as_bytes())?;

        reduce_manifests_to_dist(&self.dest_root)?;
        rebuild_categories(&self.dest_root)?;

        if is_core_kit {
            std::fs::create_dir_all(self.dest_root.join("eclass/ELT-patches"))?;
            rewrite_thirdpartymirrors(&self.dest_root)?;
        }
        Ok(())
    }

    /// Load every `.eclass` file present in `dest_root/eclass` into an
    /// [`EclassHashSet`], the way `regenerate_metadata` wants its `this_kit`
    /// argument: the set of eclasses this kit itself carries, as opposed to
    /// ones inherited from `masters`.
    pub fn local_eclasses(&self) -> Result<EclassHashSet> {
        load_eclass_dir(&self.dest_root.join("eclass"))
    }

    /// Step 5: metadata regeneration, parallel within this step over a
    /// thread pool sized to the logical CPU count.
    pub fn regenerate_metadata(
        &self,
        masters: &EclassHashSet,
        this_kit: &EclassHashSet,
        cache: &KitMetadataCache,
    ) -> Result<BTreeSet<String>> {
        let effective = EclassHashSet::effective(masters, this_kit);
        let eclass_hash_pairs = effective.sorted_hashes();
        let eclass_paths: Vec<Utf8PathBuf> = self
            .dest_root
            .join("eclass")
            .exists()
            .then(|| vec![self.dest_root.join("eclass")])
            .unwrap_or_default();

        let ebuilds = collect_ebuild_paths(&self.dest_root)?;
        let workers = bounded_jobs(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Configuration(format!("failed building metadata pool: {e}")))?;

        let extractor = self.metadata_extractor.clone();
        let dest_root = self.dest_root.clone();
        let results: Vec<Result<(String, BTreeSet<String>)>> = pool.install(|| {
            ebuilds
                .par_iter()
                .map(|ebuild_path| {
                    regenerate_one(ebuild_path, &dest_root, &eclass_paths, &eclass_hash_pairs, cache, &extractor)
                })
                .collect()
        });

        let mut licenses = BTreeSet::new();
        for result in results {
            let (_, found) = result?;
            licenses.extend(found);
        }
        Ok(licenses)
    }

    /// Step 6: copy referenced, not-yet-local licenses from the source
    /// collection, searching repos in reverse precedence.
    pub fn copy_licenses(&self, licenses: &BTreeSet<String>, source_order: &[Utf8PathBuf]) -> Result<()> {
        let dest_licenses = self.dest_root.join("licenses");
        std::fs::create_dir_all(&dest_licenses)?;
        for license in licenses {
            let dest = dest_licenses.join(license);
            if dest.exists() {
                continue;
            }
            for repo_root in source_order.iter().rev() {
                let candidate = repo_root.join("licenses").join(license);
                if candidate.exists() {
                    std::fs::copy(&candidate, &dest)?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Step 7: generate python-use, commit with a fixed message, return the
    /// new HEAD SHA.
    pub fn finalize(&self, per_catpkg_versions: &HashMap<String, Vec<(String, String)>>, tree: &GitTree) -> Result<String> {
        let mut lines = Vec::new();
        for (catpkg, versions) in per_catpkg_versions {
            lines.extend(catpkg_python_use_lines(catpkg, versions));
        }
        lines.sort();
        let python_use_path = self.dest_root.join("profiles/use.local.desc");
        if !lines.is_empty() {
            atomic_write_file(&python_use_path, (lines.join("\n") + "\n").as_bytes())?;
        }

        tree.commit_all(&format!("{} kit updates", self.kit_name), &[])
    }
}

fn regenerate_one(
    ebuild_path: &Utf8Path,
    dest_root: &Utf8Path,
    eclass_paths: &[Utf8PathBuf],
    eclass_hash_pairs: &[(String, String)],
    cache: &KitMetadataCache,
    extractor: &Utf8Path,
) -> Result<(String, BTreeSet<String>)> {
    let catpkg_dir = ebuild_path.parent().ok_or_else(|| Error::GitTree("ebuild has no parent dir".into()))?;
    let category = catpkg_dir
        .parent()
        .and_then(|p| p.file_name())
        .ok_or_else(|| Error::GitTree("cannot determine category".into()))?;
    let ident = parse_ebuild_ident(category, ebuild_path)?;
    let atom = format!("{}/{}", ident.category, ident.pf);

    let ebuild_md5 = crate::hash::ContentHash::compute_file(ebuild_path.as_std_path(), &[crate::hash::HashKind::Sha256])?
        .digests
        .get(&crate::hash::HashKind::Sha256)
        .cloned()
        .unwrap_or_default();

    let manifest_path = catpkg_dir.join("Manifest");
    let manifest_md5 = manifest_path
        .exists()
        .then(|| crate::hash::ContentHash::compute_file(manifest_path.as_std_path(), &[crate::hash::HashKind::Sha256]).ok())
        .flatten()
        .and_then(|h| h.digests.get(&crate::hash::HashKind::Sha256).cloned());

    if let Some(hit) = cache.get(&atom, &ebuild_md5, manifest_md5.as_deref(), eclass_hash_pairs) {
        let out_path = dest_root.join("metadata/md5-cache").join(&atom);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write_file(&out_path, hit.metadata_out.as_bytes())?;
        return Ok((atom, hit.licenses.into_iter().collect()));
    }

    let env = build_extraction_env(&ident, ebuild_path);
    let extracted = futures::executor::block_on(crate::metadata_extract::extract_metadata(
        extractor,
        ebuild_path,
        &env,
        eclass_paths,
    ))?;

    let eclasses_line = eclass_hashes_line(eclass_hash_pairs);
    let auxdb = render_auxdb_block(&extracted.fields, &eclasses_line, &ebuild_md5);
    let out_path = dest_root.join("metadata/md5-cache").join(&atom);
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    atomic_write_file(&out_path, auxdb.as_bytes())?;

    let licenses = extracted
        .fields
        .get("LICENSE")
        .map(|l| extract_license_tokens(l))
        .unwrap_or_default();

    cache.put(
        &atom,
        KitMetadataRecord {
            ebuild_md5,
            manifest_md5,
            eclass_hashes: eclass_hash_pairs.to_vec(),
            metadata: extracted.fields,
            metadata_out: auxdb,
            licenses: licenses.iter().cloned().collect(),
        },
    );

    Ok((atom, licenses))
}

/// Strip `||`, `(`, `)`, USE-conditional (`foo?`) and blocker (`!`) tokens
/// from a `LICENSE` value, leaving bare license names.
fn extract_license_tokens(license: &str) -> BTreeSet<String> {
    license
        .split_whitespace()
        .filter(|t| !matches!(*t, "||" | "(" | ")"))
        .filter(|t| !t.ends_with('?'))
        .map(|t| t.trim_start_matches('!').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Load every `.eclass` file directly under `dir` into an [`EclassHashSet`].
/// Used for both a kit's own eclasses and, by callers assembling a
/// dependent kit, each of its masters' already-regenerated eclass sets.
pub fn load_eclass_dir(dir: &Utf8Path) -> Result<EclassHashSet> {
    let set = EclassHashSet::new();
    if !dir.exists() {
        return Ok(set);
    }
    for entry in sorted_dir_list_utf8(dir)? {
        let path = entry.path();
        if path.extension() != Some("eclass") {
            continue;
        }
        set.insert(Eclass::load(path)?)?;
    }
    Ok(set)
}

fn collect_ebuild_paths(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) {
            let is_hidden = path.file_name().map(|n| n.starts_with('.')).unwrap_or(true);
            if !is_hidden && path.extension() == Some("ebuild") {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn copy_dir_pruned(src: &Utf8Path, dest: &Utf8Path, prune_names: &[&str]) -> Result<()> {
    copy_dir_pruned_excluding(src, dest, &[])?;
    remove_named_dirs(dest, prune_names.first().copied().unwrap_or("__pycache__"))
}

fn copy_dir_pruned_excluding(src: &Utf8Path, dest: &Utf8Path, exclude_top_level: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src.as_std_path())? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if exclude_top_level.contains(&name_str.as_ref()) {
            continue;
        }
        let src_path = entry.path();
        let dest_path = dest.as_std_path().join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_pruned_excluding(
                &Utf8PathBuf::from_path_buf(src_path).map_err(|_| Error::GitTree("non-utf8 path".into()))?,
                &Utf8PathBuf::from_path_buf(dest_path).map_err(|_| Error::GitTree("non-utf8 path".into()))?,
                &[],
            )?;
        } else {
            std::fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}

fn remove_named_dirs(root: &Utf8Path, name: &str) -> Result<()> {
    let mut targets = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() && entry.file_name() == name {
            targets.push(entry.path().to_path_buf());
        }
    }
    for target in targets {
        std::fs::remove_dir_all(target)?;
    }
    Ok(())
}

fn remove_named_files(root: &Utf8Path, pred: impl Fn(&str) -> bool) -> Result<()> {
    let mut targets = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && pred(&entry.file_name().to_string_lossy()) {
            targets.push(entry.path().to_path_buf());
        }
    }
    for target in targets {
        std::fs::remove_file(target)?;
    }
    Ok(())
}

fn reduce_manifests_to_dist(root: &Utf8Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_name() != "Manifest" || !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let text = std::fs::read_to_string(path)?;
        let reduced: String = text
            .lines()
            .filter(|l| l.starts_with("DIST "))
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(path, reduced + "\n")?;
    }
    Ok(())
}

/// Rebuild `profiles/categories` from top-level dirs matching `*-*` or `virtual`.
fn rebuild_categories(root: &Utf8Path) -> Result<()> {
    let mut categories = BTreeSet::new();
    for entry in sorted_dir_list_utf8(root)? {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name == "virtual" || name.contains('-') {
            categories.insert(name.to_string());
        }
    }
    let body = categories.into_iter().collect::<Vec<_>>().join("\n") + "\n";
    atomic_write_file(root.join("profiles/categories"), body.as_bytes())
}

/// Core-kit only: prefix the `gentoo` mirror line with Funtoo's mirror and
/// append a standalone `funtoo` line.
fn rewrite_thirdpartymirrors(root: &Utf8Path) -> Result<()> {
    const FASTPULL: &str = "https://fastpull-us.funtoo.org/distfiles";
    let path = root.join("profiles/thirdpartymirrors");
    let text = std::fs::read_to_string(&path).unwrap_or_default();
    let mut out = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("gentoo\t") {
            let first_url = rest.split_whitespace().next().unwrap_or_default();
            out.push(format!("gentoo\t{first_url} {FASTPULL} {rest}"));
        } else {
            out.push(line.to_string());
        }
    }
    out.push(format!("funtoo {FASTPULL}"));
    atomic_write_file(&path, (out.join("\n") + "\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_conf_renders_required_keys() {
        let layout = LayoutConf { repo_name: "core-kit".into(), aliases: vec![], masters: vec![] };
        let rendered = layout.render();
        assert!(rendered.contains("repo-name = core-kit"));
        assert!(rendered.contains("cache-formats = md5-dict"));
    }

    #[test]
    fn license_token_extraction_strips_operators() {
        let licenses = extract_license_tokens("|| ( GPL-2 MIT ) foo? ( Apache-2.0 )");
        assert_eq!(licenses, BTreeSet::from(["GPL-2".to_string(), "MIT".to_string(), "Apache-2.0".to_string()]));
    }

    #[test]
    fn thirdpartymirrors_rewrite_prefixes_gentoo_line() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("profiles")).unwrap();
        std::fs::write(root.join("profiles/thirdpartymirrors"), "gentoo\thttps://a https://b\n").unwrap();
        rewrite_thirdpartymirrors(&root).unwrap();
        let text = std::fs::read_to_string(root.join("profiles/thirdpartymirrors")).unwrap();
        assert!(text.starts_with("gentoo\thttps://a https://fastpull-us.funtoo.org/distfiles"));
        assert!(text.trim_end().ends_with("funtoo https://fastpull-us.funtoo.org/distfiles"));
    }

    #[test]
    fn packages_spec_flattens_nested_catpkg_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path = root.join("packages.yaml");
        std::fs::write(
            &path,
            r#"
packages:
  - gentoo-staging:
      sys-apps:
        - portage
      dev-lang:
        python: [python]
eclasses:
  mask: ["old-eclass"]
  include:
    gentoo-staging: ["*"]
copyfiles:
  - src: metadata/dtd/timestamp.xml
exclude:
  - sys-apps/broken-pkg
"#,
        )
        .unwrap();

        let (packages, eclasses) = PackagesSpec::load(&path).unwrap();
        let mut leaves = packages.packages["gentoo-staging"].clone();
        leaves.sort();
        assert_eq!(leaves, vec!["portage".to_string(), "python".to_string()]);
        assert_eq!(packages.exclude, vec!["sys-apps/broken-pkg".to_string()]);
        assert_eq!(packages.copyfiles, vec![("metadata/dtd/timestamp.xml".to_string(), None)]);
        assert!(eclasses.mask.contains(&"old-eclass".to_string()));
    }

    #[test]
    fn local_eclasses_loads_copied_eclass_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("eclass")).unwrap();
        std::fs::write(root.join("eclass/foo.eclass"), "# foo\n").unwrap();
        std::fs::write(root.join("eclass/bar.eclass"), "# bar\n").unwrap();

        let spec = KitSpec {
            kind: None,
            source: None,
            stability: HashMap::new(),
            branch: None,
            eclasses: EclassSpec::default(),
            priority: None,
            aliases: vec![],
            masters: vec![],
            sync_url: None,
            settings: serde_yaml::Mapping::new(),
            deprecated: false,
        };
        let assembler = KitAssembler {
            dest_root: root,
            kit_name: "core-kit".into(),
            branch: "master".into(),
            spec: &spec,
            source_repo_roots: HashMap::new(),
            metadata_extractor: Utf8PathBuf::from("/bin/true"),
        };
        let set = assembler.local_eclasses().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("foo").is_some());
    }

    #[test]
    fn categories_rebuild_matches_hyphenated_and_virtual() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("sys-apps")).unwrap();
        std::fs::create_dir_all(root.join("virtual")).unwrap();
        std::fs::create_dir_all(root.join("metadata")).unwrap();
        rebuild_categories(&root).unwrap();
        let text = std::fs::read_to_string(root.join("profiles/categories")).unwrap();
        assert!(text.contains("sys-apps"));
        assert!(text.contains("virtual"));
        assert!(!text.contains("metadata"));
    }
}
