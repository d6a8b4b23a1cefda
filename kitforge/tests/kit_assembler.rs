//! Exercises a full kit regeneration cycle against real git checkouts and a
//! real source tree: clean, seed, copy eclasses/packages, post-process,
//! regenerate metadata (no ebuilds, so no external extractor is invoked) and
//! commit.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use kitforge::git_tree::GitTree;
use kitforge::kit::assembler::KitAssembler;
use kitforge::kit::eclass::EclassHashSet;
use kitforge::kit::metadata_cache::KitMetadataCache;
use kitforge::kit::model::{EclassSpec, KitSpec};

fn init_origin_repo(path: &Utf8PathBuf) {
    let repo = git2::Repository::init(path).unwrap();
    std::fs::write(path.join("README"), "origin\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new("README")).unwrap();
    index.write().unwrap();
    let tree_oid = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = git2::Signature::now("test", "test@localhost").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
}

#[test]
fn sourced_kit_assembly_cycle_commits_a_populated_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

    let source_root = root.join("source/core-kit");
    std::fs::create_dir_all(source_root.join("eclass")).unwrap();
    std::fs::write(source_root.join("eclass/foo.eclass"), "# foo eclass\n").unwrap();
    std::fs::create_dir_all(source_root.join("sys-apps/bar")).unwrap();
    std::fs::write(source_root.join("sys-apps/bar/metadata.xml"), "<pkgmetadata/>\n").unwrap();

    let origin = root.join("origin.git");
    init_origin_repo(&origin);
    let dest_root = root.join("kits/core-kit");
    let tree = GitTree::open_or_clone(&dest_root, origin.as_str()).unwrap();

    let spec = KitSpec { kind: None, ..KitSpec::default() };
    let mut source_repo_roots = HashMap::new();
    source_repo_roots.insert("core-kit".to_string(), source_root.clone());

    let assembler = KitAssembler {
        dest_root: dest_root.clone(),
        kit_name: "core-kit".to_string(),
        branch: "master".to_string(),
        spec: &spec,
        source_repo_roots,
        metadata_extractor: root.join("unused-extractor"),
    };

    assembler.clean().unwrap();
    assembler.seed_metadata("Copyright 2020 Example").unwrap();

    let mut eclass_spec = EclassSpec::default();
    eclass_spec.include.insert("core-kit".to_string(), vec!["*".to_string()]);
    assembler.copy_eclasses(&eclass_spec).unwrap();

    let mut packages = HashMap::new();
    packages.insert("core-kit".to_string(), vec!["sys-apps/bar".to_string()]);
    assembler.copy_packages(&packages).unwrap();
    assembler.apply_excludes(&[]).unwrap();

    assembler.post_process(&["Copyright {{cur_year}} Example".to_string()], 2026, false).unwrap();

    assert!(dest_root.join("eclass/foo.eclass").exists());
    assert!(dest_root.join("sys-apps/bar/metadata.xml").exists());
    assert_eq!(
        std::fs::read_to_string(dest_root.join("profiles/repo_name")).unwrap().trim(),
        "core-kit"
    );
    let copyright = std::fs::read_to_string(dest_root.join("COPYRIGHT.rst")).unwrap();
    assert!(copyright.contains("2026"));

    let this_kit = assembler.local_eclasses().unwrap();
    assert_eq!(this_kit.len(), 1);
    assert!(this_kit.get("foo").is_some());

    let masters = EclassHashSet::new();
    let cache = KitMetadataCache::load(root.join("cache/core-kit-master.json")).unwrap();
    let licenses = assembler.regenerate_metadata(&masters, &this_kit, &cache).unwrap();
    assert!(licenses.is_empty(), "no ebuilds were copied, so no licenses should be found");
    cache.save(true).unwrap();

    assembler.copy_licenses(&licenses, &[source_root]).unwrap();

    let sha1 = assembler.finalize(&HashMap::new(), &tree).unwrap();
    assert_eq!(sha1.len(), 40);
    assert_eq!(tree.head_sha1().unwrap(), sha1);
}
