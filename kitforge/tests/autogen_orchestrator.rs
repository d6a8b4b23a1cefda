//! End-to-end autogen dispatch: an external generator subprocess produces a
//! `BreezyBuild` with no artifacts (so the run never touches the network),
//! and the orchestrator renders it into a destination tree.

use std::os::unix::fs::PermissionsExt;

use camino::Utf8PathBuf;
use kitforge::autogen::orchestrator::AutogenOrchestrator;
use kitforge::config::{Context, EngineSettings};
use kitforge::recipe::model::{PkgInfo, WorkUnit};

fn write_executable(path: &Utf8PathBuf, script: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, script).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

#[tokio::test]
async fn orchestrator_renders_ebuild_from_external_generator() {
    let dir = tempfile::tempdir().unwrap();
    let engine_root = Utf8PathBuf::from_path_buf(dir.path().join("engine")).unwrap();
    let dest_root = Utf8PathBuf::from_path_buf(dir.path().join("dest")).unwrap();
    std::fs::create_dir_all(&dest_root).unwrap();

    let gen_path = dest_root.join("sys-apps/widget");
    let generator_path = gen_path.join("generators").join("widget-gen");
    write_executable(
        &generator_path,
        r#"#!/bin/sh
cat <<'EOF'
[{"cat": "sys-apps", "name": "widget", "version": "1.0", "revision": 0, "template_ref": "default", "template_vars": {"description": "a widget"}}]
EOF
"#,
    );

    let ctx = Context::rooted(&engine_root, EngineSettings::default()).unwrap();
    let mut pkginfo = serde_yaml::Mapping::new();
    pkginfo.insert(serde_yaml::Value::from("name"), serde_yaml::Value::from("widget"));
    pkginfo.insert(serde_yaml::Value::from("cat"), serde_yaml::Value::from("sys-apps"));

    let unit = WorkUnit {
        gen_path: gen_path.clone(),
        generator_ref: "widget-gen".to_string(),
        template_path: None,
        defaults: serde_yaml::Mapping::new(),
        pkginfo_list: vec![PkgInfo::from_mapping(pkginfo)],
        autogen_id: "sys-apps/widget::main".to_string(),
    };

    let orchestrator = AutogenOrchestrator::new(2);
    let failures = orchestrator.run(ctx, vec![unit], &serde_yaml::Mapping::new(), &dest_root, None, None).await;

    assert!(failures.is_empty(), "unexpected failures: {failures:?}");
    let ebuild_path = dest_root.join("sys-apps/widget/widget-1.0.ebuild");
    assert!(ebuild_path.exists());
    let body = std::fs::read_to_string(&ebuild_path).unwrap();
    assert!(body.contains("EAPI=8"));
    assert!(body.contains("DESCRIPTION=\"a widget\""));
}

#[tokio::test]
async fn orchestrator_records_a_failure_without_aborting_other_units() {
    let dir = tempfile::tempdir().unwrap();
    let engine_root = Utf8PathBuf::from_path_buf(dir.path().join("engine")).unwrap();
    let dest_root = Utf8PathBuf::from_path_buf(dir.path().join("dest")).unwrap();
    std::fs::create_dir_all(&dest_root).unwrap();

    let good_gen_path = dest_root.join("sys-apps/good");
    write_executable(
        &good_gen_path.join("generators").join("good-gen"),
        r#"#!/bin/sh
echo '[{"cat": "sys-apps", "name": "good", "version": "1.0", "revision": 0, "template_ref": "default", "template_vars": {}}]'
"#,
    );

    let ctx = Context::rooted(&engine_root, EngineSettings::default()).unwrap();

    let mut good_info = serde_yaml::Mapping::new();
    good_info.insert(serde_yaml::Value::from("name"), serde_yaml::Value::from("good"));
    good_info.insert(serde_yaml::Value::from("cat"), serde_yaml::Value::from("sys-apps"));

    let good_unit = WorkUnit {
        gen_path: good_gen_path,
        generator_ref: "good-gen".to_string(),
        template_path: None,
        defaults: serde_yaml::Mapping::new(),
        pkginfo_list: vec![PkgInfo::from_mapping(good_info)],
        autogen_id: "sys-apps/good::main".to_string(),
    };

    let missing_unit = WorkUnit {
        gen_path: dest_root.join("sys-apps/missing"),
        generator_ref: "does-not-exist".to_string(),
        template_path: None,
        defaults: serde_yaml::Mapping::new(),
        pkginfo_list: vec![],
        autogen_id: "sys-apps/missing::main".to_string(),
    };

    let orchestrator = AutogenOrchestrator::new(2);
    let failures =
        orchestrator.run(ctx, vec![good_unit, missing_unit], &serde_yaml::Mapping::new(), &dest_root, None, None).await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].label, "sys-apps/missing::main");
    assert!(dest_root.join("sys-apps/good/good-1.0.ebuild").exists());
}

#[tokio::test]
async fn orchestrator_applies_preprocess_packages_hook_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let engine_root = Utf8PathBuf::from_path_buf(dir.path().join("engine")).unwrap();
    let dest_root = Utf8PathBuf::from_path_buf(dir.path().join("dest")).unwrap();
    std::fs::create_dir_all(&dest_root).unwrap();

    let gen_path = dest_root.join("sys-apps/widget");
    write_executable(
        &gen_path.join("generators").join("widget-gen"),
        r#"#!/bin/sh
cat <<'EOF'
[{"cat": "sys-apps", "name": "widget", "version": "1.0", "revision": 0, "template_ref": "default", "template_vars": {"description": "from preprocess"}}]
EOF
"#,
    );
    // The preprocessor drops the input entirely and substitutes its own pkginfo,
    // proving the orchestrator dispatched on its output, not the original list.
    write_executable(
        &gen_path.join("generators").join("widget-gen.preprocess"),
        r#"#!/bin/sh
cat <<'EOF'
[{"cat": "sys-apps", "name": "widget", "extra": "injected"}]
EOF
"#,
    );

    let ctx = Context::rooted(&engine_root, EngineSettings::default()).unwrap();
    let mut pkginfo = serde_yaml::Mapping::new();
    pkginfo.insert(serde_yaml::Value::from("name"), serde_yaml::Value::from("original"));
    pkginfo.insert(serde_yaml::Value::from("cat"), serde_yaml::Value::from("sys-apps"));

    let unit = WorkUnit {
        gen_path,
        generator_ref: "widget-gen".to_string(),
        template_path: None,
        defaults: serde_yaml::Mapping::new(),
        pkginfo_list: vec![PkgInfo::from_mapping(pkginfo)],
        autogen_id: "sys-apps/widget::main".to_string(),
    };

    let orchestrator = AutogenOrchestrator::new(2);
    let failures = orchestrator.run(ctx, vec![unit], &serde_yaml::Mapping::new(), &dest_root, None, None).await;

    assert!(failures.is_empty(), "unexpected failures: {failures:?}");
    assert!(dest_root.join("sys-apps/widget/widget-1.0.ebuild").exists());
}
