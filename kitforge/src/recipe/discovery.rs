//! Walks a start path for `autogen.yaml` rule files and standalone generator
//! scripts, expanding each into dispatchable [`WorkUnit`]s.

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::{Mapping, Value};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::recipe::model::{PkgInfo, Rule, WorkUnit};

/// Name of the marker file identifying a standalone, non-YAML recipe. The
/// system this mirrors shells out to an interpreted script; the equivalent
/// here is an external subprocess generator reference resolved at dispatch
/// time (see `crate::autogen::registry`).
const STANDALONE_MARKER: &str = "generate";
const YAML_MARKER: &str = "autogen.yaml";

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub category: Option<String>,
    pub package: Option<String>,
}

impl DiscoveryFilter {
    fn matches(&self, pkginfo: &PkgInfo) -> bool {
        if let Some(cat) = &self.category {
            if pkginfo.cat().ok().as_deref() != Some(cat.as_str()) {
                return false;
            }
        }
        if let Some(pkg) = &self.package {
            if pkginfo.name().ok().as_deref() != Some(pkg.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct RecipeDiscovery {
    start: Utf8PathBuf,
    filter: DiscoveryFilter,
}

impl RecipeDiscovery {
    pub fn new(start: Utf8PathBuf, filter: DiscoveryFilter) -> Self {
        Self { start, filter }
    }

    /// Discover work units under the start path, optionally restricted to an
    /// explicit file list (used by `doit`'s single-package mode).
    pub fn discover(&self, explicit_files: Option<&[Utf8PathBuf]>) -> Result<Vec<WorkUnit>> {
        let mut units = Vec::new();
        let paths: Vec<Utf8PathBuf> = match explicit_files {
            Some(files) => files.to_vec(),
            None => self.walk()?,
        };

        for path in paths {
            if path.file_name() == Some(YAML_MARKER) {
                units.extend(self.expand_yaml_recipe(&path)?);
            } else if path.file_name() == Some(STANDALONE_MARKER) {
                units.push(self.expand_standalone_recipe(&path)?);
            }
        }
        Ok(units)
    }

    fn walk(&self) -> Result<Vec<Utf8PathBuf>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.start).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == YAML_MARKER || name == STANDALONE_MARKER {
                if let Ok(utf8) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) {
                    found.push(utf8);
                }
            }
        }
        Ok(found)
    }

    fn expand_standalone_recipe(&self, path: &Utf8Path) -> Result<WorkUnit> {
        let parent = path.parent().ok_or_else(|| Error::Recipe(format!("{path}: no parent dir")))?;
        let name = parent
            .file_name()
            .ok_or_else(|| Error::Recipe(format!("{path}: no package dir")))?
            .to_string();
        let grandparent = parent.parent().ok_or_else(|| Error::Recipe(format!("{path}: no cat dir")))?;
        let cat = grandparent
            .file_name()
            .ok_or_else(|| Error::Recipe(format!("{path}: no cat dir")))?
            .to_string();

        let mut pkginfo = PkgInfo::default();
        pkginfo.insert("name", Value::from(name.clone()));
        pkginfo.insert("cat", Value::from(cat.clone()));

        Ok(WorkUnit {
            gen_path: parent.to_path_buf(),
            generator_ref: path.to_string(),
            template_path: None,
            defaults: Mapping::new(),
            pkginfo_list: vec![pkginfo],
            autogen_id: format!("{cat}/{name}"),
        })
    }

    fn expand_yaml_recipe(&self, path: &Utf8Path) -> Result<Vec<WorkUnit>> {
        let text = std::fs::read_to_string(path)?;
        let doc: Mapping = serde_yaml::from_str(&text)?;
        let gen_path = path.parent().unwrap_or(Utf8Path::new(".")).to_path_buf();

        let mut units = Vec::new();
        for (rule_name, rule_value) in &doc {
            let rule_name = rule_name.as_str().unwrap_or("rule").to_string();
            let rule = parse_rule(&rule_name, rule_value)?;

            let mut pkginfo_list = Vec::new();
            for entry in &rule.packages {
                for expanded in expand_package_entry(entry)? {
                    if self.filter.matches(&expanded) {
                        pkginfo_list.push(expanded);
                    }
                }
            }

            units.push(WorkUnit {
                gen_path: gen_path.clone(),
                generator_ref: rule.generator,
                template_path: None,
                defaults: rule.defaults,
                pkginfo_list,
                autogen_id: format!("{path}::{rule_name}"),
            });
        }
        Ok(units)
    }
}

fn parse_rule(name: &str, value: &Value) -> Result<Rule> {
    let map = value
        .as_mapping()
        .ok_or_else(|| Error::Recipe(format!("rule {name}: expected mapping")))?;
    let generator = map
        .get(Value::from("generator"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Recipe(format!("rule {name}: missing generator")))?
        .to_string();
    let defaults = map
        .get(Value::from("defaults"))
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    let packages = map
        .get(Value::from("packages"))
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    Ok(Rule { name: name.to_string(), generator, defaults, packages })
}

/// Expand one `packages:` list item into zero-or-more concrete [`PkgInfo`]s,
/// per the package-entry forms in the autogen YAML grammar.
fn expand_package_entry(entry: &Value) -> Result<Vec<PkgInfo>> {
    match entry {
        Value::String(name) => {
            let mut map = Mapping::new();
            map.insert(Value::from("name"), Value::from(name.clone()));
            Ok(vec![PkgInfo::from_mapping(map)])
        }
        Value::Mapping(map) if map.len() == 1 => {
            let (key, value) = map.iter().next().expect("len checked above");
            if key.as_str() != Some("pkg") {
                return Ok(vec![PkgInfo::from_mapping(map.clone())]);
            }
            let value_map = value
                .as_mapping()
                .ok_or_else(|| Error::Recipe("pkg entry value must be a mapping".into()))?;
            expand_pkg_entry(value_map)
        }
        Value::Mapping(map) => Ok(vec![PkgInfo::from_mapping(map.clone())]),
        other => Err(Error::Recipe(format!("unsupported package entry: {other:?}"))),
    }
}

fn expand_pkg_entry(value_map: &Mapping) -> Result<Vec<PkgInfo>> {
    let Some(versions) = value_map.get(Value::from("versions")).and_then(Value::as_mapping) else {
        return Ok(vec![PkgInfo::from_mapping(value_map.clone())]);
    };

    let mut local_defaults = value_map.clone();
    local_defaults.remove(Value::from("versions"));

    let mut entries = Vec::new();
    for (version_key, overrides) in versions {
        let mut entry = local_defaults.clone();
        if let Some(overrides_map) = overrides.as_mapping() {
            for (k, v) in overrides_map {
                entry.insert(k.clone(), v.clone());
            }
        }

        let version_text = normalize_version_key(version_key);
        match version_text {
            Some(v) => {
                entry.insert(Value::from("version"), Value::from(v));
            }
            None => {
                entry.remove(Value::from("version"));
            }
        }
        entries.push(PkgInfo::from_mapping(entry));
    }
    Ok(entries)
}

/// `latest`/`null` strip the version field; float-valued keys are coerced to
/// their textual form (YAML parses unquoted `1.20` as a float).
fn normalize_version_key(key: &Value) -> Option<String> {
    match key {
        Value::Null => None,
        Value::String(s) if s == "latest" => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_entry_becomes_name_only_pkginfo() {
        let entries = expand_package_entry(&Value::from("foo")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name().unwrap(), "foo");
    }

    #[test]
    fn pkg_entry_with_versions_expands_one_per_version() {
        let yaml = r#"
pkg:
  name: foo
  versions:
    "1.0": {}
    "2.0": { revision: 1 }
"#;
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let entries = expand_package_entry(&value).unwrap();
        assert_eq!(entries.len(), 2);
        let versions: Vec<String> =
            entries.iter().map(|e| e.str_field("version").unwrap()).collect();
        assert!(versions.contains(&"1.0".to_string()));
        assert!(versions.contains(&"2.0".to_string()));
    }

    #[test]
    fn latest_version_key_strips_version_field() {
        let yaml = r#"
pkg:
  name: foo
  versions:
    latest: {}
"#;
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let entries = expand_package_entry(&value).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].str_field("version"), None);
    }

    #[test]
    fn plain_mapping_entry_is_used_verbatim() {
        let yaml = "name: foo\ncat: sys-apps\n";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let entries = expand_package_entry(&value).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cat().unwrap(), "sys-apps");
    }
}
