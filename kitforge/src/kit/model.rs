//! Release-YAML data model and the kit dependency graph.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};
use crate::recipe::merge::recursive_merge;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDef {
    pub url: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryDef {
    pub url: String,
    pub branch: Option<String>,
    pub src_sha1: Option<String>,
    pub copyright: Option<String>,
    #[serde(default)]
    pub eclasses: Vec<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KitKind {
    Auto,
    Sourced,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EclassSpec {
    #[serde(default)]
    pub mask: Vec<String>,
    #[serde(default)]
    pub include: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KitSpec {
    #[serde(default)]
    pub kind: Option<KitKind>,
    pub source: Option<String>,
    #[serde(default)]
    pub stability: HashMap<String, String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub eclasses: EclassSpec,
    pub priority: Option<i64>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub masters: Vec<String>,
    pub sync_url: Option<String>,
    #[serde(default)]
    pub settings: Mapping,
    #[serde(default)]
    pub deprecated: bool,
}

/// A single `kits:` list entry: a bare name (all defaults apply) or a
/// `name: {..}` mapping.
#[derive(Debug, Clone)]
pub struct KitEntry {
    pub name: String,
    pub spec: KitSpec,
}

#[derive(Debug, Clone, Default)]
pub struct KitDefinitions {
    pub defaults: Mapping,
    pub kits: Vec<KitEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseDef {
    pub copyright: String,
    pub metadata: Mapping,
    pub remotes: HashMap<String, RemoteDef>,
    pub repositories: HashMap<String, RepositoryDef>,
    pub source_collections: HashMap<String, Vec<String>>,
    pub kit_definitions: KitDefinitions,
}

impl ReleaseDef {
    /// Parse a `releases/<name>/repositories.yaml`, rooted at a top-level
    /// `release:` key, into a [`ReleaseDef`]. `repositories` and `kits`
    /// entries use the single-key-mapping-or-bare-name shape described at
    /// `# 6. EXTERNAL INTERFACES`; this isn't a plain derive.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: Mapping = serde_yaml::from_str(text)?;
        let release = doc
            .get("release")
            .ok_or_else(|| Error::Configuration("release YAML missing top-level `release:` key".into()))?;
        let release = release
            .as_mapping()
            .ok_or_else(|| Error::Configuration("`release:` must be a mapping".into()))?;

        let copyright = release.get("copyright").and_then(Value::as_str).unwrap_or_default().to_string();
        let metadata = release.get("metadata").and_then(Value::as_mapping).cloned().unwrap_or_default();

        let remotes = release
            .get("remotes")
            .and_then(Value::as_mapping)
            .map(|m| -> Result<HashMap<String, RemoteDef>> {
                m.iter()
                    .map(|(k, v)| {
                        let name = k.as_str().unwrap_or_default().to_string();
                        let def: RemoteDef = serde_yaml::from_value(v.clone())?;
                        Ok((name, def))
                    })
                    .collect()
            })
            .transpose()?
            .unwrap_or_default();

        let repositories = release
            .get("repositories")
            .and_then(Value::as_sequence)
            .map(parse_single_key_mappings::<RepositoryDef>)
            .transpose()?
            .unwrap_or_default();

        let source_collections = release
            .get("source-collections")
            .and_then(Value::as_mapping)
            .map(|m| -> Result<HashMap<String, Vec<String>>> {
                m.iter()
                    .map(|(k, v)| {
                        let name = k.as_str().unwrap_or_default().to_string();
                        let items = v.as_sequence().ok_or_else(|| {
                            Error::Configuration(format!("source-collections.{name}: expected a list"))
                        })?;
                        let repos = items
                            .iter()
                            .map(|item| match item {
                                Value::String(s) => Ok(s.clone()),
                                Value::Mapping(m) => m
                                    .iter()
                                    .next()
                                    .and_then(|(k, _)| k.as_str())
                                    .map(str::to_string)
                                    .ok_or_else(|| {
                                        Error::Configuration(format!("source-collections.{name}: empty override entry"))
                                    }),
                                other => Err(Error::Configuration(format!(
                                    "source-collections.{name}: unexpected item {other:?}"
                                ))),
                            })
                            .collect::<Result<Vec<String>>>()?;
                        Ok((name, repos))
                    })
                    .collect()
            })
            .transpose()?
            .unwrap_or_default();

        let kit_definitions = release
            .get("kit-definitions")
            .and_then(Value::as_mapping)
            .map(parse_kit_definitions)
            .transpose()?
            .unwrap_or_default();

        Ok(Self { copyright, metadata, remotes, repositories, source_collections, kit_definitions })
    }

    pub fn load(path: &camino::Utf8Path) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }
}

/// Parse a YAML sequence of single-key mappings (`name: {..fields}`) into a
/// `HashMap<String, T>`, the shape `repositories:` and similar lists use.
fn parse_single_key_mappings<T: for<'de> Deserialize<'de>>(items: &[Value]) -> Result<HashMap<String, T>> {
    items
        .iter()
        .map(|item| {
            let mapping = item
                .as_mapping()
                .ok_or_else(|| Error::Configuration("expected a single-key mapping entry".into()))?;
            let (key, value) = mapping
                .iter()
                .next()
                .ok_or_else(|| Error::Configuration("empty mapping entry".into()))?;
            let name = key.as_str().unwrap_or_default().to_string();
            let parsed: T = serde_yaml::from_value(value.clone())?;
            Ok((name, parsed))
        })
        .collect()
}

fn parse_kit_definitions(mapping: &Mapping) -> Result<KitDefinitions> {
    let defaults = mapping.get("defaults").and_then(Value::as_mapping).cloned().unwrap_or_default();
    let kits_seq = mapping
        .get("kits")
        .and_then(Value::as_sequence)
        .ok_or_else(|| Error::Configuration("kit-definitions.kits must be a list".into()))?;

    let defaults_value = Value::Mapping(defaults.clone());
    let mut kits = Vec::with_capacity(kits_seq.len());
    for item in kits_seq {
        let (name, spec_value) = match item {
            Value::String(name) => (name.clone(), Value::Mapping(Mapping::new())),
            Value::Mapping(m) => {
                let (key, value) = m
                    .iter()
                    .next()
                    .ok_or_else(|| Error::Configuration("kit-definitions.kits: empty entry".into()))?;
                (key.as_str().unwrap_or_default().to_string(), value.clone())
            }
            other => return Err(Error::Configuration(format!("kit-definitions.kits: unexpected item {other:?}"))),
        };
        let merged = recursive_merge(&defaults_value, &spec_value);
        let spec: KitSpec = serde_yaml::from_value(merged)?;
        kits.push(KitEntry { name, spec });
    }
    Ok(KitDefinitions { defaults, kits })
}

/// Tagged variant over a kit's provenance. No inheritance: the assembler
/// matches on this directly.
#[derive(Debug, Clone)]
pub enum Kit {
    Autogenerated { name: String, collection: Vec<String>, spec: KitSpec },
    Sourced { name: String, repository: String, spec: KitSpec },
}

impl Kit {
    pub fn name(&self) -> &str {
        match self {
            Kit::Autogenerated { name, .. } => name,
            Kit::Sourced { name, .. } => name,
        }
    }

    pub fn spec(&self) -> &KitSpec {
        match self {
            Kit::Autogenerated { spec, .. } => spec,
            Kit::Sourced { spec, .. } => spec,
        }
    }
}

/// Master/dependent ordering derived from `kit.masters`.
pub struct KitGraph {
    pub kits: Vec<Kit>,
}

impl KitGraph {
    pub fn build(release: &ReleaseDef) -> Result<Self> {
        let mut kits = Vec::new();
        for entry in &release.kit_definitions.kits {
            let spec = entry.spec.clone();
            let kind = spec.kind.unwrap_or(KitKind::Auto);
            let kit = match kind {
                KitKind::Sourced => {
                    let source = spec
                        .source
                        .clone()
                        .ok_or_else(|| Error::Configuration(format!("{}: sourced kit missing source", entry.name)))?;
                    Kit::Sourced { name: entry.name.clone(), repository: source, spec }
                }
                KitKind::Auto => {
                    let source = spec.source.clone().unwrap_or_else(|| entry.name.clone());
                    let collection = release
                        .source_collections
                        .get(&source)
                        .cloned()
                        .ok_or_else(|| {
                            Error::Configuration(format!("{}: unknown source-collection {source}", entry.name))
                        })?;
                    Kit::Autogenerated { name: entry.name.clone(), collection, spec }
                }
            };
            kits.push(kit);
        }

        let graph = Self { kits };
        graph.validate_masters()?;
        Ok(graph)
    }

    fn validate_masters(&self) -> Result<()> {
        let names: HashSet<&str> = self.kits.iter().map(Kit::name).collect();
        let mut seen = HashSet::new();
        for kit in &self.kits {
            if !seen.insert(kit.name()) {
                return Err(Error::Configuration(format!("duplicate kit definition: {}", kit.name())));
            }
            for master in &kit.spec().masters {
                if !names.contains(master.as_str()) {
                    return Err(Error::Configuration(format!(
                        "{}: master {master} has no definition in this release",
                        kit.name()
                    )));
                }
            }
        }
        self.detect_cycles()
    }

    fn detect_cycles(&self) -> Result<()> {
        let by_name: HashMap<&str, &Kit> = self.kits.iter().map(|k| (k.name(), k)).collect();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a Kit>,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(Error::Configuration(format!("cycle detected in kit masters at {name}")));
            }
            if let Some(kit) = by_name.get(name) {
                for master in &kit.spec().masters {
                    visit(master, by_name, visiting, done)?;
                }
            }
            visiting.remove(name);
            done.insert(name);
            Ok(())
        }

        for kit in &self.kits {
            visit(kit.name(), &by_name, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    /// Kits with no masters, executed serially before `dependent_jobs`.
    pub fn master_jobs(&self) -> Vec<&Kit> {
        self.kits.iter().filter(|k| k.spec().masters.is_empty()).collect()
    }

    pub fn dependent_jobs(&self) -> Vec<&Kit> {
        self.kits.iter().filter(|k| !k.spec().masters.is_empty()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(masters: &[&str]) -> KitSpec {
        KitSpec {
            kind: Some(KitKind::Sourced),
            source: Some("x".into()),
            stability: HashMap::new(),
            branch: None,
            eclasses: EclassSpec::default(),
            priority: None,
            aliases: vec![],
            masters: masters.iter().map(|s| s.to_string()).collect(),
            sync_url: None,
            settings: Mapping::new(),
            deprecated: false,
        }
    }

    fn release_with(kits: Vec<(&str, &[&str])>) -> ReleaseDef {
        let mut repositories = HashMap::new();
        repositories.insert(
            "x".to_string(),
            RepositoryDef { url: "https://example/x".into(), branch: None, src_sha1: None, copyright: None, eclasses: vec![], notes: None },
        );
        ReleaseDef {
            kit_definitions: KitDefinitions {
                defaults: Mapping::new(),
                kits: kits
                    .into_iter()
                    .map(|(name, masters)| KitEntry { name: name.to_string(), spec: spec(masters) })
                    .collect(),
            },
            repositories,
            ..Default::default()
        }
    }

    #[test]
    fn master_and_dependent_partition() {
        let release = release_with(vec![("core-kit", &[]), ("python-kit", &["core-kit"])]);
        let graph = KitGraph::build(&release).unwrap();
        assert_eq!(graph.master_jobs().len(), 1);
        assert_eq!(graph.dependent_jobs().len(), 1);
    }

    #[test]
    fn missing_master_is_fatal() {
        let release = release_with(vec![("python-kit", &["core-kit"])]);
        let err = KitGraph::build(&release).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn cycle_is_fatal() {
        let release = release_with(vec![("a", &["b"]), ("b", &["a"])]);
        let err = KitGraph::build(&release).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn release_yaml_parses_bare_and_mapping_kit_entries() {
        let yaml = r#"
release:
  copyright: "copyright {{cur_year}}"
  metadata:
    version: "1.4"
  remotes:
    dev:
      url: "https://github.com/funtoo/{repo}"
      mirrors: []
  repositories:
    - core-kit:
        url: "https://github.com/gentoo-mirror/core-kit"
  source-collections:
    core-kit-sources:
      - core-kit
  kit-definitions:
    defaults:
      stability: {}
    kits:
      - core-kit
      - python-kit:
          kind: sourced
          source: core-kit
          masters: [core-kit]
"#;
        let release = ReleaseDef::from_yaml_str(yaml).unwrap();
        assert_eq!(release.repositories["core-kit"].url, "https://github.com/gentoo-mirror/core-kit");
        assert_eq!(release.source_collections["core-kit-sources"], vec!["core-kit".to_string()]);
        assert_eq!(release.kit_definitions.kits.len(), 2);
        let python_kit = release.kit_definitions.kits.iter().find(|k| k.name == "python-kit").unwrap();
        assert_eq!(python_kit.spec.masters, vec!["core-kit".to_string()]);
        assert_eq!(python_kit.spec.kind, Some(KitKind::Sourced));
    }
}
