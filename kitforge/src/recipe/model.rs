//! Data shapes produced by recipe discovery and consumed by the autogen
//! orchestrator.

use camino::Utf8PathBuf;
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// A single package's effective, fully-merged configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PkgInfo(pub Mapping);

impl PkgInfo {
    pub fn from_mapping(mapping: Mapping) -> Self {
        Self(mapping)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(Value::from(key))
    }

    pub fn str_field(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn name(&self) -> Result<String> {
        self.str_field("name").ok_or_else(|| Error::Recipe("pkginfo missing name".into()))
    }

    pub fn cat(&self) -> Result<String> {
        self.str_field("cat").ok_or_else(|| Error::Recipe("pkginfo missing cat".into()))
    }

    pub fn sub_path(&self) -> Result<String> {
        Ok(format!("{}/{}", self.cat()?, self.name()?))
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(Value::from(key), value);
    }
}

/// A dispatchable unit of autogen work produced by recipe discovery.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub gen_path: Utf8PathBuf,
    pub generator_ref: String,
    pub template_path: Option<Utf8PathBuf>,
    pub defaults: Mapping,
    pub pkginfo_list: Vec<PkgInfo>,
    pub autogen_id: String,
}

/// A parsed top-level rule from an `autogen.yaml` document.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub generator: String,
    pub defaults: Mapping,
    pub packages: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkginfo_sub_path() {
        let mut map = Mapping::new();
        map.insert(Value::from("name"), Value::from("foo"));
        map.insert(Value::from("cat"), Value::from("sys-apps"));
        let info = PkgInfo::from_mapping(map);
        assert_eq!(info.sub_path().unwrap(), "sys-apps/foo");
    }

    #[test]
    fn pkginfo_missing_name_is_recipe_error() {
        let info = PkgInfo::from_mapping(Mapping::new());
        assert!(matches!(info.name(), Err(Error::Recipe(_))));
    }
}
