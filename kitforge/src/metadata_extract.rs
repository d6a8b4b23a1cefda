//! Ebuild extraction environment, AUXDB field ordering, and the SRC_URI /
//! Manifest micro-parsers.

use std::collections::HashMap;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::utils::strip_revision;

/// Field order written to `metadata/md5-cache/<atom>`, empty values omitted.
pub const AUXDB_FIELDS: &[&str] = &[
    "DEPEND",
    "RDEPEND",
    "SLOT",
    "SRC_URI",
    "RESTRICT",
    "HOMEPAGE",
    "LICENSE",
    "DESCRIPTION",
    "KEYWORDS",
    "IUSE",
    "REQUIRED_USE",
    "PDEPEND",
    "BDEPEND",
    "EAPI",
    "PROPERTIES",
    "DEFINED_PHASES",
];

/// Index-addressed order of the extractor subprocess's stdout lines.
pub const METADATA_LINES: &[&str] = &[
    "DEPEND",
    "RDEPEND",
    "SLOT",
    "SRC_URI",
    "RESTRICT",
    "HOMEPAGE",
    "LICENSE",
    "DESCRIPTION",
    "KEYWORDS",
    "INHERITED",
    "IUSE",
    "REQUIRED_USE",
    "PDEPEND",
    "BDEPEND",
    "EAPI",
    "PROPERTIES",
    "DEFINED_PHASES",
    "HDEPEND",
    "PYTHON_COMPAT",
];

static EAPI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[ \t]*EAPI=(['"]?)([A-Za-z0-9+_.-]*)\1"#).expect("valid regex"));

/// Parsed ebuild filename components: `PF`, `CATEGORY`, `P`, `PV`, `PR`,
/// `PN`, `PVR`.
#[derive(Debug, Clone)]
pub struct EbuildIdent {
    pub category: String,
    pub pn: String,
    pub pv: String,
    pub pr: String,
    pub pf: String,
}

impl EbuildIdent {
    pub fn p(&self) -> String {
        format!("{}-{}", self.pn, self.pv)
    }

    pub fn pvr(&self) -> String {
        if self.pr == "r0" {
            self.pv.clone()
        } else {
            format!("{}-{}", self.pv, self.pr)
        }
    }
}

/// Parse `name-version[-rN].ebuild` into its identity components.
pub fn parse_ebuild_ident(category: &str, ebuild_path: &Utf8Path) -> Result<EbuildIdent> {
    let stem = ebuild_path
        .file_stem()
        .ok_or_else(|| Error::Recipe(format!("not an ebuild path: {ebuild_path}")))?;
    let (base, revision) = strip_revision(stem);
    let (pn, pv) = base
        .rsplit_once('-')
        .ok_or_else(|| Error::Recipe(format!("cannot split name/version: {stem}")))?;
    let pr = format!("r{}", revision.unwrap_or(0));
    Ok(EbuildIdent { category: category.to_string(), pn: pn.to_string(), pv: pv.to_string(), pr, pf: stem.to_string() })
}

/// Build the minimum extraction environment for one ebuild.
pub fn build_extraction_env(ident: &EbuildIdent, ebuild_path: &Utf8Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("PF".into(), ident.pf.clone());
    env.insert("CATEGORY".into(), ident.category.clone());
    env.insert("P".into(), ident.p());
    env.insert("PV".into(), ident.pv.clone());
    env.insert("PR".into(), ident.pr.clone());
    env.insert("PN".into(), ident.pn.clone());
    env.insert("PVR".into(), ident.pvr());
    env.insert("EAPI".into(), read_eapi(ebuild_path).unwrap_or_default());
    env.insert("PATH".into(), "/bin:/usr/bin".into());
    env.insert("LC_COLLATE".into(), "POSIX".into());
    env.insert("LANG".into(), "en_US.UTF-8".into());
    env.insert("EBUILD".into(), ebuild_path.to_string());
    env.insert("EBUILD_PHASE".into(), "depend".into());
    env.insert("PORTAGE_PIPE_FD".into(), "1".into());
    env.insert("PORTAGE_GID".into(), "250".into());
    env
}

fn read_eapi(ebuild_path: &Utf8Path) -> Option<String> {
    let text = std::fs::read_to_string(ebuild_path).ok()?;
    for line in text.lines().take(64) {
        if let Some(caps) = EAPI_RE.captures(line) {
            return Some(caps.get(2)?.as_str().to_string());
        }
    }
    None
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    pub fields: IndexMap<String, String>,
    pub inherited: Vec<String>,
}

/// Invoke the external metadata-extraction subprocess (sourcing the ebuild
/// plus its eclasses through the `depend` phase is not a static-language
/// operation; this engine shells out, matching the design note on treating
/// interpreter-bound recipe code as an external process).
pub async fn extract_metadata(
    extractor: &Utf8Path,
    ebuild_path: &Utf8Path,
    env: &HashMap<String, String>,
    eclass_paths: &[Utf8PathBuf],
) -> Result<ExtractedMetadata> {
    let mut cmd = Command::new(extractor.as_std_path());
    cmd.env_clear();
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.env("PORTAGE_ECLASS_LOCATIONS", eclass_paths.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(":"));
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::GitTree(format!("extractor {extractor} failed for {ebuild_path}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::GitTree(format!("extractor {extractor} exited non-zero for {ebuild_path}: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut fields = IndexMap::new();
    let mut inherited = Vec::new();
    for (idx, line) in stdout.lines().enumerate() {
        let Some(&key) = METADATA_LINES.get(idx) else { break };
        if line.is_empty() {
            continue;
        }
        if key == "INHERITED" {
            inherited = line.split_whitespace().map(str::to_string).collect();
        } else {
            fields.insert(key.to_string(), line.to_string());
        }
    }
    Ok(ExtractedMetadata { fields, inherited })
}

/// Render the AUXDB block for `metadata/md5-cache/<atom>`: each field in
/// canonical order (empties omitted), then `_eclasses_`, then `_md5_`.
pub fn render_auxdb_block(fields: &IndexMap<String, String>, eclass_hashes_line: &str, ebuild_md5: &str) -> String {
    let mut out = String::new();
    for &field in AUXDB_FIELDS {
        if let Some(value) = fields.get(field) {
            if !value.is_empty() {
                out.push_str(&format!("{field}={value}\n"));
            }
        }
    }
    if !eclass_hashes_line.is_empty() {
        out.push_str(&format!("_eclasses_={eclass_hashes_line}\n"));
    }
    out.push_str(&format!("_md5_={ebuild_md5}\n"));
    out
}

/// One resolved SRC_URI download: `(fetch_url, final_name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcUriEntry {
    pub url: String,
    pub final_name: String,
}

/// Tokens `(`, `)`, `||`, `*?` are skipped; `A -> B` renames; a bare token's
/// filename is its last path segment. A trailing `->` with nothing after it
/// is tolerated and creates no assignment.
pub fn parse_src_uri(src_uri: &str) -> Vec<SrcUriEntry> {
    let tokens: Vec<&str> = src_uri.split_whitespace().collect();
    let mut entries = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if token == "(" || token == ")" || token == "||" || token == "*?" {
            i += 1;
            continue;
        }
        if i + 2 < tokens.len() && tokens[i + 1] == "->" {
            let renamed = tokens[i + 2];
            entries.push(SrcUriEntry { url: token.to_string(), final_name: renamed.to_string() });
            i += 3;
        } else if i + 1 < tokens.len() && tokens[i + 1] == "->" {
            // trailing `->` with no target: tolerated, no assignment created
            i += 2;
        } else {
            let filename = token.rsplit('/').next().unwrap_or(token).to_string();
            entries.push(SrcUriEntry { url: token.to_string(), final_name: filename });
            i += 1;
        }
    }
    entries
}

/// One parsed `DIST` line from a Manifest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub hashes: Vec<(String, String)>,
}

/// Parse `DIST name size (hashname hexvalue)+`.
pub fn parse_manifest_line(line: &str) -> Option<ManifestEntry> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "DIST" {
        return None;
    }
    let name = parts.next()?.to_string();
    let size: u64 = parts.next()?.parse().ok()?;
    let rest: Vec<&str> = parts.collect();
    let mut hashes = Vec::new();
    for pair in rest.chunks(2) {
        if let [hash_name, hex] = pair {
            hashes.push((hash_name.to_string(), hex.to_string()));
        }
    }
    Some(ManifestEntry { name, size, hashes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn ebuild_ident_no_revision() {
        let ident = parse_ebuild_ident("sys-apps", &Utf8PathBuf::from("foo-1.2.3.ebuild")).unwrap();
        assert_eq!(ident.pn, "foo");
        assert_eq!(ident.pv, "1.2.3");
        assert_eq!(ident.pr, "r0");
        assert_eq!(ident.pvr(), "1.2.3");
    }

    #[test]
    fn ebuild_ident_with_revision() {
        let ident = parse_ebuild_ident("sys-apps", &Utf8PathBuf::from("foo-1.2.3-r4.ebuild")).unwrap();
        assert_eq!(ident.pr, "r4");
        assert_eq!(ident.pvr(), "1.2.3-r4");
    }

    #[test]
    fn src_uri_parses_rename_and_bare() {
        let entries = parse_src_uri("https://example/a.tar.gz -> foo.tar.gz https://example/b.tar.gz");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].final_name, "foo.tar.gz");
        assert_eq!(entries[1].final_name, "b.tar.gz");
    }

    #[test]
    fn src_uri_skips_grouping_tokens() {
        let entries = parse_src_uri("( https://example/a.tar.gz )");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].final_name, "a.tar.gz");
    }

    #[test]
    fn src_uri_trailing_arrow_creates_no_assignment() {
        let entries = parse_src_uri("https://example/a.tar.gz ->");
        assert_eq!(entries.len(), 0);
    }

    #[test]
    fn manifest_line_parses() {
        let entry = parse_manifest_line("DIST foo-1.0.tar.gz 1024 SHA512 aaaa BLAKE2B bbbb").unwrap();
        assert_eq!(entry.name, "foo-1.0.tar.gz");
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.hashes, vec![("SHA512".to_string(), "aaaa".to_string()), ("BLAKE2B".to_string(), "bbbb".to_string())]);
    }

    #[test]
    fn auxdb_block_omits_empty_fields() {
        let mut fields = IndexMap::new();
        fields.insert("SLOT".to_string(), "0".to_string());
        fields.insert("DEPEND".to_string(), "".to_string());
        let block = render_auxdb_block(&fields, "eclass1\tabc", "deadbeef");
        assert!(block.contains("SLOT=0\n"));
        assert!(!block.contains("DEPEND="));
        assert!(block.ends_with("_md5_=deadbeef\n"));
    }
}
