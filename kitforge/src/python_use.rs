//! `PYTHON_COMPAT` normalization and `python-use` line generation.

use std::collections::BTreeSet;

pub const DEFAULT_PYTHON_IMPL: &str = "python3_9";
pub const BACKUP_PYTHON_IMPL: &str = "python3_8";

/// Expand one raw `PYTHON_COMPAT` token into its normalized implementation
/// set, per the mapping table.
fn expand_token(token: &str) -> BTreeSet<String> {
    match token {
        "python3_5" | "python3_6" => BTreeSet::from([DEFAULT_PYTHON_IMPL.to_string()]),
        "python3+" | "python3_7+" => ["python3_7", "python3_8", "python3_9"].into_iter().map(str::to_string).collect(),
        "python3.8+" => ["python3_8", "python3_9"].into_iter().map(str::to_string).collect(),
        "python3.9+" => BTreeSet::from(["python3_9".to_string()]),
        "python2+" => ["python2_7", "python3_7", "python3_8", "python3_9"].into_iter().map(str::to_string).collect(),
        other => BTreeSet::from([other.to_string()]),
    }
}

/// Normalize a full `PYTHON_COMPAT` value into the set of supported
/// implementations.
pub fn normalize_compat(python_compat: &str) -> BTreeSet<String> {
    python_compat.split_whitespace().flat_map(expand_token).collect()
}

/// Emission rule for one version's normalized compat set: `None` if the
/// default impl satisfies it; else a single-target line.
fn emission_for(compat: &BTreeSet<String>) -> Option<(String, Option<String>)> {
    if compat.is_empty() {
        return None;
    }
    if compat.contains(DEFAULT_PYTHON_IMPL) {
        return None;
    }
    if compat.contains(BACKUP_PYTHON_IMPL) {
        return Some((BACKUP_PYTHON_IMPL.to_string(), None));
    }
    let first = compat.iter().next().expect("non-empty checked above").clone();
    Some((first.clone(), Some(first)))
}

fn render_line(catpkg: &str, single_target: &str, also_targets: Option<&str>) -> String {
    match also_targets {
        Some(targets) => format!("{catpkg} python_single_target_{single_target} python_targets_{targets}"),
        None => format!("{catpkg} python_single_target_{single_target}"),
    }
}

/// Generate `python-use` lines for one catpkg given the raw `PYTHON_COMPAT`
/// of every version present. Empty or missing compat contributes no line for
/// that version. If every version agrees, emit one global line; otherwise
/// emit one line per version, each prefixed `catpkg-version`.
pub fn catpkg_python_use_lines(catpkg: &str, per_version_compat: &[(String, String)]) -> Vec<String> {
    let normalized: Vec<(String, BTreeSet<String>)> = per_version_compat
        .iter()
        .map(|(version, compat)| (version.clone(), normalize_compat(compat)))
        .filter(|(_, compat)| !compat.is_empty())
        .collect();

    if normalized.is_empty() {
        return Vec::new();
    }

    let all_agree = normalized.windows(2).all(|w| w[0].1 == w[1].1);
    if all_agree {
        let (_, compat) = &normalized[0];
        return emission_for(compat)
            .map(|(single, targets)| vec![render_line(catpkg, &single, targets.as_deref())])
            .unwrap_or_default();
    }

    normalized
        .iter()
        .filter_map(|(version, compat)| {
            emission_for(compat).map(|(single, targets)| {
                render_line(&format!("{catpkg}-{version}"), &single, targets.as_deref())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_tokens_map_to_default() {
        assert_eq!(normalize_compat("python3_5"), BTreeSet::from([DEFAULT_PYTHON_IMPL.to_string()]));
    }

    #[test]
    fn plus_tokens_expand_range() {
        let set = normalize_compat("python3.8+");
        assert_eq!(set, BTreeSet::from(["python3_8".to_string(), "python3_9".to_string()]));
    }

    #[test]
    fn default_impl_in_compat_emits_nothing() {
        let lines = catpkg_python_use_lines("dev-python/foo", &[("1.0".into(), "python3_9".into())]);
        assert!(lines.is_empty());
    }

    #[test]
    fn backup_impl_emits_single_target_line() {
        let lines = catpkg_python_use_lines("dev-python/foo", &[("1.0".into(), "python3_8".into())]);
        assert_eq!(lines, vec!["dev-python/foo python_single_target_python3_8".to_string()]);
    }

    #[test]
    fn neither_default_nor_backup_emits_single_and_targets() {
        let lines = catpkg_python_use_lines("dev-python/foo", &[("1.0".into(), "python2_7".into())]);
        assert_eq!(
            lines,
            vec!["dev-python/foo python_single_target_python2_7 python_targets_python2_7".to_string()]
        );
    }

    #[test]
    fn disagreeing_versions_emit_per_version_lines() {
        let lines = catpkg_python_use_lines(
            "dev-python/foo",
            &[("1.0".into(), "python3_8".into()), ("2.0".into(), "python2_7".into())],
        );
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.starts_with("dev-python/foo-1.0")));
        assert!(lines.iter().any(|l| l.starts_with("dev-python/foo-2.0")));
    }

    #[test]
    fn empty_compat_yields_no_lines() {
        let lines = catpkg_python_use_lines("dev-python/foo", &[("1.0".into(), "".into())]);
        assert!(lines.is_empty());
    }
}
