use std::env;
use std::path::{Component, Path, PathBuf};

use camino::Utf8PathBuf;

use crate::error::{Error, Result};

/// Limit parallel jobs to the number of logical CPUs on a system. All CPUs are used if jobs is 0.
pub fn bounded_jobs(jobs: usize) -> usize {
    let cpus = num_cpus::get();
    if jobs > 0 && jobs <= cpus {
        jobs
    } else {
        cpus
    }
}

/// Get the current working directory as a Utf8PathBuf.
pub fn current_dir() -> Result<Utf8PathBuf> {
    let dir = env::current_dir()
        .map_err(|e| Error::InvalidRequest(format!("can't get current dir: {e}")))?;
    Utf8PathBuf::try_from(dir)
        .map_err(|e| Error::InvalidRequest(format!("invalid unicode path: {e}")))
}

/// Construct a relative path from a base directory to the specified path.
//
// Adapted from rustc's old path_relative_from()
// https://github.com/rust-lang/rust/blob/e1d0de82cc40b666b88d4a6d2c9dcbc81d7ed27f/src/librustc_back/rpath.rs#L116-L158
pub fn relpath<P, B>(path: P, base: B) -> Option<PathBuf>
where
    P: AsRef<Path>,
    B: AsRef<Path>,
{
    let path = path.as_ref();
    let base = base.as_ref();

    if path.is_absolute() != base.is_absolute() {
        if path.is_absolute() {
            Some(PathBuf::from(path))
        } else {
            None
        }
    } else {
        let mut ita = path.components();
        let mut itb = base.components();
        let mut comps: Vec<Component> = vec![];
        loop {
            match (ita.next(), itb.next()) {
                (None, None) => break,
                (Some(a), None) => {
                    comps.push(a);
                    comps.extend(ita);
                    break;
                }
                (None, _) => comps.push(Component::ParentDir),
                (Some(a), Some(b)) if comps.is_empty() && a == b => (),
                (Some(a), Some(Component::CurDir)) => comps.push(a),
                (Some(_), Some(Component::ParentDir)) => return None,
                (Some(a), Some(_)) => {
                    comps.push(Component::ParentDir);
                    comps.extend(itb.map(|_| Component::ParentDir));
                    comps.push(a);
                    comps.extend(ita);
                    break;
                }
            }
        }
        Some(comps.iter().collect())
    }
}

/// Strip a trailing `-rN` revision suffix from a package-version-ish string, Portage style.
/// Returns the reduced string and the revision number, if any.
pub fn strip_revision(s: &str) -> (&str, Option<u32>) {
    if let Some(idx) = s.rfind("-r") {
        if let Ok(rev) = s[idx + 2..].parse::<u32>() {
            return (&s[..idx], Some(rev));
        }
    }
    (s, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relpaths() {
        for (path, base, expected) in [
            ("path", "path", Some("")),
            ("/path", "path", Some("/path")),
            ("path", "/path", None),
            ("/path/to/file", "/path/to", Some("file")),
        ] {
            assert_eq!(
                relpath(path, base)
                    .map(|x| x.to_str().unwrap().to_string())
                    .as_deref(),
                expected,
                "relpath failed: path {path:?}, base {base:?}"
            );
        }
    }

    #[test]
    fn strip_revision_suffix() {
        assert_eq!(strip_revision("foo-1.0-r2"), ("foo-1.0", Some(2)));
        assert_eq!(strip_revision("foo-1.0"), ("foo-1.0", None));
    }
}
