use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8DirEntry, Utf8Path};
use itertools::Itertools;
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::utils::relpath;

// None value coerced to a directory filtering predicate function pointer for use with
// Option-wrapped closure parameter generics.
type WalkDirFilter = fn(&DirEntry) -> bool;
pub const NO_WALKDIR_FILTER: Option<WalkDirFilter> = None;

pub fn sorted_dir_list<P: AsRef<Path>>(path: P) -> WalkDir {
    WalkDir::new(path.as_ref())
        .sort_by_file_name()
        .min_depth(1)
        .max_depth(1)
}

/// Return an iterator of all the relative paths to files under a path, skipping dotfiles.
pub fn relative_paths<'a, P>(path: P) -> impl Iterator<Item = PathBuf> + 'a
where
    P: AsRef<Path> + Copy + 'a,
{
    WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(move |e| relpath(e.path(), path))
}

pub fn is_file(entry: &DirEntry) -> bool {
    entry.path().is_file()
}

pub fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

pub fn sorted_dir_list_utf8(path: &Utf8Path) -> Result<Vec<Utf8DirEntry>> {
    let mut entries: Vec<_> = path
        .read_dir_utf8()
        .map_err(|e| Error::Io(format!("failed reading dir: {path}: {e}")))?
        .try_collect()?;
    entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));
    Ok(entries)
}

pub fn is_dir_utf8(entry: &Utf8DirEntry) -> bool {
    entry.path().is_dir()
}

pub fn is_file_utf8(entry: &Utf8DirEntry) -> bool {
    entry.path().is_file()
}

pub fn is_hidden_utf8(entry: &Utf8DirEntry) -> bool {
    entry.file_name().starts_with('.')
}

pub fn has_ext_utf8(entry: &Utf8DirEntry, ext: &str) -> bool {
    entry.path().extension().map(|s| s == ext).unwrap_or_default()
}

/// Determine if a [`Utf8DirEntry`] is a valid ebuild file.
pub fn is_ebuild(entry: &Utf8DirEntry) -> bool {
    is_file_utf8(entry) && !is_hidden_utf8(entry) && has_ext_utf8(entry, "ebuild")
}

/// Create a file atomically by writing to a temporary path and then renaming it.
pub fn atomic_write_file<C: AsRef<[u8]>, P: AsRef<Utf8Path>>(path: P, data: C) -> Result<()> {
    let path = path.as_ref();

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(format!("invalid file path: {path}")))?;
    fs::create_dir_all(dir).map_err(|e| Error::Io(format!("failed creating dir: {dir}: {e}")))?;

    let pid = std::process::id();
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("invalid file path: {path}")))?;
    let temp = dir.join(format!(".{file_name}.{pid}"));

    fs::write(&temp, data).map_err(|e| Error::Io(format!("failed writing data: {temp}: {e}")))?;

    fs::rename(&temp, path)
        .map_err(|e| Error::Io(format!("failed renaming file: {temp} -> {path}: {e}")))?;

    Ok(())
}

/// Recursively remove all non-dotfile contents of a directory, leaving the directory itself
/// and any dotfiles/dotdirs in place. Used to "clean" a kit destination tree between runs.
pub fn clean_dir_except_dotfiles(root: &Utf8Path) -> Result<()> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|e| Error::Io(format!("failed creating {root}: {e}")))?;
        return Ok(());
    }
    for entry in sorted_dir_list_utf8(root)? {
        let name = entry.file_name();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(path)
                .map_err(|e| Error::Io(format!("failed removing dir {path}: {e}")))?;
        } else {
            fs::remove_file(path).map_err(|e| Error::Io(format!("failed removing {path}: {e}")))?;
        }
    }
    Ok(())
}
