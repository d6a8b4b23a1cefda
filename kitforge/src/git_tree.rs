//! Opaque Git checkout handle wrapping `git2`. A [`GitTree`] is a singleton
//! per `(name)`: re-pointing it at a different branch or SHA is a checkout,
//! never a re-clone.

use camino::{Utf8Path, Utf8PathBuf};
use git2::{build::CheckoutBuilder, FetchOptions, ObjectType, Repository, ResetType, Signature};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub struct GitTree {
    repo: Repository,
    path: Utf8PathBuf,
}

impl GitTree {
    /// Open an existing checkout at `path`, or clone `url` into it if absent.
    pub fn open_or_clone(path: &Utf8Path, url: &str) -> Result<Self> {
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(_) => {
                info!(url, %path, "cloning repository");
                Repository::clone(url, path).map_err(|e| Error::GitTree(format!("clone {url}: {e}")))?
            }
        };
        Ok(Self { repo, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn head_sha1(&self) -> Result<String> {
        let head = self.repo.head().map_err(|e| Error::GitTree(format!("no HEAD: {e}")))?;
        let oid = head.target().ok_or_else(|| Error::GitTree("HEAD has no target".into()))?;
        Ok(oid.to_string())
    }

    /// Check out `target` (a branch name or a commit SHA), fetching first if
    /// `target` isn't already reachable locally.
    pub fn checkout(&self, target: &str) -> Result<()> {
        if self.resolve(target).is_err() {
            self.fetch()?;
        }
        let object = self.resolve(target)?;
        self.repo
            .checkout_tree(&object, Some(CheckoutBuilder::new().force()))
            .map_err(|e| Error::GitTree(format!("checkout {target}: {e}")))?;

        self.repo
            .set_head_detached(object.id())
            .map_err(|e| Error::GitTree(format!("set_head_detached: {e}")))?;
        debug!(target, "checked out");
        Ok(())
    }

    fn resolve(&self, target: &str) -> Result<git2::Object<'_>> {
        self.repo
            .revparse_single(target)
            .or_else(|_| self.repo.revparse_single(&format!("origin/{target}")))
            .map_err(|e| Error::GitTree(format!("cannot resolve {target}: {e}")))
    }

    fn fetch(&self) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .map_err(|e| Error::GitTree(format!("no origin remote: {e}")))?;
        remote
            .fetch(&[] as &[&str], Some(FetchOptions::new().download_tags(git2::AutotagOption::All)), None)
            .map_err(|e| Error::GitTree(format!("fetch failed: {e}")))
    }

    /// Stage every path not under `skip` and commit, returning the new SHA.
    pub fn commit_all(&self, message: &str, skip: &[&str]) -> Result<String> {
        let mut index = self.repo.index().map_err(|e| Error::GitTree(e.to_string()))?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, Some(&mut |path, _| {
                if skip.iter().any(|s| path.starts_with(std::path::Path::new(s))) {
                    1
                } else {
                    0
                }
            }))
            .map_err(|e| Error::GitTree(format!("index add_all: {e}")))?;
        index.write().map_err(|e| Error::GitTree(e.to_string()))?;

        let tree_oid = index.write_tree().map_err(|e| Error::GitTree(e.to_string()))?;
        let tree = self.repo.find_tree(tree_oid).map_err(|e| Error::GitTree(e.to_string()))?;
        let signature = Signature::now("kitforge", "kitforge@localhost").map_err(|e| Error::GitTree(e.to_string()))?;

        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();

        let commit_oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .map_err(|e| Error::GitTree(format!("commit failed: {e}")))?;
        Ok(commit_oid.to_string())
    }

    /// Hard-reset the working tree to HEAD, discarding local changes made
    /// during assembly before the next regeneration cycle.
    pub fn reset_hard(&self) -> Result<()> {
        let head = self.repo.head().map_err(|e| Error::GitTree(e.to_string()))?;
        let commit = head.peel(ObjectType::Commit).map_err(|e| Error::GitTree(e.to_string()))?;
        self.repo
            .reset(&commit, ResetType::Hard, None)
            .map_err(|e| Error::GitTree(format!("reset --hard: {e}")))
    }

    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.repo.remote(name, url).map_err(|e| Error::GitTree(format!("add remote {name}: {e}")))?;
        Ok(())
    }

    pub fn push(&self, remote_name: &str, refspec: &str) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .map_err(|e| Error::GitTree(format!("no remote {remote_name}: {e}")))?;
        remote.push(&[refspec], None).map_err(|e| Error::GitTree(format!("push failed: {e}")))
    }

    /// Bare-clone `src_path` into `dest_path`, add `mirror_url` as a remote
    /// named `mirror`, and `push --mirror` to it.
    pub fn mirror_to(src_path: &Utf8Path, dest_path: &Utf8Path, mirror_url: &str) -> Result<()> {
        let bare = Repository::clone(src_path.as_str(), dest_path)
            .map_err(|e| Error::GitTree(format!("bare clone {src_path}: {e}")))?;
        bare.remote("mirror", mirror_url).map_err(|e| Error::GitTree(e.to_string()))?;
        let mut remote = bare.find_remote("mirror").map_err(|e| Error::GitTree(e.to_string()))?;
        remote
            .push(&["+refs/*:refs/*"], None)
            .map_err(|e| Error::GitTree(format!("push --mirror to {mirror_url}: {e}")))?;
        std::fs::remove_dir_all(dest_path)?;
        Ok(())
    }
}
