//! Environment-variable overrides for flags a CI wrapper script would
//! otherwise have to pass on every invocation.

use std::env;

pub(super) fn env_or(var: &str, fallback: impl Into<String>) -> String {
    env::var(var).unwrap_or_else(|_| fallback.into())
}

pub(super) fn env_opt(var: &str) -> Option<String> {
    env::var(var).ok()
}

pub(super) const START_PATH: &str = "KITFORGE_START";
pub(super) const OUTPUT_PATH: &str = "KITFORGE_OUTPUT";
pub(super) const REPO_NAME: &str = "KITFORGE_REPO_NAME";
