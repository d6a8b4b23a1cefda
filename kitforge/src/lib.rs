//! `kitforge`: an ebuild auto-generation and kit assembly engine.
//!
//! A content-addressed object store, a web fetcher with a persistent cache,
//! recipe discovery and merge, an autogen orchestrator dispatching native or
//! external generators, an ebuild/Manifest builder, and a kit assembler that
//! composes source trees and kit-fixups into publishable Gentoo/Funtoo-style
//! repositories.

pub mod autogen;
pub mod blos;
pub mod config;
pub mod error;
pub mod fetch;
pub mod files;
pub mod git_tree;
pub mod hash;
pub mod integrity;
pub mod kit;
pub mod metadata_extract;
pub mod python_use;
pub mod recipe;
pub mod utils;

pub use config::{ConfigPaths, Context, EngineSettings};
pub use error::{Error, Result};
