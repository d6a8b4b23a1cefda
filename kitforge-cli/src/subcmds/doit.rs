use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Args;
use kitforge::autogen::orchestrator::AutogenOrchestrator;
use kitforge::config::{Context, EngineSettings};
use kitforge::recipe::discovery::{DiscoveryFilter, RecipeDiscovery};
use kitforge::Error;
use tracing::{error, info};

use crate::args::{env_opt, env_or, OUTPUT_PATH, START_PATH};

/// Autogen a directory tree, discovering every `autogen.yaml` and standalone
/// recipe under it and rendering ebuilds/Manifests into it (or into
/// `--output`, if given).
#[derive(Debug, Args)]
pub struct Command {
    /// Directory to autogen; defaults to the current directory
    #[arg(value_name = "PATH")]
    start: Option<Utf8PathBuf>,

    /// Directory to render ebuilds/Manifests into; defaults to `start` (in place)
    #[arg(long)]
    output: Option<Utf8PathBuf>,

    /// Root directory for engine state (BLOS, fetch cache, integrity DB)
    #[arg(long)]
    root: Option<Utf8PathBuf>,

    /// Restrict to a single category
    #[arg(long)]
    category: Option<String>,

    /// Restrict to a single package name
    #[arg(long)]
    package: Option<String>,

    /// Treat every fetch's cache as stale, forcing a live re-fetch
    #[arg(long)]
    immediate: bool,

    /// Worker pool size; defaults to `EngineSettings::autogen_workers`
    #[arg(short, long)]
    jobs: Option<usize>,
}

impl Command {
    pub(super) async fn run(self) -> anyhow::Result<ExitCode> {
        let start = self
            .start
            .or_else(|| env_opt(START_PATH).map(Utf8PathBuf::from))
            .unwrap_or_else(|| Utf8PathBuf::from(env_or(START_PATH, ".")));
        let start = start.canonicalize_utf8().map_err(Error::from)?;
        let dest_root = self
            .output
            .or_else(|| env_opt(OUTPUT_PATH).map(Utf8PathBuf::from))
            .unwrap_or_else(|| start.clone());

        let mut settings = EngineSettings { immediate: self.immediate, ..EngineSettings::default() };
        if let Some(jobs) = self.jobs {
            settings.autogen_workers = jobs.max(1);
        }

        let ctx = match self.root {
            Some(root) => Context::rooted(&root, settings)?,
            None => Context::new("kitforge", settings)?,
        };

        let discovery =
            RecipeDiscovery::new(start.clone(), DiscoveryFilter { category: self.category, package: self.package });
        let units = discovery.discover(None)?;
        info!(count = units.len(), %start, "discovered work units");

        std::fs::create_dir_all(&dest_root)?;
        let orchestrator = AutogenOrchestrator::new(ctx.settings.autogen_workers);
        let failures = orchestrator
            .run(ctx.clone(), units, &serde_yaml::Mapping::new(), &dest_root, Some(start.as_path()), None)
            .await;

        if failures.is_empty() {
            Ok(ExitCode::SUCCESS)
        } else {
            for failure in &failures {
                error!(label = %failure.label, message = %failure.message, "autogen failure");
            }
            eprintln!("doit: {} unit(s) failed:", failures.len());
            for failure in &failures {
                eprintln!("  {} — {}", failure.label, failure.message);
            }
            Ok(ExitCode::from(1))
        }
    }
}
