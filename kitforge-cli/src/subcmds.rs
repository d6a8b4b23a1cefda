mod doit;
mod merge_kits;

use std::process::ExitCode;

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Run autogen over the current (or a given) directory
    Doit(doit::Command),
    /// Regenerate every kit in a release and update the meta-repo
    MergeKits(merge_kits::Command),
}

impl Subcommand {
    pub(super) async fn run(self) -> anyhow::Result<ExitCode> {
        use Subcommand::*;
        match self {
            Doit(cmd) => cmd.run().await,
            MergeKits(cmd) => cmd.run().await,
        }
    }
}
