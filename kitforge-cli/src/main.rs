use std::io::stderr;
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use tracing_log::AsTrace;

mod args;
mod subcmds;

#[derive(Debug, Parser)]
#[command(name = "kitforge", version, long_about = None, disable_help_subcommand = true)]
struct Command {
    #[command(flatten)]
    verbosity: Verbosity,

    #[command(subcommand)]
    subcmd: subcmds::Subcommand,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Command::parse();

    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .without_time()
        .compact();

    tracing_subscriber::fmt()
        .event_format(format)
        .with_max_level(args.verbosity.log_level_filter().as_trace())
        .with_writer(stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(args.subcmd.run())
}
