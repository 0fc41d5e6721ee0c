mod artifact;
mod cli;
mod cluster;
mod embed;
mod error;
mod logging;
mod report;
pub(crate) mod serde_helpers;
mod stages;
mod themes;

pub(crate) use error::AppResult;

use std::io::IsTerminal;
use std::process::exit;

use clap::{ColorChoice, Parser};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let ansi = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal(),
    };
    logging::setup_logger(&cli.verbosity, ansi);
    if let Err(e) = cli.cmd.run().await {
        error!("{e}");
        exit(1);
    }
}
