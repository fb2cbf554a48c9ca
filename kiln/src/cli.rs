// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use kiln_common::config::Config;
use kiln_common::error::Result;
use tokio_util::sync::CancellationToken;

pub mod info;
pub mod install;
pub mod list;
pub mod status;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::test::TestArgs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build, verify and install formulae with their dependencies
    Install(InstallArgs),
    /// Re-run the test recipe of an installed formula
    Test(TestArgs),
    /// List installed formulae
    List(List),
    /// Show a formula and whether it is installed
    Info(Info),
}

impl Command {
    pub async fn run(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config, cancel).await,
            Self::Test(command) => command.run(config).await,
            Self::List(command) => command.run(config),
            Self::Info(command) => command.run(config),
        }
    }
}
