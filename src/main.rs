use anyhow::Result;
use clap::Parser;

use golbuild::cli::{Cli, Commands};
use golbuild::commands::{build, check, info};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Build(args) => build(&cli, args),
        Commands::Info(args) => info(&cli, args),
        Commands::Check(args) => check(&cli, args),
    }
}
