use anyhow::Result;
use clap::Parser;
use plan_kernel_cli::{run_cli, Cli};

fn main() -> Result<()> {
    run_cli(Cli::parse())
}
