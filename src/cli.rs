use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "topology-gateway", author, version, about)]
pub struct Args {
    /// Path to the gateway YAML configuration
    #[arg(long)]
    pub config: PathBuf,

    /// Load and deploy every topology, report, and exit
    #[arg(long)]
    pub validate_only: bool,
}
