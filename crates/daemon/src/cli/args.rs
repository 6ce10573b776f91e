pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "asn")]
#[command(about = "Encrypted sessions over a content-addressed blob repository")]
pub struct Args {
    /// Path to the asn config directory (defaults to ~/.asn)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
