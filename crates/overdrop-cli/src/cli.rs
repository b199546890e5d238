use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "overdrop", about = "OTA deployment control plane")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the API server with the background upload reaper.
    Serve {
        /// Run on the in-memory store regardless of store_path.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Run one upload-reaper pass and exit.
    Sweep,
    /// Probe the object store and the workflows service.
    Check,
}
