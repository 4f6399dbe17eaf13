use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "nnrtctl", version, about = "Neural network runtime control tool")]
pub struct Cli {
    /// Log level (RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List enumerated devices and their capabilities
    Devices,

    /// Compile and run a small chained-add graph
    Demo {
        /// Position of the device in the `devices` listing
        #[arg(long, default_value_t = 0)]
        device: usize,

        /// Directory for the compiled model cache
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Cache version; a lower stored version is rebuilt
        #[arg(long, default_value_t = 1)]
        cache_version: u64,

        /// Model name, used as the cache file prefix
        #[arg(long)]
        model_name: Option<String>,
    },

    /// Print the record of a model cache without validating it
    CacheInfo {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        model_name: Option<String>,
    },
}
