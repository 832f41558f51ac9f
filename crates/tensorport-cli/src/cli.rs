use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tensorport", version, about = "Model inference serving core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a model, validate its signature, and list the built instances
    Inspect {
        /// Path to the model configuration (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Directory holding the model files
        #[arg(long)]
        model_dir: PathBuf,

        /// Engine to load with (identity or plan)
        #[arg(long, default_value = "identity")]
        engine: String,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },

    /// Execute a synthetic batch against the first runner
    Run {
        /// Path to the model configuration (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Directory holding the model files
        #[arg(long)]
        model_dir: PathBuf,

        /// Engine to load with (identity or plan)
        #[arg(long, default_value = "identity")]
        engine: String,

        /// Request batch size (forced to 1 for non-batching models)
        #[arg(long, default_value_t = 1)]
        batch: u32,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },
}
