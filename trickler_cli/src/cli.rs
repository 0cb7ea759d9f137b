//! CLI argument definitions.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "trickler", version, about = "Powder trickler simulation CLI")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Console log level (error|warn|info|debug|trace); RUST_LOG wins
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit one JSON line per result instead of prose
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run simulated charge cycles against the target weight
    Charge {
        /// Target charge weight (overrides the config file)
        #[arg(long)]
        grams: Option<f32>,
        /// Number of drop cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },
    /// Run a full auto-tuning session on the simulated rig
    Tune {
        /// Target charge weight used for the tuning drops
        #[arg(long)]
        grams: Option<f32>,
    },
    /// Stage, verify and activate a fake firmware image in RAM flash
    FwDemo,
    /// Quick health check of the simulated rig
    SelfCheck,
}
