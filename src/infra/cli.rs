//! CLI arguments for the `connector` binary.

use {clap::Parser, std::path::PathBuf};

/// Run an ILP connector node.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// The log filter.
    #[arg(long, env = "LOG_LEVEL", default_value = "warn,connector=debug")]
    pub log: String,

    /// Whether to use JSON format for the logs.
    #[clap(long, env, default_value = "false")]
    pub use_json_logs: bool,

    /// Path to the node configuration file (TOML).
    #[arg(long, env)]
    pub config: PathBuf,
}
