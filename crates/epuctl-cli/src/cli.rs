use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "epuctl",
    about = "Elastic processing unit control plane: autoscaler and process dispatcher",
    version
)]
pub struct Cli {
    /// Path to the control-plane config file.
    #[arg(long, env = "EPUCTL_CONFIG", global = true, default_value = "epuctl.yml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the control plane and run until interrupted.
    Run {
        /// Roles this replica runs.
        #[arg(long, value_delimiter = ',', default_values = ["provisioner", "epum", "pd"])]
        roles: Vec<RoleArg>,
    },

    /// Parse and validate the config file, then exit.
    Validate,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Provisioner,
    Epum,
    Pd,
}
