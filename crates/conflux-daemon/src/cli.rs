use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI surface of the daemon.
#[derive(Parser, Debug)]
#[command(
    name = "confluxd",
    about = "Versioned configuration and secrets distribution daemon",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Optional subcommand; defaults to running the daemon when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon until interrupted.
    Run,
    /// Print version and exit.
    Version,
    /// Run a health check against core subsystems (keys, storage, config).
    Health,
    /// Manage daemon configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Inspect and rotate master keys.
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Principal the operation is authorized and audited as.
    #[arg(long)]
    pub principal: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// List master key versions and their state.
    List(Operator),
    /// Rotate the master key and re-encrypt stored secrets.
    Rotate(Operator),
    /// Retire a decrypt-only key version after its grace period.
    Retire {
        #[arg(id = "key_version", value_name = "VERSION")]
        version: u32,
        #[command(flatten)]
        operator: Operator,
    },
}
