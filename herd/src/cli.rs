use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// herd is a control plane for MySQL replication groups and shards.
#[derive(Parser, Debug)]
#[command(name = "herd", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "herd.toml"
    #[arg(short, long, default_value = "herd.toml")]
    pub config: PathBuf,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the herd daemon.
    Run,

    /// Check the configuration file for errors.
    Configcheck,

    /// Print the state store schema in creation order.
    Schema,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
