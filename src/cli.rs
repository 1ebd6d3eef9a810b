//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// pkglink - Resolve, hash and execute package linkage graphs
#[derive(Parser, Debug)]
#[command(name = "pkglink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the linkage graph of a package as JSON
    Graph(commands::graph::GraphArgs),

    /// Display the packages a package maps, as a tree
    Tree(commands::tree::TreeArgs),

    /// Print the content hash of every package in the linkage graph
    Hash(commands::hash::HashArgs),

    /// Execute a module of a package and print its exports as JSON
    Exec(commands::exec::ExecArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        env_logger::Builder::new()
            .parse_filters(&self.log_level)
            .format_timestamp(None)
            .try_init()
            .ok();

        match self.command {
            Commands::Graph(args) => commands::graph::execute(args),
            Commands::Tree(args) => commands::tree::execute(args),
            Commands::Hash(args) => commands::hash::execute(args),
            Commands::Exec(args) => commands::exec::execute(args),
        }
    }
}
