//! # Graph Command Implementation
//!
//! This module implements the `graph` subcommand, which resolves a package
//! and prints its linkage graph as JSON: every package with its modules,
//! resources and dependencies, plus the capabilities in use and the
//! warnings raised during election.
//!
//! This command is a read-only operation that does not modify any files.

use anyhow::{Context, Result};
use clap::Args;

use pkglink::linkage::{hash, passes};

use super::ResolveArgs;

/// Print the linkage graph of a package as JSON
#[derive(Args, Debug)]
pub struct GraphArgs {
    #[command(flatten)]
    pub resolve: ResolveArgs,

    /// Read every package and include its content hash.
    #[arg(long)]
    pub hash: bool,
}

/// Execute the `graph` command.
pub fn execute(args: GraphArgs) -> Result<()> {
    let (_, mut graph) = args.resolve.build()?;
    if args.hash {
        passes::read(&mut graph).context("Failed to read package content")?;
        hash::hash(&mut graph).context("Failed to hash packages")?;
    }
    println!("{}", serde_json::to_string_pretty(&graph.summary())?);
    Ok(())
}
