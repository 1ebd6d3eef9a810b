//! # Hash Command Implementation
//!
//! This module implements the `hash` subcommand, which reads every package
//! of a linkage graph and prints one `<hash>  <href>` line per package,
//! the entry package first.

use anyhow::{Context, Result};
use clap::Args;

use pkglink::linkage::{hash, passes};

use super::ResolveArgs;

/// Print the content hash of every package in the linkage graph
#[derive(Args, Debug)]
pub struct HashArgs {
    #[command(flatten)]
    pub resolve: ResolveArgs,

    /// Print only the entry package's hash.
    #[arg(long)]
    pub main_only: bool,
}

/// Execute the `hash` command.
pub fn execute(args: HashArgs) -> Result<()> {
    let (_, mut graph) = args.resolve.build()?;
    passes::read(&mut graph).context("Failed to read package content")?;
    hash::hash(&mut graph).context("Failed to hash packages")?;

    let main = graph.main_package()?;
    println!("{}  {}", main.hash.as_deref().unwrap_or_default(), main.href);
    if args.main_only {
        return Ok(());
    }
    for (href, package) in &graph.packages {
        if *href != graph.main {
            println!("{}  {}", package.hash.as_deref().unwrap_or_default(), href);
        }
    }
    Ok(())
}
