//! # Exec Command Implementation
//!
//! This module implements the `exec` subcommand, which builds, reads,
//! compiles and links a package, executes one of its modules and prints the
//! module's exports as JSON.
//!
//! When the reference names a source file rather than a package, the
//! package containing the file is found by walking up from it, and the
//! module that file backs is executed.

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

use pkglink::linkage::{passes, require_href};
use pkglink::runtime::Linker;

use super::ResolveArgs;

/// Execute a module of a package and print its exports as JSON
#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub resolve: ResolveArgs,

    /// The module id to execute. Defaults to the main module.
    #[arg(short, long, value_name = "ID", default_value = "")]
    pub module: String,
}

/// Execute the `exec` command.
pub fn execute(args: ExecArgs) -> Result<()> {
    let linker = Linker::default().with_scope(args.resolve.options()?.scope);

    let exports = if Path::new(&args.resolve.reference).is_file() {
        require_href(&args.resolve.reference, args.resolve.options()?, &linker)
            .with_context(|| format!("Failed to execute {}", args.resolve.reference))?
    } else {
        let (resolver, mut graph) = args.resolve.build()?;
        passes::read(&mut graph).context("Failed to read package content")?;
        passes::compile(&mut graph, &resolver, &linker).context("Failed to compile modules")?;
        linker
            .link(&graph)?
            .exec(&args.module)
            .with_context(|| format!("Failed to execute module {:?}", args.module))?
    };
    println!("{}", serde_json::to_string_pretty(&exports)?);
    Ok(())
}
