//! # CLI Command Implementations
//!
//! This module contains the implementation for each subcommand of the
//! `pkglink` command-line tool. Each subcommand is defined in its own file.
//!
//! ## Structure
//!
//! Each command module contains:
//! - An `Args` struct that defines the command-specific arguments, derived
//!   using `clap`. Every command flattens [`ResolveArgs`], the options shared
//!   by anything that builds a linkage graph.
//! - An `execute` function that takes the parsed `Args` and calls into the
//!   `pkglink` library.

pub mod exec;
pub mod graph;
pub mod hash;
pub mod tree;

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use pkglink::config::{self, Options, CONFIG_FILE};
use pkglink::linkage::{LinkageGraph, Resolver};
use pkglink::reference::Reference;

/// Options shared by every command that resolves a package
#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// The package to resolve: a path, URL, archive or `name@predicate`.
    #[arg(value_name = "REFERENCE", default_value = ".")]
    pub reference: String,

    /// Path to the options file.
    ///
    /// Defaults to `pkglink.yaml` in the working directory; a missing
    /// default file means default options.
    /// Can also be set with the `PKGLINK_CONFIG` environment variable.
    #[arg(long, value_name = "FILE", env = "PKGLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Activate a variant overlay. May be repeated; later variants win.
    #[arg(long = "variant", value_name = "NAME")]
    pub variants: Vec<String>,

    /// Leave `debug` roots out of module and resource election.
    #[arg(long)]
    pub no_debug: bool,

    /// Install directory of a named registry, as NAME=DIR. May be repeated.
    #[arg(long = "registry", value_name = "NAME=DIR", value_parser = parse_registry)]
    pub registries: Vec<(String, PathBuf)>,
}

impl ResolveArgs {
    /// Loads the options file and applies the command-line overrides.
    pub fn options(&self) -> Result<Options> {
        let mut options = match &self.config {
            Some(path) => config::from_file(path)
                .with_context(|| format!("Failed to load options from {}", path.display()))?,
            None => config::load_or_default(&PathBuf::from(CONFIG_FILE))
                .with_context(|| format!("Failed to load options from {}", CONFIG_FILE))?,
        };
        if !self.variants.is_empty() {
            options.variants = self.variants.clone();
        }
        if self.no_debug {
            options.debug = false;
        }
        for (name, root) in &self.registries {
            options.registries.insert(name.clone(), root.clone());
        }
        Ok(options)
    }

    /// Builds the linkage graph of the reference.
    pub fn build(&self) -> Result<(Resolver, LinkageGraph)> {
        let resolver = Resolver::new(self.options()?);
        let graph = resolver
            .build(&Reference::parse(&self.reference))
            .with_context(|| format!("Failed to resolve {}", self.reference))?;
        Ok((resolver, graph))
    }
}

fn parse_registry(value: &str) -> std::result::Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, root)) if !name.is_empty() && !root.is_empty() => {
            Ok((name.to_string(), PathBuf::from(root)))
        }
        _ => Err(format!("expected NAME=DIR, got {:?}", value)),
    }
}
