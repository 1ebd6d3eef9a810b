//! # Tree Command Implementation
//!
//! This module implements the `tree` subcommand, which displays the packages
//! a package maps, and the packages they map in turn, as a tree.
//!
//! ## Functionality
//!
//! - **Mapping Visualization**: one line per package with its href and
//!   module count.
//! - **Depth Control**: supports `--depth` to limit tree depth.
//! - **Repeats**: a package already shown higher up is listed again but not
//!   expanded, so mapping cycles terminate.
//!
//! This command is a read-only operation that does not modify any files.

use anyhow::Result;
use clap::Args;
use ptree::{print_tree, TreeItem};
use std::collections::HashSet;

use pkglink::linkage::LinkageGraph;

use super::ResolveArgs;

/// Display the packages a package maps, as a tree
#[derive(Args, Debug)]
pub struct TreeArgs {
    #[command(flatten)]
    pub resolve: ResolveArgs,

    /// Maximum depth to display in the tree.
    ///
    /// If not specified, displays the full tree.
    /// Use 0 to show only the entry package.
    #[arg(long, value_name = "NUM")]
    pub depth: Option<usize>,
}

/// Execute the `tree` command.
pub fn execute(args: TreeArgs) -> Result<()> {
    let (_, graph) = args.resolve.build()?;
    let mut seen = HashSet::new();
    let root = build_tree_node(
        &graph,
        &graph.main,
        args.depth.unwrap_or(usize::MAX),
        0,
        &mut seen,
    );
    print_tree(&root).map_err(|e| anyhow::anyhow!("Failed to display tree: {}", e))?;
    for warning in &graph.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

/// Build a tree node for the package at `href`
fn build_tree_node(
    graph: &LinkageGraph,
    href: &str,
    max_depth: usize,
    current_depth: usize,
    seen: &mut HashSet<String>,
) -> TreeNode {
    let package = match graph.packages.get(href) {
        Some(package) => package,
        None => {
            return TreeNode {
                label: format!("{} (missing)", href),
                children: vec![],
            }
        }
    };
    let label = format!("{} [{} modules]", href, package.library.len());

    if !seen.insert(href.to_string()) {
        return TreeNode {
            label: format!("{} (repeated)", label),
            children: vec![],
        };
    }
    if current_depth >= max_depth {
        return TreeNode {
            label,
            children: vec![],
        };
    }
    let children = package
        .dependencies
        .iter()
        .map(|dependency| build_tree_node(graph, dependency, max_depth, current_depth + 1, seen))
        .collect();
    TreeNode { label, children }
}

/// Tree node structure for ptree visualization
#[derive(Clone)]
struct TreeNode {
    label: String,
    children: Vec<TreeNode>,
}

impl TreeItem for TreeNode {
    type Child = TreeNode;

    fn write_self<W: std::io::Write>(
        &self,
        f: &mut W,
        _style: &ptree::Style,
    ) -> std::io::Result<()> {
        write!(f, "{}", self.label)
    }

    fn children(&self) -> std::borrow::Cow<'_, [Self::Child]> {
        std::borrow::Cow::Borrowed(&self.children)
    }
}
