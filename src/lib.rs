//! # Package Linkage Library
//!
//! This library resolves a package reference into a deduplicated linkage
//! graph, reads and compiles the graph's modules, hashes its packages, and
//! links the result into executable modules. It is used by the `pkglink`
//! command-line tool but is meant to be embedded by bundlers, loaders and
//! test harnesses alike.
//!
//! ## Quick Example
//!
//! ```no_run
//! use pkglink::config::Options;
//! use pkglink::linkage::{hash, passes, Resolver};
//! use pkglink::reference::Reference;
//! use pkglink::runtime::Linker;
//!
//! let resolver = Resolver::new(Options::default());
//! let mut graph = resolver.build(&Reference::parse("./my-app")).unwrap();
//! passes::read(&mut graph).unwrap();
//! hash::hash(&mut graph).unwrap();
//!
//! let linker = Linker::default();
//! passes::compile(&mut graph, &resolver, &linker).unwrap();
//! let exports = linker.link(&graph).unwrap().exec("").unwrap();
//! println!("{}", exports);
//! ```
//!
//! ## Core Concepts
//!
//! - **References (`reference`)**: every way a package can be named - a
//!   path, an href, an archive, a registry dependency, a capability or a
//!   host facility.
//! - **Virtual Filesystem (`vfs`, `filesystem`, `archive`, `network`)**:
//!   turns a reference into a directory on some filesystem, looking through
//!   archives and remote locations, and gives each location one canonical
//!   href.
//! - **Manifests (`manifest`, `version`)**: normalize the different
//!   manifest styles into one typed record and select installed versions.
//! - **Linkage (`linkage`)**: elect modules per package, merge includes,
//!   alias mappings and walk everything into a [`linkage::LinkageGraph`].
//! - **Runtime (`runtime`, `capabilities`)**: evaluate modules at most once
//!   through per-package requirers.
//!
//! Every stage is memoized per [`linkage::Resolver`]; within one resolver
//! each location is fetched once and each package is built once, however
//! many packages reach it.

pub mod archive;
pub mod cache;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod linkage;
pub mod manifest;
pub mod network;
pub mod reference;
pub mod runtime;
pub mod version;
pub mod vfs;

pub use error::{Error, Result};
pub use linkage::{load_linkage, require_href, LinkageGraph, Resolver};

#[cfg(test)]
mod version_proptest;
