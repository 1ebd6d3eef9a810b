//! Stage 4: Content Hashing
//!
//! A package's hash is a SHA-256 digest over the content of its modules, in
//! id order, followed by the content of its resources, in path order. It
//! depends only on content, never on where the files live, so the same
//! package unpacked in two places hashes the same.

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::{LinkageGraph, ModuleSource, PackageNode};
use crate::error::{Error, Result};

/// Hex characters kept from the digest.
pub const HASH_LENGTH: usize = 40;

/// Hashes one package. Its source-file modules and resources must have
/// been read.
pub fn hash_package(package: &PackageNode) -> Result<String> {
    let mut hasher = Sha256::new();
    for module in package.library.values() {
        match (&module.source, &module.content) {
            (_, Some(content)) => hasher.update(content),
            (ModuleSource::File { href, .. }, None) => {
                return Err(Error::NotRead {
                    href: package.href.clone(),
                    path: href.clone(),
                })
            }
            _ => {}
        }
    }
    for (path, resource) in &package.resources {
        let content = resource.content.as_ref().ok_or_else(|| Error::NotRead {
            href: package.href.clone(),
            path: path.clone(),
        })?;
        hasher.update(content);
    }
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(HASH_LENGTH);
    Ok(digest)
}

/// Assigns the hash of every package in `graph`.
pub fn hash(graph: &mut LinkageGraph) -> Result<()> {
    graph
        .packages
        .par_iter_mut()
        .try_for_each(|(_, package)| {
            package.hash = Some(hash_package(package)?);
            Ok(())
        })
}
