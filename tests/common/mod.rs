//! Shared test utilities for integration and E2E tests.
//!
//! This module provides package fixtures and helpers to reduce duplication
//! across test files.
//!
//! ## Usage
//!
//! Add `mod common;` to your test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_package("app", manifests::NATIVE);
//!     let graph = fixture.build("app").unwrap();
//! }
//! ```

use assert_fs::prelude::*;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use pkglink::config::Options;
use pkglink::filesystem::HostFs;
use pkglink::linkage::{LinkageGraph, Resolver};
use pkglink::network::Offline;
use pkglink::reference::Reference;
use pkglink::Result;

/// Re-export commonly used test dependencies for convenience.
#[allow(unused_imports)]
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    pub use super::manifests;
    pub use super::zip_bytes;
    pub use super::TestFixture;
}

/// Common manifest snippets for testing.
#[allow(dead_code)]
pub mod manifests {
    /// A native package with no fields beyond the marker.
    pub const NATIVE: &str = r#"{"pkglink": true}"#;

    /// A registry-style package.
    pub const REGISTRY: &str = r#"{"name": "dep", "version": "1.0.0"}"#;

    /// A package declaring list-style dependencies, which are unsupported.
    pub const LIST_DEPENDENCIES: &str = r#"{"dependencies": ["a", "b"]}"#;

    /// A manifest that is not JSON.
    pub const INVALID_JSON: &str = "{ not json";
}

/// Builds a zip archive in memory from `(path, content)` entries.
#[allow(dead_code)]
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (path, content) in entries {
        writer
            .start_file(*path, options)
            .expect("Failed to start zip entry");
        writer.write_all(content).expect("Failed to write zip entry");
    }
    writer
        .finish()
        .expect("Failed to finish zip archive")
        .into_inner()
}

/// A temporary directory holding one or more packages.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::new()
///     .with_package("app", r#"{"pkglink": true, "mappings": {"util": "../util"}}"#)
///     .with_file("app/lib/index.json", "{}")
///     .with_package("util", manifests::NATIVE);
/// ```
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

#[allow(dead_code)]
impl TestFixture {
    /// Create a new test fixture with an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp_dir: assert_fs::TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add a package directory with the given manifest.
    pub fn with_package(self, directory: &str, manifest: &str) -> Self {
        self.with_file(&format!("{}/package.json", directory), manifest)
    }

    /// Add a file with the given path and content.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Add a binary file with the given path and content.
    pub fn with_binary_file(self, path: &str, content: &[u8]) -> Self {
        self.temp_dir
            .child(path)
            .write_binary(content)
            .expect("Failed to write binary file");
        self
    }

    /// Get the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a child path in the temp directory.
    pub fn child(&self, path: &str) -> assert_fs::fixture::ChildPath {
        self.temp_dir.child(path)
    }

    /// A resolver over the host filesystem with networking disabled.
    pub fn resolver(&self, options: Options) -> Resolver {
        Resolver::with_collaborators(options, Arc::new(HostFs::new()), Arc::new(Offline))
    }

    /// Build the graph of `reference`, resolved against the fixture root.
    pub fn build_with(&self, resolver: &Resolver, reference: &str) -> Result<LinkageGraph> {
        let base = resolver.vfs().directory(self.path())?;
        resolver.build_from(&Reference::parse(reference), &base)
    }

    /// Build the graph of `reference` with default options.
    pub fn build(&self, reference: &str) -> Result<LinkageGraph> {
        self.build_with(&self.resolver(Options::default()), reference)
    }

    /// Create a command configured to run in this fixture's directory.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pkglink");
        cmd.current_dir(self.path());
        cmd.env_remove("PKGLINK_CONFIG");
        cmd
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_with_package() {
        let fixture = TestFixture::new().with_package("app", manifests::NATIVE);
        assert!(fixture.path().join("app/package.json").exists());
    }

    #[test]
    fn test_zip_bytes_is_an_archive() {
        let bytes = zip_bytes(&[("a.txt", b"a")]);
        assert!(bytes.starts_with(b"PK"));
    }
}
