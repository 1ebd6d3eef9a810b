//! Resolution of a root reference into a [`LinkageGraph`].
//!
//! ## Overview
//!
//! A resolution run moves through these stages:
//! 1. Package info - read one package's manifest, elect its modules and
//!    collect its resources (`info`)
//! 2. Graph building - merge includes, alias mappings, and walk every
//!    mapped package breadth-first into one flat graph (`graph`)
//! 3. Read and compile - attach file content, then native source, to each
//!    module (`passes`)
//! 4. Hashing - digest each package's content (`hash`)
//!
//! All stages share one [`Resolver`], which owns the memo tables. Nothing is
//! global: two resolvers never observe each other's work.

pub mod graph;
pub mod hash;
pub mod info;
pub mod passes;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::Memo;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::filesystem::{slash_path, FileSystem, HostFs};
use crate::manifest::{Language, Manifest};
use crate::network::{HttpNetwork, Network};
use crate::reference::Reference;
use crate::runtime::Linker;
use crate::vfs::{Vfs, VfsNode};

pub use graph::Resolved;
pub use info::PackageInfo;

/// Where a module's factory comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A source file elected from one of the package roots.
    File {
        fs: Arc<dyn FileSystem>,
        /// Path inside `fs`.
        path: PathBuf,
        href: String,
        /// Path of the file inside the filesystem holding the package.
        package_path: PathBuf,
        /// Set when the file is written in a declared, compiled language.
        language: Option<Language>,
    },
    /// An alias for module `id` of the package at `package`.
    Reference { package: String, id: String },
    /// A host facility.
    System { name: String },
    /// A module synthesized by a capability provider for `owner`.
    Virtual { provider: String, owner: String },
}

/// One module of a package.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub source: ModuleSource,
    /// Raw bytes, attached by the read pass.
    pub content: Option<Vec<u8>>,
    /// Native source text, attached by the compile pass.
    pub native: Option<String>,
}

impl ModuleDescriptor {
    fn new(source: ModuleSource) -> Self {
        Self {
            source,
            content: None,
            native: None,
        }
    }

    pub fn file(
        fs: Arc<dyn FileSystem>,
        path: PathBuf,
        href: String,
        package_path: PathBuf,
        language: Option<Language>,
    ) -> Self {
        Self::new(ModuleSource::File {
            fs,
            path,
            href,
            package_path,
            language,
        })
    }

    pub fn reference(package: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(ModuleSource::Reference {
            package: package.into(),
            id: id.into(),
        })
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self::new(ModuleSource::System { name: name.into() })
    }

    pub fn virtual_module(provider: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::new(ModuleSource::Virtual {
            provider: provider.into(),
            owner: owner.into(),
        })
    }

    /// Whether this module is backed by a file.
    pub fn is_file(&self) -> bool {
        matches!(self.source, ModuleSource::File { .. })
    }

    /// The compiled language of a file module, if any.
    pub fn language(&self) -> Option<&Language> {
        match &self.source {
            ModuleSource::File { language, .. } => language.as_ref(),
            _ => None,
        }
    }

    /// The href of a file module.
    pub fn href(&self) -> Option<&str> {
        match &self.source {
            ModuleSource::File { href, .. } => Some(href),
            _ => None,
        }
    }

    /// A one-line description for summaries.
    pub fn describe(&self) -> String {
        match &self.source {
            ModuleSource::File { path, language, .. } => match language {
                Some(language) => format!("{} ({})", slash_path(path), language.extension),
                None => slash_path(path),
            },
            ModuleSource::Reference { package, id } => format!("-> {}#{:?}", package, id),
            ModuleSource::System { name } => format!("system:{}", name),
            ModuleSource::Virtual { provider, .. } => format!("capability:{}", provider),
        }
    }
}

/// One resource file of a package.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub fs: Arc<dyn FileSystem>,
    pub path: PathBuf,
    /// Raw bytes, attached by the read pass.
    pub content: Option<Vec<u8>>,
}

impl ResourceDescriptor {
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            content: None,
        }
    }
}

/// One resolved package.
#[derive(Debug, Clone)]
pub struct PackageNode {
    pub href: String,
    /// Where the package lives; `None` for system and capability packages.
    pub location: Option<VfsNode>,
    pub manifest: Option<Arc<Manifest>>,
    /// Module id -> descriptor, includes and mapping aliases merged in.
    pub library: BTreeMap<String, ModuleDescriptor>,
    /// Resource path -> descriptor, includes merged in.
    pub resources: BTreeMap<String, ResourceDescriptor>,
    /// Module ids visible to packages that map this one.
    pub public: Vec<String>,
    /// Hrefs of mapped packages, in mapping order.
    pub dependencies: Vec<String>,
    /// Content digest, attached by the hash pass.
    pub hash: Option<String>,
}

impl PackageNode {
    /// A package not backed by any location.
    pub fn synthetic(href: impl Into<String>, library: BTreeMap<String, ModuleDescriptor>) -> Self {
        Self {
            href: href.into(),
            location: None,
            manifest: None,
            public: library.keys().cloned().collect(),
            library,
            resources: BTreeMap::new(),
            dependencies: Vec::new(),
            hash: None,
        }
    }

    /// The shared scope variables declared by the manifest.
    pub fn scope(&self) -> serde_json::Map<String, Value> {
        self.manifest
            .as_ref()
            .map(|manifest| manifest.scope.clone())
            .unwrap_or_default()
    }
}

/// A non-fatal problem noticed during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub href: String,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.href, self.message)
    }
}

/// The complete resolved package map plus the entry package's href.
#[derive(Debug, Clone)]
pub struct LinkageGraph {
    pub main: String,
    pub packages: BTreeMap<String, PackageNode>,
    /// Hrefs of the system and capability packages in use.
    pub capabilities: Vec<String>,
    pub warnings: Vec<Warning>,
}

impl LinkageGraph {
    /// The entry package.
    pub fn main_package(&self) -> Result<&PackageNode> {
        self.package(&self.main)
    }

    pub fn package(&self, href: &str) -> Result<&PackageNode> {
        self.packages.get(href).ok_or_else(|| Error::NotFound {
            href: href.to_string(),
            message: "package is not part of the linkage".to_string(),
        })
    }

    /// Every module as (package href, module id, descriptor).
    pub fn modules(&self) -> impl Iterator<Item = (&str, &str, &ModuleDescriptor)> {
        self.packages.iter().flat_map(|(href, package)| {
            package
                .library
                .iter()
                .map(move |(id, module)| (href.as_str(), id.as_str(), module))
        })
    }

    /// Every resource as (package href, resource path, descriptor).
    pub fn resources(&self) -> impl Iterator<Item = (&str, &str, &ResourceDescriptor)> {
        self.packages.iter().flat_map(|(href, package)| {
            package
                .resources
                .iter()
                .map(move |(path, resource)| (href.as_str(), path.as_str(), resource))
        })
    }

    /// A JSON summary: hashes, dependencies, module kinds and resource paths.
    pub fn summary(&self) -> Value {
        let packages: serde_json::Map<String, Value> = self
            .packages
            .iter()
            .map(|(href, package)| {
                let library: serde_json::Map<String, Value> = package
                    .library
                    .iter()
                    .map(|(id, module)| (id.clone(), Value::from(module.describe())))
                    .collect();
                let resources: Vec<&String> = package.resources.keys().collect();
                (
                    href.clone(),
                    json!({
                        "hash": package.hash,
                        "dependencies": package.dependencies,
                        "library": library,
                        "resources": resources,
                    }),
                )
            })
            .collect();
        json!({
            "main": self.main,
            "capabilities": self.capabilities,
            "warnings": self.warnings,
            "packages": packages,
        })
    }
}

/// The resolution context: collaborators, options and memo tables.
#[derive(Debug)]
pub struct Resolver {
    options: Options,
    vfs: Vfs,
    infos: Memo<String, Arc<PackageInfo>>,
    nodes: Memo<String, graph::Built>,
    warnings: Mutex<Vec<Warning>>,
    capabilities: Mutex<BTreeSet<String>>,
}

impl Resolver {
    /// A resolver over the host filesystem and HTTP.
    pub fn new(options: Options) -> Self {
        Self::with_collaborators(options, Arc::new(HostFs::new()), Arc::new(HttpNetwork::new()))
    }

    pub fn with_collaborators(
        options: Options,
        host: Arc<dyn FileSystem>,
        network: Arc<dyn Network>,
    ) -> Self {
        let vfs = Vfs::new(host, network, options.archive_extensions.clone());
        Self {
            options,
            vfs,
            infos: Memo::new(),
            nodes: Memo::new(),
            warnings: Mutex::new(Vec::new()),
            capabilities: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> Result<Vec<Warning>> {
        let warnings = self.warnings.lock().map_err(|_| Error::LockPoisoned {
            context: "warnings".to_string(),
        })?;
        Ok(warnings.clone())
    }

    pub(crate) fn warn(&self, href: &str, message: String) -> Result<()> {
        warn!("{}: {}", href, message);
        let mut warnings = self.warnings.lock().map_err(|_| Error::LockPoisoned {
            context: "warnings".to_string(),
        })?;
        warnings.push(Warning {
            href: href.to_string(),
            message,
        });
        Ok(())
    }

    pub(crate) fn record_capability(&self, href: &str) -> Result<()> {
        let mut capabilities = self.capabilities.lock().map_err(|_| Error::LockPoisoned {
            context: "capabilities".to_string(),
        })?;
        capabilities.insert(href.to_string());
        Ok(())
    }

    pub(crate) fn capabilities(&self) -> Result<Vec<String>> {
        let capabilities = self.capabilities.lock().map_err(|_| Error::LockPoisoned {
            context: "capabilities".to_string(),
        })?;
        Ok(capabilities.iter().cloned().collect())
    }
}

/// Builds the linkage graph of `reference`, resolved against the working
/// directory.
pub fn load_linkage(reference: &Reference, options: Options) -> Result<LinkageGraph> {
    Resolver::new(options).build(reference)
}

/// Walks up from `path` to the nearest directory holding a manifest.
pub fn find_package(fs: &dyn FileSystem, path: &Path, manifest: &str) -> Result<PathBuf> {
    let mut current = Some(path);
    while let Some(directory) = current {
        if fs.is_file(&directory.join(manifest))? {
            return Ok(directory.to_path_buf());
        }
        current = directory.parent();
    }
    Err(Error::NotFound {
        href: path.display().to_string(),
        message: format!("no {} in this directory or any parent", manifest),
    })
}

/// Finds the id of the module backed by the file at `path`.
///
/// `path` is a path in the filesystem holding the package; the package's own
/// directory maps to the main module.
pub fn find_id_for_path(package: &PackageNode, path: &Path) -> Result<String> {
    if package.library.contains_key("") {
        if let Some(location) = &package.location {
            if location.path == path {
                return Ok(String::new());
            }
        }
    }
    for (id, module) in &package.library {
        if let ModuleSource::File { package_path, .. } = &module.source {
            if package_path == path {
                return Ok(id.clone());
            }
        }
    }
    Err(Error::ModuleNotFound {
        id: path.display().to_string(),
        href: Some(package.href.clone()),
    })
}

/// Builds, reads, compiles and links the package containing the file at
/// `path`, then executes the module that file backs.
pub fn require_href(location: &str, options: Options, linker: &Linker) -> Result<Value> {
    let resolver = Resolver::new(options);
    let path = match url::Url::parse(location) {
        Ok(url) if url.scheme() == "file" => {
            url.to_file_path().map_err(|_| Error::ReferenceUnsupported {
                reference: location.to_string(),
                message: "file URL does not name a local path".to_string(),
            })?
        }
        Ok(url) if url.scheme().len() > 1 => {
            return Err(Error::ReferenceUnsupported {
                reference: location.to_string(),
                message: "only local files can be required directly".to_string(),
            })
        }
        _ => PathBuf::from(location),
    };
    let host = resolver.vfs().host();
    let path = host.canonical(&path)?;
    let start = if host.is_directory(&path)? {
        path.clone()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let root = find_package(host.as_ref(), &start, &resolver.options().manifest)?;

    let mut graph = resolver.build(&Reference::Path(root))?;
    passes::read(&mut graph)?;
    passes::compile(&mut graph, &resolver, linker)?;
    let id = find_id_for_path(graph.main_package()?, &path)?;
    let program = linker.link(&graph)?;
    program.exec(&id)
}
