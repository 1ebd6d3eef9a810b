//! Stage 2: Graph Building
//!
//! Turns package infos into [`PackageNode`]s and walks mappings into one
//! flat [`LinkageGraph`].
//!
//! ## Process
//!
//! 1.  **Dispatch (`resolve`)**: `system` and `capability` references become
//!     synthetic packages without touching any filesystem. Named references
//!     select an installed version from their registry on the host and
//!     continue as that directory's `file:` href, whoever asked. Paths,
//!     hrefs and archives go through the VFS and the package info loader.
//!
//! 2.  **Merging (`merge`)**: a package's includes are merged depth-first,
//!     in declaration order, ahead of the package's own mapping aliases and
//!     modules, so the including package wins every collision. A visited
//!     set makes a repeated include a no-op.
//!
//! 3.  **Walking (`build`)**: mapped packages are built breadth-first, one
//!     level at a time, in parallel. Each node is built once per href, no
//!     matter how many packages map it.
//!
//! A failure inside a dependency is wrapped with the href of the package
//! that required it, so the final error reads as the dependency chain.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use log::{debug, info};
use rayon::prelude::*;

use super::{
    LinkageGraph, ModuleDescriptor, ModuleSource, PackageInfo, PackageNode, ResourceDescriptor,
    Resolver,
};
use crate::capabilities;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::reference::Reference;
use crate::vfs::VfsNode;

/// A reference after dispatch: either a package on some filesystem or a
/// synthetic package.
#[derive(Debug, Clone)]
pub enum Resolved {
    Package(Arc<PackageInfo>),
    Synthetic(Arc<PackageNode>),
}

impl Resolved {
    pub fn href(&self) -> &str {
        match self {
            Resolved::Package(info) => &info.href,
            Resolved::Synthetic(node) => &node.href,
        }
    }
}

/// A memoized node and the mapped packages it depends on.
#[derive(Debug, Clone)]
pub(crate) struct Built {
    pub(crate) node: Arc<PackageNode>,
    targets: Vec<Resolved>,
}

/// Who is asking for a reference.
#[derive(Debug, Clone, Copy)]
pub struct Requester<'a> {
    /// Relative references resolve against this location.
    pub base: &'a VfsNode,
    /// Supplies the default `registry`/`catalog` of named references.
    pub manifest: Option<&'a Manifest>,
    /// The package capability providers act for.
    pub owner: &'a str,
}

impl<'a> Requester<'a> {
    /// A requester outside any package.
    pub fn top(base: &'a VfsNode) -> Self {
        Self {
            base,
            manifest: None,
            owner: &base.href,
        }
    }
}

#[derive(Default)]
struct Merged {
    library: BTreeMap<String, ModuleDescriptor>,
    resources: BTreeMap<String, ResourceDescriptor>,
    dependencies: Vec<String>,
    targets: Vec<Resolved>,
}

impl Resolver {
    /// Dispatches a reference to the package it names.
    pub fn resolve(&self, reference: &Reference, requester: &Requester<'_>) -> Result<Resolved> {
        match reference {
            Reference::System(name) => {
                let href = capabilities::system_href(name);
                self.record_capability(&href)?;
                self.synthetic(href, || Ok(capabilities::system_package(name)))
            }
            Reference::Capability(name) => {
                let provider = capabilities::provider(name).ok_or_else(|| {
                    Error::ReferenceUnsupported {
                        reference: reference.to_string(),
                        message: format!("unknown capability {:?}", name),
                    }
                })?;
                let href = provider.href(requester.owner);
                self.record_capability(&href)?;
                self.synthetic(href, || Ok(provider.package(requester.owner)))
            }
            Reference::Named {
                name,
                predicate,
                registry,
                catalog,
            } => {
                let registry = registry
                    .clone()
                    .or_else(|| requester.manifest.and_then(|m| m.registry.clone()));
                let catalog = catalog
                    .clone()
                    .or_else(|| requester.manifest.and_then(|m| m.catalog.clone()));
                let registry_name = match (registry, catalog) {
                    (Some(_), Some(_)) => {
                        return Err(Error::ReferenceUnsupported {
                            reference: reference.to_string(),
                            message: format!(
                                "Can only use either registry or catalog, not both, in {}",
                                requester.owner
                            ),
                        })
                    }
                    (None, Some(catalog)) => {
                        return Err(Error::ReferenceUnsupported {
                            reference: reference.to_string(),
                            message: format!("Can't load from catalog {:?}", catalog),
                        })
                    }
                    (None, None) => {
                        return Err(Error::ReferenceUnsupported {
                            reference: reference.to_string(),
                            message: format!(
                                "Can't load package by name@version without a registry \
                                 on either the dependency or the package manifest of {}",
                                requester.owner
                            ),
                        })
                    }
                    (Some(registry), None) => registry,
                };
                let registry = self.options.registry(&registry_name).ok_or_else(|| {
                    Error::ReferenceUnsupported {
                        reference: reference.to_string(),
                        message: format!("Can't load from registry {:?}", registry_name),
                    }
                })?;
                let path = registry.find(self.vfs.host().as_ref(), name, predicate)?;
                let root = self.vfs.directory(&path)?;
                self.resolve(&Reference::Href(root.href), requester)
            }
            Reference::Path(_) | Reference::Href(_) | Reference::Archive(_) => {
                let location = reference.location().unwrap_or_default();
                let node = self.vfs.resolve(&location, requester.base)?;
                Ok(Resolved::Package(self.package_info(&node)?))
            }
        }
    }

    fn synthetic<F>(&self, href: String, producer: F) -> Result<Resolved>
    where
        F: FnOnce() -> Result<PackageNode>,
    {
        let built = self.nodes.get_or_settle(href, || {
            Ok(Built {
                node: Arc::new(producer()?),
                targets: Vec::new(),
            })
        })?;
        Ok(Resolved::Synthetic(built.node))
    }

    /// Resolves `reference` against `base` and returns its node.
    ///
    /// Repeated calls return the same node.
    pub fn package(&self, reference: &Reference, base: &VfsNode) -> Result<Arc<PackageNode>> {
        let resolved = self.resolve(reference, &Requester::top(base))?;
        Ok(self.built(&resolved)?.node)
    }

    fn built(&self, resolved: &Resolved) -> Result<Built> {
        match resolved {
            Resolved::Package(info) => self
                .nodes
                .get_or_settle(info.href.clone(), || self.build_node(info)),
            Resolved::Synthetic(node) => self.nodes.get_or_settle(node.href.clone(), || {
                Ok(Built {
                    node: Arc::clone(node),
                    targets: Vec::new(),
                })
            }),
        }
    }

    fn build_node(&self, info: &Arc<PackageInfo>) -> Result<Built> {
        debug!("Building package node for {}", info.href);
        let mut merged = Merged::default();
        self.merge(info, &info.href, &mut merged, &mut HashSet::new())?;

        let public = match &info.manifest.public {
            Some(public) => public.clone(),
            None => merged
                .library
                .iter()
                .filter(|(_, module)| module.is_file())
                .map(|(id, _)| id.clone())
                .collect(),
        };

        Ok(Built {
            node: Arc::new(PackageNode {
                href: info.href.clone(),
                location: Some(info.location.clone()),
                manifest: Some(Arc::clone(&info.manifest)),
                library: merged.library,
                resources: merged.resources,
                public,
                dependencies: merged.dependencies,
                hash: None,
            }),
            targets: merged.targets,
        })
    }

    fn merge(
        &self,
        info: &PackageInfo,
        owner: &str,
        merged: &mut Merged,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(info.href.clone()) {
            return Ok(());
        }
        let requester = Requester {
            base: &info.location,
            manifest: Some(&info.manifest),
            owner,
        };

        let includes: Vec<Result<Resolved>> = info
            .includes
            .par_iter()
            .map(|include| self.resolve(include, &requester))
            .collect();
        for include in includes {
            match include.map_err(|error| error.within(&info.href))? {
                Resolved::Package(included) => self.merge(&included, owner, merged, visited)?,
                Resolved::Synthetic(node) => {
                    if visited.insert(node.href.clone()) {
                        merged.library.extend(node.library.clone());
                        merged.resources.extend(node.resources.clone());
                    }
                }
            }
        }

        let mappings: Vec<(&String, Result<Resolved>)> = info
            .mappings
            .par_iter()
            .map(|(name, reference)| (name, self.resolve(reference, &requester)))
            .collect();
        for (name, target) in mappings {
            let target = target.map_err(|error| error.within(&info.href))?;
            let public = self
                .public_ids(&target)
                .map_err(|error| error.within(&info.href))?;
            for id in public {
                let alias = if id.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", name, id)
                };
                merged
                    .library
                    .insert(alias, ModuleDescriptor::reference(target.href(), id));
            }
            if !merged.dependencies.iter().any(|href| href == target.href()) {
                merged.dependencies.push(target.href().to_string());
                merged.targets.push(target);
            }
        }

        merged.library.extend(info.library.clone());
        merged.resources.extend(info.resources.clone());
        Ok(())
    }

    /// The module ids a mapping to `target` aliases.
    fn public_ids(&self, target: &Resolved) -> Result<BTreeSet<String>> {
        match target {
            Resolved::Synthetic(node) => Ok(node.public.iter().cloned().collect()),
            Resolved::Package(info) => match &info.manifest.public {
                Some(public) => Ok(public.iter().cloned().collect()),
                None => {
                    let mut ids = BTreeSet::new();
                    self.source_ids(info, &mut ids, &mut HashSet::new())?;
                    Ok(ids)
                }
            },
        }
    }

    fn source_ids(
        &self,
        info: &PackageInfo,
        ids: &mut BTreeSet<String>,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(info.href.clone()) {
            return Ok(());
        }
        let requester = Requester {
            base: &info.location,
            manifest: Some(&info.manifest),
            owner: &info.href,
        };
        for include in &info.includes {
            if let Resolved::Package(included) = self
                .resolve(include, &requester)
                .map_err(|error| error.within(&info.href))?
            {
                self.source_ids(&included, ids, visited)?;
            }
        }
        ids.extend(
            info.library
                .iter()
                .filter(|(_, module)| matches!(module.source, ModuleSource::File { .. }))
                .map(|(id, _)| id.clone()),
        );
        Ok(())
    }

    /// Builds the linkage graph of `reference`, resolved against the
    /// working directory.
    pub fn build(&self, reference: &Reference) -> Result<LinkageGraph> {
        let base = self.vfs.working_directory()?;
        self.build_from(reference, &base)
    }

    /// Builds the linkage graph of `reference`, resolved against `base`.
    pub fn build_from(&self, reference: &Reference, base: &VfsNode) -> Result<LinkageGraph> {
        let root = self.resolve(reference, &Requester::top(base))?;
        let main = root.href().to_string();

        let mut packages = BTreeMap::new();
        let mut queued: HashSet<String> = HashSet::from([main.clone()]);
        let mut level: Vec<(Option<String>, Resolved)> = vec![(None, root)];

        while !level.is_empty() {
            let built: Vec<Result<Built>> = level
                .par_iter()
                .map(|(parent, resolved)| {
                    self.built(resolved).map_err(|error| match parent {
                        Some(parent) => error.within(parent),
                        None => error,
                    })
                })
                .collect();

            let mut next = Vec::new();
            for built in built {
                let built = built?;
                for target in &built.targets {
                    if queued.insert(target.href().to_string()) {
                        next.push((Some(built.node.href.clone()), target.clone()));
                    }
                }
                packages.insert(built.node.href.clone(), PackageNode::clone(&built.node));
            }
            level = next;
        }

        info!("Resolved {} packages for {}", packages.len(), main);
        Ok(LinkageGraph {
            main,
            packages,
            capabilities: self.capabilities()?,
            warnings: self.warnings()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use crate::config::Options;
    use crate::filesystem::HostFs;
    use crate::network::Offline;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn write(root: &Path, path: &str, content: &str) {
        let file = root.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, content).unwrap();
    }

    fn resolver() -> Resolver {
        Resolver::with_collaborators(
            Options::default(),
            Arc::new(HostFs::new()),
            Arc::new(Offline),
        )
    }

    fn build(resolver: &Resolver, root: &Path, reference: &str) -> Result<LinkageGraph> {
        let base = resolver.vfs().directory(root).unwrap();
        resolver.build_from(&Reference::parse(reference), &base)
    }

    #[test]
    fn test_includes_merge_before_own_modules() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "includes": ["../base"], "resources": ["data"]}"#,
        );
        write(temp.path(), "app/lib/shared.json", r#""app""#);
        write(temp.path(), "app/data/a.txt", "app");
        write(
            temp.path(),
            "base/package.json",
            r#"{"pkglink": true, "resources": ["data"]}"#,
        );
        write(temp.path(), "base/lib/shared.json", r#""base""#);
        write(temp.path(), "base/lib/extra.json", r#""base""#);
        write(temp.path(), "base/data/a.txt", "base");
        write(temp.path(), "base/data/b.txt", "base");

        let resolver = resolver();
        let graph = build(&resolver, temp.path(), "app").unwrap();
        let app = graph.main_package().unwrap();

        assert_eq!(graph.packages.len(), 1);
        assert!(app.library["shared"].href().unwrap().contains("/app/"));
        assert!(app.library["extra"].href().unwrap().contains("/base/"));
        let resource = &app.resources["data/a.txt"];
        assert_eq!(resource.fs.read(&resource.path).unwrap(), b"app");
        assert!(app.resources.contains_key("data/b.txt"));
        assert_eq!(app.public, vec!["extra", "shared"]);
    }

    #[test]
    fn test_include_cycle_is_harmless() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "a/package.json",
            r#"{"pkglink": true, "includes": ["../b"]}"#,
        );
        write(temp.path(), "a/lib/a.json", "1");
        write(
            temp.path(),
            "b/package.json",
            r#"{"pkglink": true, "includes": ["../a"]}"#,
        );
        write(temp.path(), "b/lib/b.json", "2");

        let resolver = resolver();
        let graph = build(&resolver, temp.path(), "a").unwrap();
        let a = graph.main_package().unwrap();
        assert!(a.library.contains_key("a"));
        assert!(a.library.contains_key("b"));
    }

    #[test]
    fn test_mappings_alias_public_modules() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "mappings": {"util": "../util", "fs": {"system": "fs"}}}"#,
        );
        write(
            temp.path(),
            "util/package.json",
            r#"{"pkglink": true, "main": "lib/index"}"#,
        );
        write(temp.path(), "util/lib/index.json", "{}");
        write(temp.path(), "util/lib/strings.json", "{}");

        let resolver = resolver();
        let graph = build(&resolver, temp.path(), "app").unwrap();
        let app = graph.main_package().unwrap();

        let util_href = app.dependencies[1].clone();
        assert!(util_href.ends_with("/util"));
        assert_eq!(app.dependencies[0], "system:fs");
        assert!(matches!(
            &app.library["util"].source,
            ModuleSource::Reference { package, id } if *package == util_href && id.is_empty()
        ));
        assert!(matches!(
            &app.library["util/strings"].source,
            ModuleSource::Reference { id, .. } if id == "strings"
        ));
        assert!(matches!(
            &app.library["fs"].source,
            ModuleSource::Reference { package, .. } if package == "system:fs"
        ));
        assert_eq!(graph.packages.len(), 3);
        assert_eq!(graph.capabilities, vec!["system:fs"]);
    }

    #[test]
    fn test_shared_mapping_is_built_once() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "mappings": {"x": "../x", "y": "../y"}}"#,
        );
        write(
            temp.path(),
            "x/package.json",
            r#"{"pkglink": true, "mappings": {"shared": "../shared"}}"#,
        );
        write(
            temp.path(),
            "y/package.json",
            r#"{"pkglink": true, "mappings": {"shared": "../shared/."}}"#,
        );
        write(temp.path(), "shared/package.json", r#"{"pkglink": true}"#);

        let resolver = resolver();
        let graph = build(&resolver, temp.path(), "app").unwrap();
        assert_eq!(graph.packages.len(), 4);

        let base = resolver.vfs().directory(temp.path()).unwrap();
        let first = resolver
            .package(&Reference::parse("shared"), &base)
            .unwrap();
        let second = resolver
            .package(&Reference::parse("./x/../shared"), &base)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_dependency_failure_names_chain() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "mappings": {"mid": "../mid"}}"#,
        );
        write(
            temp.path(),
            "mid/package.json",
            r#"{"pkglink": true, "mappings": {"gone": "../gone"}}"#,
        );

        let resolver = resolver();
        let error = build(&resolver, temp.path(), "app").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("/app -> "), "{}", message);
        assert!(message.contains("/mid -> "), "{}", message);
        assert!(error.is_not_found());
    }

    #[test]
    fn test_named_reference_requires_registry() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "mappings": {"dep": "dep@1"}}"#,
        );
        let resolver = resolver();
        let error = build(&resolver, temp.path(), "app").unwrap_err();
        assert!(matches!(
            error.root_cause(),
            Error::ReferenceUnsupported { .. }
        ));

        write(
            temp.path(),
            "both/package.json",
            r#"{"pkglink": true, "registry": "npm", "catalog": "c", "mappings": {"dep": "dep@1"}}"#,
        );
        let error = build(&resolver, temp.path(), "both").unwrap_err();
        assert!(error.to_string().contains("not both"));
    }

    #[test]
    fn test_named_reference_selects_installed_version() {
        let temp = tempfile::tempdir().unwrap();
        for version in ["1.0.0", "1.2.0", "2.0.0"] {
            write(
                temp.path(),
                &format!("registry/dep/{}/package.json", version),
                &format!(r#"{{"pkglink": true, "version": "{}"}}"#, version),
            );
        }
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "mappings": {"dep": "dep@>=1.0.0 <2.0.0@local"}}"#,
        );

        let mut options = Options::default();
        options
            .registries
            .insert("local".to_string(), temp.path().join("registry"));
        let resolver =
            Resolver::with_collaborators(options, Arc::new(HostFs::new()), Arc::new(Offline));
        let graph = build(&resolver, temp.path(), "app").unwrap();
        let app = graph.main_package().unwrap();
        assert!(app.dependencies[0].ends_with("/registry/dep/1.2.0"));
    }

    fn registry_resolver(root: PathBuf) -> Resolver {
        let mut options = Options::default();
        options.registries.insert("local".to_string(), root);
        Resolver::with_collaborators(options, Arc::new(HostFs::new()), Arc::new(Offline))
    }

    #[test]
    fn test_named_reference_from_inside_archive() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "registry/dep/1.0.0/package.json",
            r#"{"pkglink": true}"#,
        );
        let manifest = br#"{"pkglink": true, "registry": "local", "mappings": {"dep": "dep@1.0.0"}}"#;
        fs::write(
            temp.path().join("app.zip"),
            zip_bytes(&[("package.json", manifest.as_slice())]),
        )
        .unwrap();

        let resolver = registry_resolver(temp.path().join("registry"));
        let graph = build(&resolver, temp.path(), "app.zip").unwrap();
        let dep = &graph.main_package().unwrap().dependencies[0];
        assert!(dep.starts_with("file://"), "{}", dep);
        assert!(dep.ends_with("/registry/dep/1.0.0"), "{}", dep);
        assert!(graph.packages.contains_key(dep));
    }

    #[test]
    fn test_relative_registry_root_ignores_requester() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "registry/dep/1.0.0/package.json",
            r#"{"pkglink": true}"#,
        );
        write(
            temp.path(),
            "work/app/package.json",
            r#"{"pkglink": true, "registry": "local", "mappings": {"dep": "dep@1"}}"#,
        );

        // The registry root is relative to the process working directory.
        let cwd = std::env::current_dir().unwrap();
        let registry = fs::canonicalize(temp.path().join("registry")).unwrap();
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        relative.push(registry.strip_prefix("/").unwrap());

        let resolver = registry_resolver(relative);
        let graph = build(&resolver, &temp.path().join("work"), "app").unwrap();
        let dep = &graph.main_package().unwrap().dependencies[0];
        assert_eq!(*dep, crate::vfs::file_href(&registry.join("dep/1.0.0")).unwrap());
    }

    #[test]
    fn test_unknown_capability() {
        let temp = tempfile::tempdir().unwrap();
        let resolver = resolver();
        let error = build(&resolver, temp.path(), "app").unwrap_err();
        assert!(error.is_not_found());

        let base = resolver.vfs().directory(temp.path()).unwrap();
        let error = resolver
            .build_from(&Reference::Capability("nope@1".to_string()), &base)
            .unwrap_err();
        assert!(matches!(error, Error::ReferenceUnsupported { .. }));
    }
}
