//! Stage 1: Package Info
//!
//! Loads what one package says about itself, without following any of its
//! dependencies.
//!
//! ## Process
//!
//! 1.  **Manifest**: read from the package root and normalized by
//!     [`Manifest::load`].
//!
//! 2.  **Roots**: the ordered override directories from
//!     [`Options::roots`](crate::config::Options::roots). Earlier roots are
//!     more specific and win every collision.
//!
//! 3.  **Election**: every file below `<root>/lib` becomes a candidate for
//!     the module id formed by stripping its extension. Explicit `main` and
//!     `modules` entries are candidates too, ahead of any root. For each id
//!     the first extension in language priority order that has a candidate
//!     wins; when an id had several candidates a warning names them all.
//!
//! 4.  **Resources**: each declared resource is probed in every root. A
//!     directory contributes its files as `<resource>/<path>`, a file
//!     contributes itself as `<resource>`.
//!
//! Includes and mappings are kept as unresolved references; the graph
//! stage follows them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use super::{ModuleDescriptor, ResourceDescriptor, Resolver};
use crate::error::{Error, Result};
use crate::filesystem::{extension, slash_path, FileKind, FileSystem};
use crate::manifest::{Language, Manifest};
use crate::reference::Reference;
use crate::vfs::VfsNode;

/// What a package declares about itself.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub href: String,
    pub location: VfsNode,
    pub manifest: Arc<Manifest>,
    /// Elected modules of this package alone.
    pub library: BTreeMap<String, ModuleDescriptor>,
    /// Resources of this package alone.
    pub resources: BTreeMap<String, ResourceDescriptor>,
    pub includes: Vec<Reference>,
    pub mappings: BTreeMap<String, Reference>,
}

/// An election candidate.
struct Candidate {
    path: PathBuf,
}

impl Resolver {
    /// Loads the info of the package at `location`, memoized by canonical
    /// href.
    pub fn package_info(&self, location: &VfsNode) -> Result<Arc<PackageInfo>> {
        self.infos.get_or_settle(location.href.clone(), || {
            debug!("Loading package info for {}", location.href);
            self.load_info(location).map(Arc::new)
        })
    }

    fn load_info(&self, location: &VfsNode) -> Result<PackageInfo> {
        let fs = location.mount();
        let manifest_path = Path::new(&self.options.manifest);
        let bytes = fs.read(manifest_path).map_err(|error| match error {
            Error::NotFound { .. } => Error::NotFound {
                href: location.href.clone(),
                message: format!("Can't read {}", self.options.manifest),
            },
            other => other,
        })?;
        let manifest = Manifest::load(&bytes, &location.href, &self.options.variants)?;

        let roots = self.options.roots();
        let library = self.elect_modules(location, &fs, &manifest, &roots)?;
        let resources = collect_resources(&fs, &manifest, &roots)?;

        Ok(PackageInfo {
            href: location.href.clone(),
            location: location.clone(),
            includes: manifest.includes.clone(),
            mappings: manifest.mappings.clone(),
            manifest: Arc::new(manifest),
            library,
            resources,
        })
    }

    /// Extensions in election priority order, with the language each one
    /// is compiled from.
    fn language_priority(&self, manifest: &Manifest) -> Vec<(String, Option<Language>)> {
        let mut priority: Vec<(String, Option<Language>)> = manifest
            .languages
            .iter()
            .map(|language| (language.extension.clone(), Some(language.clone())))
            .collect();
        for implicit in [String::new(), self.options.native_extension.clone()] {
            if !priority.iter().any(|(extension, _)| *extension == implicit) {
                priority.push((implicit, None));
            }
        }
        priority
    }

    fn elect_modules(
        &self,
        location: &VfsNode,
        fs: &Arc<dyn FileSystem>,
        manifest: &Manifest,
        roots: &[PathBuf],
    ) -> Result<BTreeMap<String, ModuleDescriptor>> {
        let mut tree: BTreeMap<String, BTreeMap<String, Candidate>> = BTreeMap::new();

        let mut explicit = manifest.modules.clone();
        if let Some(main) = &manifest.main {
            explicit.insert(String::new(), main.clone());
        }
        for (id, path) in explicit {
            let mut path = path.trim_start_matches("./").to_string();
            if extension(&path).is_empty() {
                path.push_str(&self.options.native_extension);
            }
            let candidates = tree.entry(id).or_default();
            candidates
                .entry(extension(&path).to_string())
                .or_insert(Candidate {
                    path: PathBuf::from(path),
                });
        }

        let lib = manifest.directory("lib");
        for root in roots {
            let directory = root.join(lib);
            if !fs.is_directory(&directory)? {
                continue;
            }
            for file in fs.list_files(&directory)? {
                let relative = slash_path(&file);
                let suffix = extension(&relative);
                let id = relative[..relative.len() - suffix.len()].to_string();
                tree.entry(id)
                    .or_default()
                    .entry(suffix.to_string())
                    .or_insert(Candidate {
                        path: directory.join(&file),
                    });
            }
        }

        let priority = self.language_priority(manifest);
        let mut library = BTreeMap::new();
        for (id, candidates) in tree {
            let elected = priority
                .iter()
                .find_map(|(suffix, language)| {
                    candidates.get(suffix).map(|candidate| (candidate, language))
                });
            let (candidate, language) = match elected {
                Some(elected) => elected,
                None => continue,
            };
            if candidates.len() > 1 {
                let discarded: Vec<String> = candidates
                    .values()
                    .filter(|other| other.path != candidate.path)
                    .map(|other| slash_path(&other.path))
                    .collect();
                self.warn(
                    &location.href,
                    format!(
                        "Multiple candidates for module {:?}: chose {:?}, discarded {:?}",
                        id,
                        slash_path(&candidate.path),
                        discarded
                    ),
                )?;
            }
            library.insert(
                id,
                ModuleDescriptor::file(
                    Arc::clone(fs),
                    candidate.path.clone(),
                    location.href_of(&candidate.path),
                    location.path.join(&candidate.path),
                    language.clone(),
                ),
            );
        }
        Ok(library)
    }
}

fn collect_resources(
    fs: &Arc<dyn FileSystem>,
    manifest: &Manifest,
    roots: &[PathBuf],
) -> Result<BTreeMap<String, ResourceDescriptor>> {
    let mut resources = BTreeMap::new();
    for resource in &manifest.resources {
        let name = resource.trim_matches('/');
        for root in roots {
            let path = root.join(name);
            match fs.stat(&path)? {
                Some(FileKind::Directory) => {
                    for file in fs.list_files(&path)? {
                        let key = format!("{}/{}", name, slash_path(&file));
                        resources
                            .entry(key)
                            .or_insert_with(|| ResourceDescriptor::new(Arc::clone(fs), path.join(&file)));
                    }
                }
                Some(FileKind::File) => {
                    resources
                        .entry(name.to_string())
                        .or_insert_with(|| ResourceDescriptor::new(Arc::clone(fs), path.clone()));
                }
                None => {}
            }
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::filesystem::HostFs;
    use crate::linkage::ModuleSource;
    use crate::network::Offline;
    use std::fs;

    fn write(root: &Path, path: &str, content: &str) {
        let file = root.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, content).unwrap();
    }

    fn resolver(options: Options) -> Resolver {
        Resolver::with_collaborators(options, Arc::new(HostFs::new()), Arc::new(Offline))
    }

    fn info(resolver: &Resolver, root: &Path) -> Arc<PackageInfo> {
        let base = resolver.vfs().directory(root).unwrap();
        resolver.package_info(&base).unwrap()
    }

    fn path_of(info: &PackageInfo, id: &str) -> String {
        match &info.library[id].source {
            ModuleSource::File { path, .. } => slash_path(path),
            other => panic!("unexpected module {:?}", other),
        }
    }

    #[test]
    fn test_compiled_language_wins_election() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"pkglink": true, "languages": {".yaml": "./compiler"}}"#,
        );
        write(temp.path(), "lib/foo.yaml", "a: 1");
        write(temp.path(), "lib/foo.json", "{}");
        write(temp.path(), "lib/bar.json", "{}");

        testing_logger::setup();
        let resolver = resolver(Options::default());
        let info = info(&resolver, temp.path());

        assert_eq!(path_of(&info, "foo"), "lib/foo.yaml");
        assert_eq!(
            info.library["foo"].language().unwrap().extension,
            ".yaml"
        );
        assert!(info.library["bar"].language().is_none());

        let warnings = resolver.warnings().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("\"foo\""));
        assert!(warnings[0].message.contains("lib/foo.json"));
        testing_logger::validate(|captured| {
            assert!(captured
                .iter()
                .any(|line| line.level == log::Level::Warn && line.body.contains("\"foo\"")));
        });
    }

    #[test]
    fn test_unextended_beats_native() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "package.json", r#"{"pkglink": true}"#);
        write(temp.path(), "lib/a", "{}");
        write(temp.path(), "lib/a.json", "{}");
        write(temp.path(), "lib/notes.txt", "ignored");

        let resolver = resolver(Options::default());
        let info = info(&resolver, temp.path());

        assert_eq!(path_of(&info, "a"), "lib/a");
        assert!(!info.library.contains_key("notes"));
    }

    #[test]
    fn test_main_and_modules_entries() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"pkglink": true, "main": "./entry", "modules": {"tools": "bin/tools.json"}}"#,
        );
        write(temp.path(), "entry.json", "{}");
        write(temp.path(), "bin/tools.json", "{}");

        let resolver = resolver(Options::default());
        let info = info(&resolver, temp.path());

        assert_eq!(path_of(&info, ""), "entry.json");
        assert_eq!(path_of(&info, "tools"), "bin/tools.json");
    }

    #[test]
    fn test_variant_and_debug_roots_override() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"pkglink": true, "directories": {"lib": "src"}, "resources": ["data"]}"#,
        );
        write(temp.path(), "src/a.json", "{}");
        write(temp.path(), "src/b.json", "{}");
        write(temp.path(), "src/c.json", "{}");
        write(temp.path(), "variants/web/src/a.json", "{}");
        write(temp.path(), "debug/src/b.json", "{}");
        write(temp.path(), "data/x.txt", "base");
        write(temp.path(), "variants/web/data/x.txt", "web");
        write(temp.path(), "data/y.txt", "y");

        let options = Options {
            variants: vec!["web".to_string()],
            debug: true,
            ..Options::default()
        };
        let resolver = resolver(options);
        let info = info(&resolver, temp.path());

        assert_eq!(path_of(&info, "a"), "variants/web/src/a.json");
        assert_eq!(path_of(&info, "b"), "debug/src/b.json");
        assert_eq!(path_of(&info, "c"), "src/c.json");
        assert_eq!(
            slash_path(&info.resources["data/x.txt"].path),
            "variants/web/data/x.txt"
        );
        assert_eq!(slash_path(&info.resources["data/y.txt"].path), "data/y.txt");
        assert!(resolver.warnings().unwrap().is_empty());
    }

    #[test]
    fn test_file_resource() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"pkglink": true, "resources": ["README", "missing"]}"#,
        );
        write(temp.path(), "README", "read me");

        let resolver = resolver(Options::default());
        let info = info(&resolver, temp.path());

        assert_eq!(info.resources.keys().collect::<Vec<_>>(), vec!["README"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_modules_are_elected() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "package.json", r#"{"pkglink": true}"#);
        write(temp.path(), "lib/plain.json", "1");
        write(temp.path(), "shared/util.json", "2");
        write(temp.path(), "shared/nested/deep.json", "3");
        std::os::unix::fs::symlink("../shared/util.json", temp.path().join("lib/util.json"))
            .unwrap();
        std::os::unix::fs::symlink("../shared/nested", temp.path().join("lib/linked")).unwrap();

        let resolver = resolver(Options::default());
        let info = info(&resolver, temp.path());

        assert_eq!(
            info.library.keys().collect::<Vec<_>>(),
            vec!["linked/deep", "plain", "util"]
        );
        assert!(path_of(&info, "util").ends_with("lib/util.json"));
    }

    #[test]
    fn test_info_is_memoized() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "package.json", r#"{"pkglink": true}"#);

        let resolver = resolver(Options::default());
        let first = info(&resolver, temp.path());
        let second = info(&resolver, temp.path());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let resolver = resolver(Options::default());
        let base = resolver.vfs().directory(temp.path()).unwrap();
        let error = resolver.package_info(&base).unwrap_err();
        assert!(error.is_not_found());
        assert!(error.to_string().contains("Can't read package.json"));
    }
}
