//! Stage 3: Read and Compile
//!
//! Attaches content to a built [`LinkageGraph`] so it can be hashed and
//! linked.
//!
//! ## Process
//!
//! 1.  **Reading (`read`)**: every source-file module and resource gets its
//!     raw bytes, packages in parallel. Descriptors that already carry
//!     content are left alone, so reading twice is harmless.
//!
//! 2.  **Compiling (`compile`)**: every source-file module gets native
//!     source text. Modules without a declared language are taken as UTF-8
//!     text. Modules in a declared language name a compiler package; that
//!     package is built, read, compiled and linked as a graph of its own,
//!     its main module is executed, and the `compiler` name it exports
//!     selects one of the linker's host compilers.

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use super::{LinkageGraph, ModuleSource, PackageNode, Resolver};
use crate::cache::Memo;
use crate::error::{Error, Result};
use crate::manifest::Language;
use crate::runtime::{Compiler, Linker};
use crate::vfs::VfsNode;

/// Reads every unread source-file module and resource of `graph`.
pub fn read(graph: &mut LinkageGraph) -> Result<()> {
    graph
        .packages
        .par_iter_mut()
        .try_for_each(|(href, package)| read_package(package).map_err(|error| error.within(href)))
}

fn read_package(package: &mut PackageNode) -> Result<()> {
    for module in package.library.values_mut() {
        if module.content.is_some() {
            continue;
        }
        if let ModuleSource::File { fs, path, .. } = &module.source {
            module.content = Some(fs.read(path)?);
        }
    }
    for resource in package.resources.values_mut() {
        if resource.content.is_none() {
            resource.content = Some(resource.fs.read(&resource.path)?);
        }
    }
    Ok(())
}

/// Attaches native source text to every source-file module of `graph`.
///
/// The graph must have been read. Compiler packages are resolved through
/// `resolver`, so they share its memo tables with the graph itself.
pub fn compile(graph: &mut LinkageGraph, resolver: &Resolver, linker: &Linker) -> Result<()> {
    Compilation {
        resolver,
        linker,
        compilers: Memo::new(),
        chain: Vec::new(),
    }
    .run(graph)
}

struct Compilation<'a> {
    resolver: &'a Resolver,
    linker: &'a Linker,
    /// Host compilers keyed by requiring package and compiler reference.
    compilers: Memo<String, Arc<dyn Compiler>>,
    /// Compiler keys being resolved by the enclosing compilations.
    chain: Vec<String>,
}

impl Compilation<'_> {
    fn run(&self, graph: &mut LinkageGraph) -> Result<()> {
        graph
            .packages
            .par_iter_mut()
            .try_for_each(|(href, package)| self.compile_package(href, package))
    }

    fn compile_package(&self, href: &str, package: &mut PackageNode) -> Result<()> {
        let location = package.location.clone();
        for (id, module) in package.library.iter_mut() {
            if module.native.is_some() {
                continue;
            }
            let ModuleSource::File {
                href: file,
                language,
                ..
            } = &module.source
            else {
                continue;
            };
            let content = module.content.as_deref().ok_or_else(|| Error::NotRead {
                href: href.to_string(),
                path: file.clone(),
            })?;
            let compile_error = |message: String| Error::Compile {
                href: href.to_string(),
                id: id.clone(),
                message,
            };
            let source = std::str::from_utf8(content)
                .map_err(|error| compile_error(format!("source is not UTF-8: {}", error)))?;
            let native = match language {
                None => source.to_string(),
                Some(language) => {
                    let compiler = self
                        .compiler(href, location.as_ref(), language)
                        .map_err(|error| compile_error(error.to_string()))?;
                    debug!("Compiling {} with {}", file, compiler.name());
                    compiler.compile(source).map_err(compile_error)?
                }
            };
            module.native = Some(native);
        }
        Ok(())
    }

    fn compiler(
        &self,
        href: &str,
        location: Option<&VfsNode>,
        language: &Language,
    ) -> Result<Arc<dyn Compiler>> {
        let reference = language.compiler.as_ref().ok_or_else(|| Error::ManifestInvalid {
            href: href.to_string(),
            message: format!("language {} has no compiler", language.extension),
            hint: None,
        })?;
        let key = format!("{}|{}", href, reference);
        if self.chain.contains(&key) {
            return Err(Error::Evaluation {
                id: reference.to_string(),
                message: "compiler package requires itself to compile".to_string(),
            });
        }

        self.compilers.get_or_settle(key.clone(), || {
            let base = match location {
                Some(location) => location.clone(),
                None => self.resolver.vfs().working_directory()?,
            };
            let mut graph = self.resolver.build_from(reference, &base)?;
            read(&mut graph)?;
            let mut chain = self.chain.clone();
            chain.push(key.clone());
            Compilation {
                resolver: self.resolver,
                linker: self.linker,
                compilers: Memo::new(),
                chain,
            }
            .run(&mut graph)?;

            let exports = self.linker.link(&graph)?.exec("")?;
            let name = exports
                .get("compiler")
                .and_then(|name| name.as_str())
                .ok_or_else(|| Error::Evaluation {
                    id: graph.main.clone(),
                    message: "compiler package exports no compiler name".to_string(),
                })?;
            self.linker.compiler(name).ok_or_else(|| Error::Evaluation {
                id: graph.main.clone(),
                message: format!("no host compiler named {:?}", name),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::filesystem::HostFs;
    use crate::network::Offline;
    use crate::reference::Reference;
    use serde_json::json;
    use std::fs;
    use std::path::Path;

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

    fn build(resolver: &Resolver, root: &Path, reference: &str) -> LinkageGraph {
        let base = resolver.vfs().directory(root).unwrap();
        resolver
            .build_from(&Reference::parse(reference), &base)
            .unwrap()
    }

    fn yaml_package(root: &Path) {
        write(
            root,
            "app/package.json",
            r#"{"pkglink": true, "main": "lib/index.yaml", "languages": {".yaml": "../yaml"}}"#,
        );
        write(root, "app/lib/index.yaml", "greeting: hello\nitems: [1, 2]\n");
        write(root, "app/lib/plain.json", r#"{"plain": true}"#);
        write(root, "yaml/package.json", r#"{"pkglink": true, "main": "lib/index"}"#);
        write(root, "yaml/lib/index.json", r#"{"compiler": "yaml"}"#);
    }

    #[test]
    fn test_read_attaches_content_once() {
        let temp = tempfile::tempdir().unwrap();
        write(
            temp.path(),
            "app/package.json",
            r#"{"pkglink": true, "resources": ["data"]}"#,
        );
        write(temp.path(), "app/lib/a.json", "1");
        write(temp.path(), "app/data/x.txt", "x");

        let resolver = resolver();
        let mut graph = build(&resolver, temp.path(), "app");
        read(&mut graph).unwrap();
        let app = graph.main_package().unwrap();
        assert_eq!(app.library["a"].content.as_deref(), Some(&b"1"[..]));
        assert_eq!(app.resources["data/x.txt"].content.as_deref(), Some(&b"x"[..]));

        fs::remove_file(temp.path().join("app/lib/a.json")).unwrap();
        read(&mut graph).unwrap();
    }

    #[test]
    fn test_compile_plain_and_declared_languages() {
        let temp = tempfile::tempdir().unwrap();
        yaml_package(temp.path());

        let resolver = resolver();
        let linker = Linker::default();
        let mut graph = build(&resolver, temp.path(), "app");
        read(&mut graph).unwrap();
        compile(&mut graph, &resolver, &linker).unwrap();

        let app = graph.main_package().unwrap();
        assert_eq!(app.library["plain"].native.as_deref(), Some(r#"{"plain": true}"#));
        let native: serde_json::Value =
            serde_json::from_str(app.library[""].native.as_deref().unwrap()).unwrap();
        assert_eq!(native, json!({"greeting": "hello", "items": [1, 2]}));
        assert_eq!(
            linker.link(&graph).unwrap().exec("").unwrap(),
            json!({"greeting": "hello", "items": [1, 2]})
        );
    }

    #[test]
    fn test_compile_requires_read() {
        let temp = tempfile::tempdir().unwrap();
        yaml_package(temp.path());

        let resolver = resolver();
        let mut graph = build(&resolver, temp.path(), "app");
        assert!(matches!(
            compile(&mut graph, &resolver, &Linker::default()).unwrap_err(),
            Error::NotRead { .. }
        ));
    }

    #[test]
    fn test_unknown_host_compiler_is_a_compile_error() {
        let temp = tempfile::tempdir().unwrap();
        yaml_package(temp.path());
        write(temp.path(), "yaml/lib/index.json", r#"{"compiler": "coffee"}"#);

        let resolver = resolver();
        let mut graph = build(&resolver, temp.path(), "app");
        read(&mut graph).unwrap();
        let error = compile(&mut graph, &resolver, &Linker::default()).unwrap_err();
        assert!(matches!(error, Error::Compile { ref id, .. } if id.is_empty()));
        assert!(error.to_string().contains("coffee"));
    }

    #[test]
    fn test_malformed_source_is_a_compile_error() {
        let temp = tempfile::tempdir().unwrap();
        yaml_package(temp.path());
        write(temp.path(), "app/lib/index.yaml", "greeting: [unclosed\n");

        let resolver = resolver();
        let mut graph = build(&resolver, temp.path(), "app");
        read(&mut graph).unwrap();
        assert!(matches!(
            compile(&mut graph, &resolver, &Linker::default()).unwrap_err(),
            Error::Compile { .. }
        ));
    }
}
