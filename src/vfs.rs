//! # Virtual Filesystem Resolver
//!
//! Resolves any location string to a [`VfsNode`]: a filesystem, a base path
//! inside it, and a canonical href. Locations may be
//!
//! - local paths, absolute or relative to the requesting node;
//! - `file:` URLs;
//! - `http:`/`https:` URLs to archives;
//! - any of the above followed by a `#` fragment chain that walks into
//!   archives nested inside archives (`outer.zip#inner.zip#pkg`).
//!
//! Directories are served straight from the filesystem that contains them.
//! Archive files, local or remote, are unpacked into a [`MemoryFS`] rooted at
//! the archive's top directory.
//!
//! Canonical hrefs are derived from canonical paths only, so every spelling
//! of a location converges on one href, and that href keys the memo table.
//! The root of an archive is spelled without a fragment, which makes
//! `pkg.zip`, `pkg.zip#` and `pkg.zip#/` the same node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use url::Url;

use crate::archive;
use crate::cache::Memo;
use crate::error::{Error, Result};
use crate::filesystem::{slash_path, FileKind, FileSystem, HostFs, MemoryFS, RootFs};
use crate::network::Network;

/// A resolved location.
#[derive(Debug, Clone)]
pub struct VfsNode {
    /// The filesystem holding the location.
    pub fs: Arc<dyn FileSystem>,
    /// The location's path inside `fs`.
    pub path: PathBuf,
    /// The canonical href of the location.
    pub href: String,
    /// The href of the archive `fs` was unpacked from; `None` for the host.
    pub container: Option<String>,
}

impl VfsNode {
    /// A sub-filesystem rooted at this node's path.
    pub fn mount(&self) -> Arc<dyn FileSystem> {
        if self.path.as_os_str().is_empty() {
            Arc::clone(&self.fs)
        } else {
            Arc::new(RootFs::new(Arc::clone(&self.fs), self.path.clone()))
        }
    }

    /// Whether two nodes share the same underlying filesystem object.
    pub fn same_filesystem(&self, other: &VfsNode) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.fs), Arc::as_ptr(&other.fs))
    }

    /// The href of a path below this node.
    pub fn href_of(&self, relative: &Path) -> String {
        let relative = slash_path(relative);
        if relative.is_empty() {
            self.href.clone()
        } else if self.container.as_deref() == Some(self.href.as_str()) {
            format!("{}#/{}", self.href, relative)
        } else {
            format!("{}/{}", self.href.trim_end_matches('/'), relative)
        }
    }
}

/// The resolver and its memo of canonical href -> node.
#[derive(Debug)]
pub struct Vfs {
    host: Arc<dyn FileSystem>,
    network: Arc<dyn Network>,
    archive_extensions: Vec<String>,
    memo: Memo<String, VfsNode>,
}

enum Target {
    Local { fs: Arc<dyn FileSystem>, path: PathBuf, container: Option<String> },
    Remote(Url),
}

impl Vfs {
    pub fn new(
        host: Arc<dyn FileSystem>,
        network: Arc<dyn Network>,
        archive_extensions: Vec<String>,
    ) -> Self {
        Self {
            host,
            network,
            archive_extensions,
            memo: Memo::new(),
        }
    }

    /// The host filesystem.
    pub fn host(&self) -> &Arc<dyn FileSystem> {
        &self.host
    }

    /// A node for a directory on the host filesystem, used as the base for
    /// top-level references.
    pub fn directory(&self, path: &Path) -> Result<VfsNode> {
        let canonical = self.host.canonical(path)?;
        Ok(VfsNode {
            fs: Arc::clone(&self.host),
            href: file_href(&canonical)?,
            path: canonical,
            container: None,
        })
    }

    /// A node for the process working directory.
    pub fn working_directory(&self) -> Result<VfsNode> {
        self.directory(&std::env::current_dir()?)
    }

    /// Resolves `reference` relative to `base`.
    pub fn resolve(&self, reference: &str, base: &VfsNode) -> Result<VfsNode> {
        let (head, fragment) = match reference.split_once('#') {
            Some((head, fragment)) => (head, Some(fragment)),
            None => (reference, None),
        };

        let node = if head.is_empty() {
            base.clone()
        } else {
            let target = self.target(head, base)?;
            let href = self.canonical_href(&target)?;
            debug!("Resolved {:?} to {}", head, href);
            let settled_href = href.clone();
            self.memo
                .get_or_settle(href, || self.fetch(target, settled_href))?
        };

        match fragment {
            Some(fragment) if !fragment.trim_matches('/').is_empty() => {
                self.resolve(fragment, &node)
            }
            _ => Ok(node),
        }
    }

    fn target(&self, head: &str, base: &VfsNode) -> Result<Target> {
        match scheme_of(head) {
            None => {
                let joined = base.path.join(head);
                let path = base.fs.canonical(&joined).map_err(|error| match error {
                    Error::NotFound { .. } => Error::NotFound {
                        href: base.href_of(Path::new(head)),
                        message: "no such file or directory".to_string(),
                    },
                    other => other,
                })?;
                Ok(Target::Local {
                    fs: Arc::clone(&base.fs),
                    path,
                    container: base.container.clone(),
                })
            }
            Some("file") => {
                let url = Url::parse(head)?;
                let path = url.to_file_path().map_err(|_| Error::ReferenceUnsupported {
                    reference: head.to_string(),
                    message: "file URL does not name a local path".to_string(),
                })?;
                Ok(Target::Local {
                    fs: Arc::clone(&self.host),
                    path: self.host.canonical(&path)?,
                    container: None,
                })
            }
            Some(scheme) if self.network.supports(scheme) => {
                let url = match Url::parse(&base.href) {
                    Ok(base_url) if self.network.supports(base_url.scheme()) => {
                        base_url.join(head)?
                    }
                    _ => Url::parse(head)?,
                };
                Ok(Target::Remote(url))
            }
            Some(scheme) => Err(Error::ReferenceUnsupported {
                reference: head.to_string(),
                message: format!("Cannot fetch over protocol {}:", scheme),
            }),
        }
    }

    fn canonical_href(&self, target: &Target) -> Result<String> {
        match target {
            Target::Local {
                path,
                container: None,
                ..
            } => file_href(path),
            Target::Local {
                path,
                container: Some(container),
                ..
            } => {
                let relative = slash_path(path);
                if relative.is_empty() {
                    Ok(container.clone())
                } else {
                    Ok(format!("{}#/{}", container, relative))
                }
            }
            Target::Remote(url) => Ok(url.to_string()),
        }
    }

    fn fetch(&self, target: Target, href: String) -> Result<VfsNode> {
        match target {
            Target::Local {
                fs,
                path,
                container,
            } => match fs.stat(&path)? {
                Some(FileKind::Directory) => Ok(VfsNode {
                    fs,
                    path,
                    href,
                    container,
                }),
                Some(FileKind::File) => {
                    if !archive::is_archive(&slash_path(&path), &self.archive_extensions) {
                        return Err(Error::Archive {
                            href,
                            message: "not a directory or a recognized archive".to_string(),
                        });
                    }
                    debug!("Reading archive {}", href);
                    let bytes = fs.read(&path)?;
                    self.unpacked(&bytes, href)
                }
                None => Err(Error::NotFound {
                    href,
                    message: "no such file or directory".to_string(),
                }),
            },
            Target::Remote(url) => {
                debug!("Fetching archive {}", url);
                let bytes = self.network.fetch(url.as_str())?;
                self.unpacked(&bytes, href)
            }
        }
    }

    fn unpacked(&self, bytes: &[u8], href: String) -> Result<VfsNode> {
        let fs: MemoryFS = archive::unpack(bytes, &href)?;
        Ok(VfsNode {
            fs: Arc::new(fs),
            path: PathBuf::new(),
            container: Some(href.clone()),
            href,
        })
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new(
            Arc::new(HostFs::new()),
            Arc::new(crate::network::HttpNetwork::new()),
            vec![".zip".to_string()],
        )
    }
}

/// The `file:` href of an absolute host path.
pub fn file_href(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| Error::Filesystem {
            message: format!("{} is not an absolute path", path.display()),
        })
}

/// The URL scheme of `location`, if it has one.
///
/// Single-letter schemes are Windows drive letters, not schemes.
fn scheme_of(location: &str) -> Option<&str> {
    let (scheme, _) = location.split_once(':')?;
    let valid = scheme.len() > 1
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use crate::network::Offline;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MockNetwork {
        bodies: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl Network for MockNetwork {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(url.to_string());
            self.bodies.get(url).cloned().ok_or_else(|| Error::NotFound {
                href: url.to_string(),
                message: "404".to_string(),
            })
        }

        fn supports(&self, scheme: &str) -> bool {
            scheme == "http"
        }
    }

    /// Counts reads of archive files on the host.
    #[derive(Debug)]
    struct CountingFs {
        inner: HostFs,
        reads: AtomicUsize,
    }

    impl FileSystem for CountingFs {
        fn canonical(&self, path: &Path) -> Result<PathBuf> {
            self.inner.canonical(path)
        }
        fn stat(&self, path: &Path) -> Result<Option<FileKind>> {
            self.inner.stat(path)
        }
        fn read(&self, path: &Path) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.inner.read(path)
        }
        fn list(&self, path: &Path) -> Result<Vec<String>> {
            self.inner.list(path)
        }
        fn list_tree(&self, path: &Path) -> Result<Vec<PathBuf>> {
            self.inner.list_tree(path)
        }
    }

    const PACKAGE: &[(&str, &[u8])] = &[
        ("package.json", b"{}\n"),
        ("a/A", b"a"),
        ("b/B", b"b"),
        ("c/C", b"c"),
    ];

    fn fixture() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("package.1");
        for (path, content) in PACKAGE {
            let file = root.join(path);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, content).unwrap();
        }
        std::fs::write(temp.path().join("archive.zip"), zip_bytes(PACKAGE)).unwrap();
        let archive = zip_bytes(PACKAGE);
        let nested = zip_bytes(&[("package.1.zip", archive.as_slice())]);
        std::fs::write(temp.path().join("nested.zip"), nested).unwrap();
        std::fs::write(temp.path().join("plain.txt"), "text").unwrap();
        temp
    }

    fn vfs() -> Vfs {
        Vfs::new(
            Arc::new(HostFs::new()),
            Arc::new(Offline),
            vec![".zip".to_string()],
        )
    }

    fn listing(node: &VfsNode) -> (Vec<String>, Vec<String>, Vec<u8>) {
        let fs = node.mount();
        let list = fs.list(Path::new("")).unwrap();
        let tree = fs
            .list_tree(Path::new(""))
            .unwrap()
            .iter()
            .map(|p| slash_path(p))
            .collect();
        let read = fs.read(Path::new("package.json")).unwrap();
        (list, tree, read)
    }

    #[test]
    fn test_canonical_convergence() {
        let temp = fixture();
        let vfs = vfs();
        let base = vfs.directory(temp.path()).unwrap();

        let relative = vfs.resolve("package.1", &base).unwrap();
        let dotted = vfs.resolve("./package.1/a/..", &base).unwrap();
        let absolute = vfs
            .resolve(temp.path().join("package.1").to_str().unwrap(), &base)
            .unwrap();
        let url = vfs.resolve(&relative.href, &base).unwrap();

        assert_eq!(relative.href, dotted.href);
        assert_eq!(relative.href, absolute.href);
        assert_eq!(relative.href, url.href);
        assert!(relative.href.starts_with("file:///"));
    }

    #[test]
    fn test_archive_transparency() {
        let temp = fixture();
        let vfs = vfs();
        let base = vfs.directory(temp.path()).unwrap();

        let directory = listing(&vfs.resolve("package.1", &base).unwrap());
        for spelling in ["archive.zip", "archive.zip#", "archive.zip#/"] {
            let node = vfs.resolve(spelling, &base).unwrap();
            assert_eq!(listing(&node), directory, "{}", spelling);
        }
        assert_eq!(directory.0, vec!["a", "b", "c", "package.json"]);
    }

    #[test]
    fn test_archive_spellings_share_one_node() {
        let temp = fixture();
        let vfs = vfs();
        let base = vfs.directory(temp.path()).unwrap();

        let plain = vfs.resolve("archive.zip", &base).unwrap();
        let hashed = vfs.resolve("archive.zip#/", &base).unwrap();
        assert_eq!(plain.href, hashed.href);
        assert!(plain.same_filesystem(&hashed));
    }

    #[test]
    fn test_fragment_chaining() {
        let temp = fixture();
        let vfs = vfs();
        let base = vfs.directory(temp.path()).unwrap();

        let inner = vfs.resolve("nested.zip#package.1.zip", &base).unwrap();
        assert!(inner.href.ends_with("nested.zip#/package.1.zip"));
        let (list, _, read) = listing(&inner);
        assert_eq!(list, vec!["a", "b", "c", "package.json"]);
        assert_eq!(read, b"{}\n");

        let directory = vfs.resolve("nested.zip#package.1.zip#a", &base).unwrap();
        assert!(directory.href.ends_with("nested.zip#/package.1.zip#/a"));
        assert_eq!(directory.mount().list(Path::new("")).unwrap(), vec!["A"]);
    }

    #[test]
    fn test_remote_fragment_chaining() {
        let archive = zip_bytes(PACKAGE);
        let nested = zip_bytes(&[("package.1.zip", archive.as_slice())]);
        let mut network = MockNetwork::default();
        network
            .bodies
            .insert("http://example.com/nested.zip".to_string(), nested);
        let network = Arc::new(network);
        let vfs = Vfs::new(
            Arc::new(HostFs::new()),
            network.clone(),
            vec![".zip".to_string()],
        );
        let base = vfs.working_directory().unwrap();

        let inner = vfs
            .resolve("http://example.com/nested.zip#package.1.zip", &base)
            .unwrap();
        assert_eq!(
            inner.href,
            "http://example.com/nested.zip#/package.1.zip"
        );
        assert_eq!(
            inner.mount().read(Path::new("a/A")).unwrap(),
            b"a".to_vec()
        );

        vfs.resolve("http://example.com/nested.zip#/", &base)
            .unwrap();
        assert_eq!(network.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failures() {
        let temp = fixture();
        let vfs = vfs();
        let base = vfs.directory(temp.path()).unwrap();

        assert!(vfs.resolve("missing", &base).unwrap_err().is_not_found());
        assert!(matches!(
            vfs.resolve("plain.txt", &base).unwrap_err().root_cause(),
            Error::Archive { .. }
        ));
        assert!(matches!(
            vfs.resolve("ftp://example.com/a.zip", &base).unwrap_err(),
            Error::ReferenceUnsupported { .. }
        ));
        assert!(matches!(
            vfs.resolve("archive.zip#missing", &base).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_concurrent_requests_read_once() {
        let temp = fixture();
        let host = Arc::new(CountingFs {
            inner: HostFs::new(),
            reads: AtomicUsize::new(0),
        });
        let vfs = Arc::new(Vfs::new(
            host.clone(),
            Arc::new(Offline),
            vec![".zip".to_string()],
        ));
        let base = vfs.directory(temp.path()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vfs = Arc::clone(&vfs);
                let base = base.clone();
                std::thread::spawn(move || vfs.resolve("archive.zip", &base).unwrap().href)
            })
            .collect();
        let hrefs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(hrefs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(host.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("http://x"), Some("http"));
        assert_eq!(scheme_of("file:/x"), Some("file"));
        assert_eq!(scheme_of("C:\\x"), None);
        assert_eq!(scheme_of("./a"), None);
    }
}
