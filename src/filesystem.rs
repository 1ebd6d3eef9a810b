//! Filesystem collaborators: the host disk, in-memory trees unpacked from
//! archives, and rooted sub-views of either.
//!
//! Every filesystem speaks in `/`-separated paths. Paths handed to a
//! [`MemoryFS`] or a [`RootFs`] are relative to that filesystem's root; a
//! leading `/` is accepted and ignored. [`HostFs`] accepts absolute paths or
//! paths relative to the process working directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// The kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Operations the resolver needs from a filesystem.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Resolves `.`/`..` (and symlinks, where the filesystem has them) to the
    /// canonical form of an existing path.
    fn canonical(&self, path: &Path) -> Result<PathBuf>;

    /// Returns the kind of the entry at `path`, or `None` when it is missing.
    fn stat(&self, path: &Path) -> Result<Option<FileKind>>;

    /// Reads a file's bytes.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Lists the names of the entries directly inside a directory.
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// Lists every entry below a directory, as paths relative to it.
    fn list_tree(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Whether `path` names a file.
    fn is_file(&self, path: &Path) -> Result<bool> {
        Ok(self.stat(path)? == Some(FileKind::File))
    }

    /// Whether `path` names a directory.
    fn is_directory(&self, path: &Path) -> Result<bool> {
        Ok(self.stat(path)? == Some(FileKind::Directory))
    }

    /// Deep listing filtered by a predicate over (relative path, kind).
    fn list_tree_filtered(
        &self,
        path: &Path,
        filter: &dyn Fn(&Path, FileKind) -> bool,
    ) -> Result<Vec<PathBuf>> {
        let mut matched = Vec::new();
        for relative in self.list_tree(path)? {
            if let Some(kind) = self.stat(&path.join(&relative))? {
                if filter(&relative, kind) {
                    matched.push(relative);
                }
            }
        }
        Ok(matched)
    }

    /// Deep listing of files only.
    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.list_tree_filtered(path, &|_, kind| kind == FileKind::File)
    }
}

/// Lexically normalizes a path into a relative, `/`-joined form, dropping
/// root markers and `.` segments and folding `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    PathBuf::from(parts.join("/"))
}

/// Renders a path with forward slashes, for hrefs and module ids.
pub fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Returns the extension of the last path segment including its dot, or an
/// empty string. Leading-dot names like `.hidden` have no extension.
pub fn extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => "",
        Some(index) => &name[index..],
    }
}

/// The host operating system's filesystem.
#[derive(Debug, Clone, Default)]
pub struct HostFs;

impl HostFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for HostFs {
    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        std::fs::canonicalize(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                href: path.display().to_string(),
                message: "no such file or directory".to_string(),
            },
            _ => Error::Io(error),
        })
    }

    fn stat(&self, path: &Path) -> Result<Option<FileKind>> {
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => Ok(Some(FileKind::Directory)),
            Ok(metadata) if metadata.is_file() => Ok(Some(FileKind::File)),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(Error::Io(error)),
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                href: path.display().to_string(),
                message: "no such file".to_string(),
            },
            _ => Error::Io(error),
        })
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn list_tree(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in walk(path) {
            let entry = entry.map_err(|error| walk_error(path, error))?;
            if let Ok(relative) = entry.path().strip_prefix(path) {
                entries.push(relative.to_path_buf());
            }
        }
        Ok(entries)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        // Skips the per-entry stat of the default implementation.
        let mut files = Vec::new();
        for entry in walk(path) {
            let entry = entry.map_err(|error| walk_error(path, error))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(path) {
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    }
}

/// Walks below `path`, following symlinks like `stat` does.
fn walk(path: &Path) -> walkdir::IntoIter {
    WalkDir::new(path)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
}

fn walk_error(path: &Path, error: walkdir::Error) -> Error {
    Error::Filesystem {
        message: format!("Failed to walk {}: {}", path.display(), error),
    }
}

/// Represents a file held in memory
#[derive(Debug, Clone)]
pub struct File {
    /// File content as bytes
    pub content: Vec<u8>,
}

impl File {
    /// Create a new file with content
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    /// Create a new file from string content
    pub fn from_string(content: &str) -> Self {
        Self::new(content.as_bytes().to_vec())
    }

    /// Get file size in bytes
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// In-memory filesystem, the decoded form of an archive
#[derive(Debug, Clone, Default)]
pub struct MemoryFS {
    /// Files stored as normalized path -> content mapping
    files: BTreeMap<PathBuf, File>,
}

impl MemoryFS {
    /// Create a new empty filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a file
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P, file: File) -> Result<()> {
        let path = normalize(path.as_ref());
        if path.as_os_str().is_empty() {
            return Err(Error::Filesystem {
                message: "Cannot add a file at the filesystem root".to_string(),
            });
        }
        self.files.insert(path, file);
        Ok(())
    }

    /// Add a file with content
    pub fn add_file_content<P: AsRef<Path>>(&mut self, path: P, content: Vec<u8>) -> Result<()> {
        self.add_file(path, File::new(content))
    }

    /// Add a file with string content
    pub fn add_file_string<P: AsRef<Path>>(&mut self, path: P, content: &str) -> Result<()> {
        self.add_file(path, File::from_string(content))
    }

    /// Get a file by path
    pub fn get_file<P: AsRef<Path>>(&self, path: P) -> Option<&File> {
        self.files.get(&normalize(path.as_ref()))
    }

    /// Check if a file exists
    pub fn exists<P: AsRef<Path>>(&self, path: P) -> bool {
        self.files.contains_key(&normalize(path.as_ref()))
    }

    /// List all files
    pub fn list_all_files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    /// Get the number of files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if filesystem is empty
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Merge another filesystem into this one (last-write-wins)
    pub fn merge(&mut self, other: &MemoryFS) {
        for (path, file) in &other.files {
            self.files.insert(path.clone(), file.clone());
        }
    }

    /// Iterate over all files as (path, file) pairs
    pub fn files(&self) -> impl Iterator<Item = (&PathBuf, &File)> {
        self.files.iter()
    }

    /// Strips a single top-level directory shared by every file.
    ///
    /// Archives commonly wrap their content in one directory named after the
    /// archive; rerooting makes `pkg.zip` and `pkg/` look the same.
    pub fn reroot(self) -> Self {
        let prefix = match self.shared_top_directory() {
            Some(prefix) => prefix,
            None => return self,
        };
        let files = self
            .files
            .iter()
            .filter_map(|(path, file)| {
                path.strip_prefix(&prefix)
                    .ok()
                    .map(|stripped| (stripped.to_path_buf(), file.clone()))
            })
            .collect();
        Self { files }
    }

    fn shared_top_directory(&self) -> Option<PathBuf> {
        let mut top: Option<&std::ffi::OsStr> = None;
        for path in self.files.keys() {
            let mut components = path.components();
            let first = match components.next() {
                Some(Component::Normal(first)) => first,
                _ => return None,
            };
            components.next()?;
            match top {
                None => top = Some(first),
                Some(seen) if seen == first => {}
                Some(_) => return None,
            }
        }
        top.map(PathBuf::from)
    }

    fn directories(&self) -> BTreeSet<PathBuf> {
        let mut directories = BTreeSet::new();
        for path in self.files.keys() {
            let mut parent = path.parent();
            while let Some(directory) = parent {
                if directory.as_os_str().is_empty() {
                    break;
                }
                directories.insert(directory.to_path_buf());
                parent = directory.parent();
            }
        }
        directories
    }

    fn not_found(path: &Path) -> Error {
        Error::NotFound {
            href: path.display().to_string(),
            message: "no such entry in archive".to_string(),
        }
    }
}

impl FileSystem for MemoryFS {
    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        let normalized = normalize(path);
        match self.stat(&normalized)? {
            Some(_) => Ok(normalized),
            None => Err(Self::not_found(path)),
        }
    }

    fn stat(&self, path: &Path) -> Result<Option<FileKind>> {
        let normalized = normalize(path);
        if normalized.as_os_str().is_empty() {
            return Ok(Some(FileKind::Directory));
        }
        if self.files.contains_key(&normalized) {
            return Ok(Some(FileKind::File));
        }
        let is_directory = self
            .files
            .keys()
            .any(|file| file != &normalized && file.starts_with(&normalized));
        Ok(is_directory.then_some(FileKind::Directory))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.get_file(path)
            .map(|file| file.content.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let base = normalize(path);
        if self.stat(&base)? != Some(FileKind::Directory) {
            return Err(Self::not_found(path));
        }
        let mut names = BTreeSet::new();
        for file in self.files.keys() {
            if let Ok(relative) = file.strip_prefix(&base) {
                if let Some(Component::Normal(name)) = relative.components().next() {
                    names.insert(name.to_string_lossy().into_owned());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn list_tree(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let base = normalize(path);
        if self.stat(&base)? != Some(FileKind::Directory) {
            return Err(Self::not_found(path));
        }
        let mut entries: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in self.files.keys().cloned().chain(self.directories()) {
            if let Ok(relative) = entry.strip_prefix(&base) {
                if !relative.as_os_str().is_empty() {
                    entries.insert(relative.to_path_buf());
                }
            }
        }
        Ok(entries.into_iter().collect())
    }
}

/// A view of a subtree of another filesystem, rooted at `root`.
#[derive(Debug, Clone)]
pub struct RootFs {
    inner: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl RootFs {
    pub fn new(inner: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            root: root.into(),
        }
    }

    /// The directory of the underlying filesystem this view is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn outer(&self, path: &Path) -> PathBuf {
        let relative = normalize(path);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

impl FileSystem for RootFs {
    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        let canonical_root = self.inner.canonical(&self.root)?;
        let canonical = self.inner.canonical(&self.outer(path))?;
        canonical
            .strip_prefix(&canonical_root)
            .map(Path::to_path_buf)
            .map_err(|_| Error::Filesystem {
                message: format!(
                    "{} escapes the root {}",
                    path.display(),
                    self.root.display()
                ),
            })
    }

    fn stat(&self, path: &Path) -> Result<Option<FileKind>> {
        self.inner.stat(&self.outer(path))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(&self.outer(path))
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        self.inner.list(&self.outer(path))
    }

    fn list_tree(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_tree(&self.outer(path))
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_files(&self.outer(path))
    }
}
