//! Archive decoding into in-memory filesystems.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use log::debug;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::filesystem::MemoryFS;

/// Whether a path's extension marks it as an archive.
pub fn is_archive(path: &str, archive_extensions: &[String]) -> bool {
    let lower = path.to_ascii_lowercase();
    archive_extensions
        .iter()
        .any(|extension| lower.ends_with(&extension.to_ascii_lowercase()))
}

/// Decodes zip bytes into a rerooted [`MemoryFS`].
///
/// Directory entries are dropped; a single top-level directory shared by all
/// files is stripped.
pub fn unpack(bytes: &[u8], href: &str) -> Result<MemoryFS> {
    let mut zip = ZipArchive::new(Cursor::new(bytes)).map_err(|error| Error::Archive {
        href: href.to_string(),
        message: format!("invalid zip archive: {}", error),
    })?;

    let mut fs = MemoryFS::new();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let path = safe_relative_path(Path::new(entry.name())).map_err(|message| {
            Error::Archive {
                href: href.to_string(),
                message,
            }
        })?;
        if path.as_os_str().is_empty() {
            continue;
        }
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        fs.add_file_content(path, content)?;
    }

    debug!("Unpacked {} files from {}", fs.len(), href);
    Ok(fs.reroot())
}

fn safe_relative_path(path: &Path) -> std::result::Result<PathBuf, String> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => out.push(segment),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(format!("unsafe path in archive entry: {}", path.display()));
            }
        }
    }
    Ok(out)
}
