use memmap2::Mmap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub relative_path: String,
    pub full_path: PathBuf,
    /// File size in bytes. Free from the OS directory scan.
    pub size: u64,
    pub mode: u32,
}

/// Walk a directory tree and collect every regular file with its relative path.
/// Paths use forward slashes so snapshots are portable. Entries whose file name
/// matches one of `exclude` are skipped, directories included, and so is the
/// `skip` subtree (the store, when it lives inside the tree).
pub fn walk_files(root: &Path, exclude: &[String], skip: Option<&Path>) -> Result<Vec<FileEntry>> {
    let root = root.canonicalize().at(root)?;
    let skip = match skip {
        Some(path) => Some(path.canonicalize().at(path)?),
        None => None,
    };

    let mut entries = Vec::new();
    let walker = WalkDir::new(&root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(is_excluded(&e.file_name().to_string_lossy(), exclude)
                    || skip.as_deref() == Some(e.path()))
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            Error::io(path, source)
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .map_err(|_| Error::io(&full_path, std::io::Error::other("path escapes root")))?;

        // Join native components with `/`; on Unix a backslash stays part of the name.
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::io(
                    &full_path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 path"),
                )
            })?
            .join("/");

        let meta = entry.metadata().map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
            Error::io(&full_path, source)
        })?;

        entries.push(FileEntry {
            relative_path,
            full_path,
            size: meta.len(),
            mode: file_mode(&meta),
        });
    }

    Ok(entries)
}

/// Simple name matching; `*` may appear once as a wildcard.
pub fn is_excluded(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    })
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).at(path)?;
    // SAFETY: We only read from this mapping and copy out of it before returning.
    unsafe { Mmap::map(&file).at(path) }
}

/// Read a whole file, via mmap for anything non-empty.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let len = std::fs::metadata(path).at(path)?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(mmap_file(path)?.to_vec())
}

/// Write `data` to `path` through a sibling temp file and a rename, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    let tmp = temp_sibling(path);
    let result = std::fs::write(&tmp, data)
        .and_then(|_| std::fs::rename(&tmp, path))
        .at(path);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(unix)]
pub fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
pub fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).at(path)
}

#[cfg(not(unix))]
pub fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path).at(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(path, perms).at(path)
}
