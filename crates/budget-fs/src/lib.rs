//! Small filesystem utilities shared across workspace crates.
//!
//! In particular, this provides helpers for file-backed workbook resources:
//! - canonical keys, so the same workbook reached through different paths dedupes to one entry
//! - detection (and claiming) of office lock files left by another editor process
//! - cheap container sniffing (OPC/ZIP vs. OLE/CFB) before handing a file to a real reader

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

/// `PK\x03\x04`: local file header of a ZIP archive (`.xlsx`, `.xlsm`, `.xlsb`).
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
/// OLE compound file header (`.xls`, or an encrypted OOXML package).
const CFB_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Container formats a workbook file can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// Open Packaging Convention package (ZIP).
    Zip,
    /// OLE Compound File Binary.
    Cfb,
}

fn parent_dir_or_dot(path: &Path) -> &Path {
    // `Path::parent` returns `Some("")` for bare relative file names like `foo.xlsx`.
    // Treat that as the current directory so callers can use relative paths without
    // having to prepend `./`.
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve `path` to the canonical key used to deduplicate workbook resources.
///
/// The result is always absolute and free of `.`/`..` components. Symlinks are resolved for the
/// longest prefix of the path that exists on disk, so a workbook keeps the same key before and
/// after it is created. `dunce` keeps Windows results in their familiar (non-UNC) form.
pub fn canonical_key(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot derive a resource key from an empty path",
        ));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        match dunce::canonicalize(existing) {
            Ok(mut resolved) => {
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Ok(normalized);
                };
                tail.push(name.to_os_string());
                existing = parent;
            }
            Err(err) => return Err(err),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            // `pop` is a no-op at the root, so `/..` stays `/`.
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Lock files other editors create next to a workbook they have open for writing.
///
/// - Excel: `~$<name>` in the same directory.
/// - LibreOffice: `.~lock.<name>#` in the same directory.
pub fn lock_file_candidates(path: impl AsRef<Path>) -> Vec<PathBuf> {
    let path = path.as_ref();
    let Some(name) = path.file_name() else {
        return Vec::new();
    };
    let name = name.to_string_lossy();
    let dir = parent_dir_or_dot(path);
    vec![
        dir.join(format!("~${name}")),
        dir.join(format!(".~lock.{name}#")),
    ]
}

/// Returns `true` when another process holds an office lock on `path`.
///
/// This is advisory: an editor that crashed can leave a stale lock file behind.
pub fn is_locked_by_other(path: impl AsRef<Path>) -> bool {
    lock_file_candidates(path)
        .iter()
        .any(|candidate| candidate.try_exists().unwrap_or(false))
}

/// Claim the LibreOffice-style lock file for `path` so other editors see the workbook as busy.
///
/// Fails with [`io::ErrorKind::AlreadyExists`] if someone else already holds the lock.
pub fn claim_lock_file(path: impl AsRef<Path>, owner: &str) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let Some(name) = path.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot lock `{}`: path has no file name", path.display()),
        ));
    };
    let lock_path = parent_dir_or_dot(path).join(format!(".~lock.{}#", name.to_string_lossy()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)?;
    writeln!(file, "{owner},{}", std::process::id())?;
    file.sync_all()?;
    Ok(lock_path)
}

/// Remove a lock file previously returned by [`claim_lock_file`].
///
/// A lock file that is already gone is not an error.
pub fn release_lock_file(lock_path: impl AsRef<Path>) -> io::Result<()> {
    match fs::remove_file(lock_path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Classify a workbook container from its leading bytes.
pub fn sniff_container(bytes: &[u8]) -> Option<ContainerKind> {
    if bytes.starts_with(&CFB_MAGIC) {
        Some(ContainerKind::Cfb)
    } else if bytes.starts_with(&ZIP_MAGIC) {
        Some(ContainerKind::Zip)
    } else {
        None
    }
}

/// Like [`sniff_container`], but reads the header from `reader`.
///
/// Consumes at most 8 bytes; callers that keep using the reader should seek back to the start.
pub fn sniff_container_reader(reader: &mut impl Read) -> io::Result<Option<ContainerKind>> {
    let mut header = Vec::with_capacity(CFB_MAGIC.len());
    reader
        .take(CFB_MAGIC.len() as u64)
        .read_to_end(&mut header)?;
    Ok(sniff_container(&header))
}

/// Convenience helper for sniffing a file on disk.
pub fn sniff_container_file(path: impl AsRef<Path>) -> io::Result<Option<ContainerKind>> {
    let mut file = File::open(path)?;
    sniff_container_reader(&mut file)
}
