use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use budget_fs::ContainerKind;

use super::{BackendError, ResourceBackend};

const LOCK_OWNER: &str = "budget-resources";

/// Opens workbook files straight from disk.
///
/// Opening checks the container signature so obviously broken files are rejected before a real
/// reader spends memory on them. Read-write opens claim an office lock file so other editors see
/// the workbook as busy until it is closed.
#[derive(Debug, Clone)]
pub struct FsBackend {
    claim_write_locks: bool,
}

impl Default for FsBackend {
    fn default() -> Self {
        Self {
            claim_write_locks: true,
        }
    }
}

impl FsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip creating lock files for read-write opens.
    pub fn without_write_locks(mut self) -> Self {
        self.claim_write_locks = false;
        self
    }
}

/// A workbook file held open by [`FsBackend`].
#[derive(Debug)]
pub struct WorkbookFile {
    path: PathBuf,
    container: ContainerKind,
    len: u64,
    read_only: bool,
    lock_file: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl WorkbookFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> ContainerKind {
        self.container
    }

    /// File size at open time.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_open(&self) -> bool {
        self.file
            .lock()
            .expect("workbook file mutex poisoned")
            .is_some()
    }

    /// Run `f` against the open OS file, rewound to the start.
    pub fn with_file<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.file.lock().expect("workbook file mutex poisoned");
        let file = guard.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("workbook `{}` is closed", self.path.display()),
            )
        })?;
        file.seek(SeekFrom::Start(0))?;
        f(file)
    }
}

impl ResourceBackend for FsBackend {
    type Resource = WorkbookFile;

    fn open(&self, key: &str, read_only: bool) -> Result<WorkbookFile, BackendError> {
        let path = PathBuf::from(key);
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let len = file.metadata()?.len();

        let container = budget_fs::sniff_container_reader(&mut file)?.ok_or_else(|| {
            BackendError::Malformed(if len == 0 {
                "empty file".to_string()
            } else {
                "not a ZIP or CFB workbook container".to_string()
            })
        })?;
        file.seek(SeekFrom::Start(0))?;

        let lock_file = if !read_only && self.claim_write_locks {
            match budget_fs::claim_lock_file(&path, LOCK_OWNER) {
                Ok(lock) => Some(lock),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(BackendError::Locked)
                }
                Err(err) => return Err(BackendError::Io(err)),
            }
        } else {
            None
        };

        log::debug!(
            "opened workbook `{key}` ({container:?}, {len} bytes, read_only={read_only})"
        );
        Ok(WorkbookFile {
            path,
            container,
            len,
            read_only,
            lock_file,
            file: Mutex::new(Some(file)),
        })
    }

    fn close(&self, resource: &WorkbookFile) -> Result<(), BackendError> {
        let file = resource
            .file
            .lock()
            .expect("workbook file mutex poisoned")
            .take();
        let synced = match file {
            Some(file) if !resource.read_only => file.sync_all(),
            _ => Ok(()),
        };
        // Drop the lock even when the sync failed; the handle is gone either way.
        let unlocked = match &resource.lock_file {
            Some(lock) => budget_fs::release_lock_file(lock),
            None => Ok(()),
        };
        synced.map_err(BackendError::Io)?;
        unlocked.map_err(BackendError::Io)?;
        Ok(())
    }

    fn is_locked(&self, key: &str) -> bool {
        budget_fs::is_locked_by_other(key)
    }
}
