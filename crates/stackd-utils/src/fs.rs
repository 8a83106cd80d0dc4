use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// What kind of filesystem entry a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Other,
}

/// The subset of `stat` the supervisor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Unix permission bits. Always zero on platforms without them.
    pub mode: u32,
}

impl FileStat {
    #[must_use]
    pub const fn file(mode: u32) -> Self {
        Self {
            kind: FileKind::File,
            mode,
        }
    }

    #[must_use]
    pub const fn is_regular(&self) -> bool {
        matches!(self.kind, FileKind::File)
    }

    /// Whether any user may execute the file.
    ///
    /// Windows has no execute bit, so every regular file counts as executable
    /// there.
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        if cfg!(windows) {
            self.is_regular()
        } else {
            self.is_regular() && self.mode & 0o111 != 0
        }
    }
}

/// A source of file metadata.
pub trait FileSystem: Send + Sync {
    /// Follows symlinks, like `stat(2)`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, `NotFound` when the path is missing.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = std::fs::metadata(path)?;
        let file_type = metadata.file_type();
        let kind = if file_type.is_file() {
            FileKind::File
        } else if file_type.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };

        Ok(FileStat {
            kind,
            mode: permission_bits(&metadata),
        })
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0
}

/// An in-memory filesystem for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    entries: Mutex<HashMap<PathBuf, FileStat>>,
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, stat: FileStat) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), stat);
    }

    pub fn insert_file(&self, path: impl Into<PathBuf>, mode: u32) {
        self.insert(path, FileStat::file(mode));
    }
}

impl FileSystem for MemoryFileSystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                )
            })
    }
}
