// Filesystem Abstraction
//
// The POSIX-like surface the write core needs from the storage layer:
// create, append, delete, list and exists, plus atomic rename for
// metadata files.

pub mod naming;
pub mod partition;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
}

/// Storage backend for table data and metadata.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Create a file for writing, creating parent directories.
    ///
    /// Fails with `AlreadyExists` when `overwrite` is false and the file exists.
    fn create(&self, path: &Path, overwrite: bool) -> io::Result<Box<dyn Write + Send>>;

    /// Create an empty file and make it durable before returning.
    fn create_durable_empty(&self, path: &Path) -> io::Result<()>;

    /// Open an existing file (or create a new one) positioned at its end.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Delete a file. Returns `false` when it did not exist.
    fn delete(&self, path: &Path) -> io::Result<bool>;

    /// Delete a directory tree. Returns `false` when it did not exist.
    fn delete_dir(&self, path: &Path) -> io::Result<bool>;

    /// Direct children of `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<FileStatus>>;

    fn exists(&self, path: &Path) -> bool;

    fn len(&self, path: &Path) -> io::Result<u64>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn mkdirs(&self, path: &Path) -> io::Result<()>;

    /// Every file below `dir`, depth first. A missing `dir` lists as empty.
    fn list_recursive(&self, dir: &Path) -> io::Result<Vec<FileStatus>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = match self.list(&current) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                if entry.is_dir {
                    pending.push(entry.path);
                } else {
                    files.push(entry);
                }
            }
        }
        Ok(files)
    }
}

/// `std::fs` backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn create(&self, path: &Path, overwrite: bool) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = if overwrite {
            File::create(path)?
        } else {
            OpenOptions::new().write(true).create_new(true).open(path)?
        };
        Ok(Box::new(file))
    }

    fn create_durable_empty(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.sync_all()
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_dir(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<FileStatus>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(FileStatus {
                path: entry.path(),
                is_dir: metadata.is_dir(),
                len: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)
    }

    fn mkdirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}
