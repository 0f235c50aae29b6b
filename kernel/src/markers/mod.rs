// Write-Intent Markers
//
// A marker is an empty file recording that a writer is about to create,
// merge into or append to one data file on behalf of an instant:
//
//   <base>/.tidemark/.temp/<instant>/<partition>/<file>.marker.<IO_TYPE>
//
// Markers are durable before the first data byte is written and are
// removed in bulk once the instant commits.

use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::executor::{ExecutorError, ParallelExecutor};
use crate::fs::naming::{partition_dir, META_FOLDER_NAME, TEMP_FOLDER_NAME};
use crate::fs::FileSystem;

const MARKER_EXTENSION: &str = ".marker.";

/// Kind of file mutation a marker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoType {
    /// A brand-new file; no prior version exists.
    Create,
    /// A new version of an existing file group (copy-on-write).
    Merge,
    /// Blocks appended to a shared log file.
    Append,
}

impl IoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoType::Create => "CREATE",
            IoType::Merge => "MERGE",
            IoType::Append => "APPEND",
        }
    }
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoType {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(IoType::Create),
            "MERGE" => Ok(IoType::Merge),
            "APPEND" => Ok(IoType::Append),
            other => Err(MarkerError::UnknownIoType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("unknown marker io type `{0}`")]
    UnknownIoType(String),

    #[error("`{0}` is not a marker path")]
    NotAMarker(String),

    #[error("marker {0} already exists")]
    AlreadyExists(String),

    #[error("marker I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// One parsed marker, relative to its instant's marker directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Marker {
    pub partition_path: String,
    pub file_name: String,
    pub io_type: IoType,
}

impl Marker {
    /// Parse `<partition>/<file>.marker.<IO_TYPE>`.
    pub fn parse(relative: &str) -> Result<Self, MarkerError> {
        let (data_path, io_type) = relative
            .rsplit_once(MARKER_EXTENSION)
            .ok_or_else(|| MarkerError::NotAMarker(relative.to_string()))?;
        let io_type: IoType = io_type.parse()?;

        let (partition_path, file_name) = match data_path.rsplit_once('/') {
            Some((partition, file)) => (partition.to_string(), file.to_string()),
            None => (String::new(), data_path.to_string()),
        };
        if file_name.is_empty() {
            return Err(MarkerError::NotAMarker(relative.to_string()));
        }

        Ok(Self {
            partition_path,
            file_name,
            io_type,
        })
    }

    /// Data file path relative to the table base path.
    pub fn data_file_path(&self) -> String {
        if self.partition_path.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.partition_path, self.file_name)
        }
    }

    pub fn relative_path(&self) -> String {
        format!("{}{}{}", self.data_file_path(), MARKER_EXTENSION, self.io_type)
    }
}

/// Drop the `.marker.<IO_TYPE>` suffix, recovering the data file path.
pub fn strip_marker_suffix(marker_path: &str) -> &str {
    marker_path
        .rsplit_once(MARKER_EXTENSION)
        .map_or(marker_path, |(data, _)| data)
}

/// Directory holding the markers of `instant_time`.
pub fn marker_dir(base_path: &Path, instant_time: &str) -> PathBuf {
    base_path
        .join(META_FOLDER_NAME)
        .join(TEMP_FOLDER_NAME)
        .join(instant_time)
}

/// Markers of one instant.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    fs: Arc<dyn FileSystem>,
    base_path: PathBuf,
    instant_time: String,
    marker_dir: PathBuf,
}

impl MarkerStore {
    pub fn new(fs: Arc<dyn FileSystem>, base_path: impl Into<PathBuf>, instant_time: &str) -> Self {
        let base_path = base_path.into();
        let marker_dir = marker_dir(&base_path, instant_time);
        Self {
            fs,
            base_path,
            instant_time: instant_time.to_string(),
            marker_dir,
        }
    }

    pub fn instant_time(&self) -> &str {
        &self.instant_time
    }

    pub fn marker_dir(&self) -> &Path {
        &self.marker_dir
    }

    pub fn exists(&self) -> bool {
        self.fs.exists(&self.marker_dir)
    }

    /// Durably record the intent to write `file_name` in `partition_path`.
    ///
    /// Must return before the corresponding data write starts.
    pub fn record(
        &self,
        partition_path: &str,
        file_name: &str,
        io_type: IoType,
    ) -> Result<PathBuf, MarkerError> {
        let marker = Marker {
            partition_path: partition_path.to_string(),
            file_name: file_name.to_string(),
            io_type,
        };
        let path = partition_dir(&self.marker_dir, &marker.relative_path());

        match self.fs.create_durable_empty(&path) {
            Ok(()) => {
                debug!(instant = %self.instant_time, marker = %path.display(), "recorded marker");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(MarkerError::AlreadyExists(path.display().to_string()))
            }
            Err(source) => Err(MarkerError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Every marker path of the instant, relative to the marker directory.
    /// A missing marker directory lists as empty.
    pub fn list_all(&self) -> Result<Vec<String>, MarkerError> {
        let files = self
            .fs
            .list_recursive(&self.marker_dir)
            .map_err(|source| MarkerError::Io {
                path: self.marker_dir.display().to_string(),
                source,
            })?;

        let mut markers: Vec<String> = files
            .into_iter()
            .filter_map(|f| {
                let relative = f.path.strip_prefix(&self.marker_dir).ok()?;
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                relative.contains(MARKER_EXTENSION).then_some(relative)
            })
            .collect();
        markers.sort();
        Ok(markers)
    }

    /// Parsed markers; fails on the first unknown io type.
    pub fn markers(&self) -> Result<Vec<Marker>, MarkerError> {
        self.list_all()?
            .iter()
            .map(|m| Marker::parse(m))
            .collect()
    }

    /// Absolute data file path for a marker path relative to the marker dir.
    pub fn data_file(&self, marker_path: &str) -> PathBuf {
        partition_dir(&self.base_path, strip_marker_suffix(marker_path))
    }

    /// Remove the marker directory of the instant.
    ///
    /// Best effort: failures are logged and reported as `false`, never
    /// raised. Top-level sub-directories are removed in parallel.
    pub fn delete_all(&self, executor: &ParallelExecutor, parallelism: usize) -> bool {
        match self.try_delete_all(executor, parallelism) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(
                    instant = %self.instant_time,
                    dir = %self.marker_dir.display(),
                    error = %e,
                    "failed to delete marker directory"
                );
                false
            }
        }
    }

    fn try_delete_all(
        &self,
        executor: &ParallelExecutor,
        parallelism: usize,
    ) -> Result<bool, MarkerError> {
        let io_err = |path: &Path, source: io::Error| MarkerError::Io {
            path: path.display().to_string(),
            source,
        };

        let children = match self.fs.list(&self.marker_dir) {
            Ok(children) => children,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(&self.marker_dir, e)),
        };

        let fs = &self.fs;
        executor.map(children, parallelism, |child| {
            let result = if child.is_dir {
                fs.delete_dir(&child.path)
            } else {
                fs.delete(&child.path)
            };
            result.map_err(|e| io_err(&child.path, e))
        })?;

        let deleted = self
            .fs
            .delete_dir(&self.marker_dir)
            .map_err(|e| io_err(&self.marker_dir, e))?;
        debug!(instant = %self.instant_time, "deleted marker directory");
        Ok(deleted)
    }
}
