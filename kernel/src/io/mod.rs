// File Writers
//
// A file writer is bound to one physical data file of one instant. It
// accumulates every record key into an existence index and, on close,
// writes records and the serialized index into the same file. The
// target path's extension selects the format.

pub mod hfile;
pub mod log;
pub mod parquet;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bloom::{BloomError, BloomFilter, BloomFilterConfig};
use crate::fs::FileSystem;
use crate::record::Record;
use crate::schema::{RecordSchema, SchemaError};

pub use self::hfile::{HFileConfig, HFileReader, HFileWriter};
pub use self::parquet::{ParquetCompression, ParquetConfig, ParquetFileReader, ParquetFileWriter};

pub const MB: u64 = 1024 * 1024;

/// Footer metadata key holding the base64 existence index.
pub const BLOOM_FILTER_KEY: &str = "tidemark.bloom_filter";
pub const MIN_RECORD_KEY: &str = "tidemark.min_record_key";
pub const MAX_RECORD_KEY: &str = "tidemark.max_record_key";

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("file format `{0}` is not supported")]
    UnsupportedFormat(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt data file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("record does not match schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl WriterError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        WriterError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: &str) -> Self {
        WriterError::Corrupt {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Base file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaseFileFormat {
    #[default]
    Parquet,
    #[serde(rename = "hfile")]
    HFile,
}

impl BaseFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            BaseFileFormat::Parquet => "parquet",
            BaseFileFormat::HFile => "hfile",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "parquet" => Some(BaseFileFormat::Parquet),
            "hfile" => Some(BaseFileFormat::HFile),
            _ => None,
        }
    }

    pub fn of_path(path: &Path) -> Result<Self, WriterError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::from_extension(extension)
            .ok_or_else(|| WriterError::UnsupportedFormat(extension.to_string()))
    }
}

/// Summary of a closed data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub records: u64,
}

/// Write-once handle over one data file.
pub trait FileWriter: Send {
    fn path(&self) -> &Path;

    fn write(&mut self, record: &Record) -> Result<(), WriterError>;

    /// Whether the file is still below its size limit.
    fn can_write(&self) -> bool;

    fn records_written(&self) -> u64;

    /// Flush records and the existence index; the file is immutable afterwards.
    fn close(self: Box<Self>) -> Result<WrittenFile, WriterError>;
}

/// Read side of a base file.
pub trait BaseFileReader {
    fn read_rows(&self) -> Result<Vec<Map<String, Value>>, WriterError>;

    fn bloom_filter(&self) -> Result<BloomFilter, WriterError>;

    /// Smallest and largest record key, if the file has any records.
    fn key_range(&self) -> Result<Option<(String, String)>, WriterError>;
}

/// Creates writers and readers by file extension.
#[derive(Debug, Clone)]
pub struct FileWriterFactory {
    fs: Arc<dyn FileSystem>,
    bloom: BloomFilterConfig,
    parquet: ParquetConfig,
    hfile: HFileConfig,
}

impl FileWriterFactory {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        bloom: BloomFilterConfig,
        parquet: ParquetConfig,
        hfile: HFileConfig,
    ) -> Self {
        Self {
            fs,
            bloom,
            parquet,
            hfile,
        }
    }

    /// Open a writer for `path`. Unsupported extensions fail before any
    /// file is created.
    pub fn get_file_writer(
        &self,
        path: &Path,
        schema: &RecordSchema,
    ) -> Result<Box<dyn FileWriter>, WriterError> {
        match BaseFileFormat::of_path(path)? {
            BaseFileFormat::Parquet => Ok(Box::new(ParquetFileWriter::create(
                self.fs.as_ref(),
                path,
                schema,
                &self.parquet,
                &self.bloom,
            )?)),
            BaseFileFormat::HFile => Ok(Box::new(HFileWriter::create(
                self.fs.as_ref(),
                path,
                schema,
                &self.hfile,
                &self.bloom,
            )?)),
        }
    }

    pub fn open_reader(&self, path: &Path) -> Result<Box<dyn BaseFileReader>, WriterError> {
        open_base_file_reader(self.fs.as_ref(), path)
    }
}

pub fn open_base_file_reader(
    fs: &dyn FileSystem,
    path: &Path,
) -> Result<Box<dyn BaseFileReader>, WriterError> {
    match BaseFileFormat::of_path(path)? {
        BaseFileFormat::Parquet => Ok(Box::new(ParquetFileReader::open(fs, path)?)),
        BaseFileFormat::HFile => Ok(Box::new(HFileReader::open(fs, path)?)),
    }
}
