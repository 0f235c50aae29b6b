// Columnar Base Files
//
// Parquet writer/reader for base files. Records are decoded into Arrow
// batches through the JSON decoder; the existence index and key range
// are stored in the footer key/value metadata.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::json::reader::Decoder;
use arrow::json::{LineDelimitedWriter, ReaderBuilder};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{BaseFileReader, FileWriter, WriterError, WrittenFile, MB};
use super::{BLOOM_FILTER_KEY, MAX_RECORD_KEY, MIN_RECORD_KEY};
use crate::bloom::{BloomFilter, BloomFilterConfig};
use crate::fs::FileSystem;
use crate::record::Record;
use crate::schema::RecordSchema;

/// Rows buffered before they are decoded into one batch.
const BATCH_ROWS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
}

/// Configuration for the Parquet writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParquetConfig {
    pub compression: ParquetCompression,
    /// Files stop accepting records beyond this size.
    pub max_file_size: u64,
    /// Row groups are flushed when the in-progress size exceeds this.
    pub block_size: usize,
    pub page_size: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            compression: ParquetCompression::Snappy,
            max_file_size: 120 * MB,
            block_size: 120 * MB as usize,
            page_size: MB as usize,
        }
    }
}

impl ParquetConfig {
    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        };

        WriterProperties::builder()
            .set_compression(compression)
            .set_data_page_size_limit(self.page_size)
            .build()
    }
}

pub struct ParquetFileWriter {
    path: PathBuf,
    schema: RecordSchema,
    config: ParquetConfig,
    writer: ArrowWriter<Box<dyn Write + Send>>,
    decoder: Decoder,
    pending: Vec<Map<String, Value>>,
    bloom: BloomFilter,
    min_key: Option<String>,
    max_key: Option<String>,
    records: u64,
}

impl ParquetFileWriter {
    pub(super) fn create(
        fs: &dyn FileSystem,
        path: &Path,
        schema: &RecordSchema,
        config: &ParquetConfig,
        bloom: &BloomFilterConfig,
    ) -> Result<Self, WriterError> {
        let arrow_schema: SchemaRef = schema.to_arrow();
        let decoder = ReaderBuilder::new(Arc::clone(&arrow_schema)).build_decoder()?;

        let out = fs
            .create(path, false)
            .map_err(|source| WriterError::io(path, source))?;
        let writer = ArrowWriter::try_new(out, arrow_schema, Some(config.writer_properties()))?;

        debug!(path = %path.display(), "opened parquet writer");
        Ok(Self {
            path: path.to_path_buf(),
            schema: schema.clone(),
            config: config.clone(),
            writer,
            decoder,
            pending: Vec::new(),
            bloom: BloomFilter::new(bloom),
            min_key: None,
            max_key: None,
            records: 0,
        })
    }

    fn flush_pending(&mut self) -> Result<(), WriterError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.decoder.serialize(&self.pending)?;
        self.pending.clear();
        if let Some(batch) = self.decoder.flush()? {
            self.write_batch(&batch)?;
        }
        Ok(())
    }

    fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), WriterError> {
        self.writer.write(batch)?;
        if self.writer.in_progress_size() > self.config.block_size {
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl FileWriter for ParquetFileWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        self.schema.check_record(&record.data)?;

        let key = record.record_key();
        self.bloom.add(key);
        if self.min_key.as_deref().map_or(true, |m| key < m) {
            self.min_key = Some(key.to_string());
        }
        if self.max_key.as_deref().map_or(true, |m| key > m) {
            self.max_key = Some(key.to_string());
        }

        self.pending.push(record.data.clone());
        self.records += 1;
        if self.pending.len() >= BATCH_ROWS {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn can_write(&self) -> bool {
        let size = self.writer.bytes_written() + self.writer.in_progress_size();
        (size as u64) < self.config.max_file_size
    }

    fn records_written(&self) -> u64 {
        self.records
    }

    fn close(mut self: Box<Self>) -> Result<WrittenFile, WriterError> {
        self.flush_pending()?;

        self.writer.append_key_value_metadata(KeyValue::new(
            BLOOM_FILTER_KEY.to_string(),
            self.bloom.serialize_to_string(),
        ));
        if let (Some(min), Some(max)) = (self.min_key.take(), self.max_key.take()) {
            self.writer
                .append_key_value_metadata(KeyValue::new(MIN_RECORD_KEY.to_string(), min));
            self.writer
                .append_key_value_metadata(KeyValue::new(MAX_RECORD_KEY.to_string(), max));
        }

        let this = *self;
        this.writer.close()?;
        debug!(path = %this.path.display(), records = this.records, "closed parquet writer");
        Ok(WrittenFile {
            path: this.path,
            records: this.records,
        })
    }
}

/// Reads a parquet base file fully into memory.
pub struct ParquetFileReader {
    path: PathBuf,
    data: Bytes,
}

impl ParquetFileReader {
    pub(super) fn open(fs: &dyn FileSystem, path: &Path) -> Result<Self, WriterError> {
        let data = fs.read(path).map_err(|source| WriterError::io(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            data: Bytes::from(data),
        })
    }

    fn footer_value(&self, key: &str) -> Result<Option<String>, WriterError> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(self.data.clone())?;
        let value = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kvs| kvs.iter().find(|kv| kv.key == key))
            .and_then(|kv| kv.value.clone());
        Ok(value)
    }
}

impl BaseFileReader for ParquetFileReader {
    fn read_rows(&self) -> Result<Vec<Map<String, Value>>, WriterError> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(self.data.clone())?.build()?;

        let mut writer = LineDelimitedWriter::new(Vec::new());
        for batch in reader {
            writer.write(&batch?)?;
        }
        writer.finish()?;

        let buf = writer.into_inner();
        let mut rows = Vec::new();
        for line in buf.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            rows.push(serde_json::from_slice(line)?);
        }
        Ok(rows)
    }

    fn bloom_filter(&self) -> Result<BloomFilter, WriterError> {
        let text = self
            .footer_value(BLOOM_FILTER_KEY)?
            .ok_or_else(|| WriterError::corrupt(&self.path, "no bloom filter in footer"))?;
        Ok(BloomFilter::deserialize_from_string(&text)?)
    }

    fn key_range(&self) -> Result<Option<(String, String)>, WriterError> {
        let min = self.footer_value(MIN_RECORD_KEY)?;
        let max = self.footer_value(MAX_RECORD_KEY)?;
        Ok(min.zip(max))
    }
}
