// Sorted Key-Value Base Files
//
// Layout:
//
//   MAGIC
//   data blocks      (u32 count, then per entry: u32 key len, key,
//                     u32 value len, value as JSON)
//   block index      (JSON array of {first_key, offset, len})
//   bloom block
//   footer           (index offset/len, bloom offset/len, record count)
//   MAGIC
//
// Entries are sorted by record key; a later write of the same key
// replaces the earlier one.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{BaseFileReader, FileWriter, WriterError, WrittenFile, MB};
use crate::bloom::{BloomFilter, BloomFilterConfig};
use crate::fs::FileSystem;
use crate::record::Record;
use crate::schema::RecordSchema;

const HFILE_MAGIC: &[u8; 8] = b"TMHFILE1";
const FOOTER_LEN: usize = 5 * 8 + HFILE_MAGIC.len();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HFileConfig {
    /// Target uncompressed size of one data block.
    pub block_size: usize,
    pub max_file_size: u64,
}

impl Default for HFileConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            max_file_size: 120 * MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BlockIndexEntry {
    first_key: String,
    offset: u64,
    len: u64,
}

pub struct HFileWriter {
    path: PathBuf,
    schema: RecordSchema,
    config: HFileConfig,
    out: Box<dyn Write + Send>,
    entries: BTreeMap<String, Map<String, Value>>,
    bloom: BloomFilter,
    estimated_size: u64,
}

impl HFileWriter {
    pub(super) fn create(
        fs: &dyn FileSystem,
        path: &Path,
        schema: &RecordSchema,
        config: &HFileConfig,
        bloom: &BloomFilterConfig,
    ) -> Result<Self, WriterError> {
        let out = fs
            .create(path, false)
            .map_err(|source| WriterError::io(path, source))?;

        debug!(path = %path.display(), "opened hfile writer");
        Ok(Self {
            path: path.to_path_buf(),
            schema: schema.clone(),
            config: config.clone(),
            out,
            entries: BTreeMap::new(),
            bloom: BloomFilter::new(bloom),
            estimated_size: 0,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, WriterError> {
        let mut buf = HFILE_MAGIC.to_vec();
        let mut index = Vec::new();

        let mut block = Vec::new();
        let mut block_count: u32 = 0;
        let mut block_first_key: Option<&str> = None;

        for (key, value) in &self.entries {
            let value = serde_json::to_vec(value)?;
            block_first_key.get_or_insert(key.as_str());
            block.extend_from_slice(&(key.len() as u32).to_le_bytes());
            block.extend_from_slice(key.as_bytes());
            block.extend_from_slice(&(value.len() as u32).to_le_bytes());
            block.extend_from_slice(&value);
            block_count += 1;

            if block.len() >= self.config.block_size {
                flush_block(&mut buf, &mut index, &mut block, &mut block_count, &mut block_first_key);
            }
        }
        flush_block(&mut buf, &mut index, &mut block, &mut block_count, &mut block_first_key);

        let index_offset = buf.len() as u64;
        buf.extend(serde_json::to_vec(&index)?);
        let index_len = buf.len() as u64 - index_offset;

        let bloom_offset = buf.len() as u64;
        buf.extend(self.bloom.to_bytes());
        let bloom_len = buf.len() as u64 - bloom_offset;

        for word in [
            index_offset,
            index_len,
            bloom_offset,
            bloom_len,
            self.entries.len() as u64,
        ] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf.extend_from_slice(HFILE_MAGIC);
        Ok(buf)
    }
}

fn flush_block(
    buf: &mut Vec<u8>,
    index: &mut Vec<BlockIndexEntry>,
    block: &mut Vec<u8>,
    count: &mut u32,
    first_key: &mut Option<&str>,
) {
    let Some(key) = first_key.take() else {
        return;
    };
    index.push(BlockIndexEntry {
        first_key: key.to_string(),
        offset: buf.len() as u64,
        len: (block.len() + 4) as u64,
    });
    buf.extend_from_slice(&count.to_le_bytes());
    buf.append(block);
    *count = 0;
}

impl FileWriter for HFileWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        self.schema.check_record(&record.data)?;

        let key = record.record_key().to_string();
        self.bloom.add(&key);
        self.estimated_size += (key.len() + 8) as u64 + serde_json::to_vec(&record.data)?.len() as u64;
        self.entries.insert(key, record.data.clone());
        Ok(())
    }

    fn can_write(&self) -> bool {
        self.estimated_size < self.config.max_file_size
    }

    fn records_written(&self) -> u64 {
        self.entries.len() as u64
    }

    fn close(mut self: Box<Self>) -> Result<WrittenFile, WriterError> {
        let bytes = self.encode()?;
        let path = self.path.clone();
        self.out
            .write_all(&bytes)
            .and_then(|_| self.out.flush())
            .map_err(|source| WriterError::io(&path, source))?;

        debug!(path = %path.display(), records = self.entries.len(), "closed hfile writer");
        Ok(WrittenFile {
            path,
            records: self.entries.len() as u64,
        })
    }
}

pub struct HFileReader {
    path: PathBuf,
    data: Vec<u8>,
    index: Vec<BlockIndexEntry>,
    bloom_range: (usize, usize),
    record_count: u64,
}

impl HFileReader {
    pub(super) fn open(fs: &dyn FileSystem, path: &Path) -> Result<Self, WriterError> {
        let data = fs.read(path).map_err(|source| WriterError::io(path, source))?;
        let corrupt = |reason: &str| WriterError::corrupt(path, reason);

        if data.len() < HFILE_MAGIC.len() + FOOTER_LEN || !data.starts_with(HFILE_MAGIC) {
            return Err(corrupt("missing hfile header"));
        }
        if !data.ends_with(HFILE_MAGIC) {
            return Err(corrupt("missing hfile trailer"));
        }

        let footer = &data[data.len() - FOOTER_LEN..];
        let word = |i: usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&footer[i * 8..i * 8 + 8]);
            u64::from_le_bytes(bytes)
        };
        let (index_offset, index_len) = (word(0) as usize, word(1) as usize);
        let (bloom_offset, bloom_len) = (word(2) as usize, word(3) as usize);
        let record_count = word(4);

        let index_bytes = data
            .get(index_offset..index_offset.saturating_add(index_len))
            .ok_or_else(|| corrupt("block index out of range"))?;
        let index: Vec<BlockIndexEntry> = serde_json::from_slice(index_bytes)?;
        if data.get(bloom_offset..bloom_offset.saturating_add(bloom_len)).is_none() {
            return Err(corrupt("bloom block out of range"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            data,
            index,
            bloom_range: (bloom_offset, bloom_offset + bloom_len),
            record_count,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    fn read_block(
        &self,
        entry: &BlockIndexEntry,
    ) -> Result<Vec<(String, Map<String, Value>)>, WriterError> {
        let start = entry.offset as usize;
        let block = self
            .data
            .get(start..start.saturating_add(entry.len as usize))
            .ok_or_else(|| WriterError::corrupt(&self.path, "data block out of range"))?;

        let mut cursor = BlockCursor { block, pos: 0 };
        let truncated = || WriterError::corrupt(&self.path, "truncated data block");

        let count = cursor.u32().ok_or_else(truncated)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key_len = cursor.u32().ok_or_else(truncated)? as usize;
            let key = String::from_utf8_lossy(cursor.take(key_len).ok_or_else(truncated)?);
            let value_len = cursor.u32().ok_or_else(truncated)? as usize;
            let value = serde_json::from_slice(cursor.take(value_len).ok_or_else(truncated)?)?;
            entries.push((key.into_owned(), value));
        }
        Ok(entries)
    }

    /// Point lookup using the block index.
    pub fn get(&self, key: &str) -> Result<Option<Map<String, Value>>, WriterError> {
        let block = match self.index.partition_point(|e| e.first_key.as_str() <= key) {
            0 => return Ok(None),
            n => &self.index[n - 1],
        };
        Ok(self
            .read_block(block)?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }
}

struct BlockCursor<'a> {
    block: &'a [u8],
    pos: usize,
}

impl<'a> BlockCursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.block.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }
}

impl BaseFileReader for HFileReader {
    fn read_rows(&self) -> Result<Vec<Map<String, Value>>, WriterError> {
        let mut rows = Vec::with_capacity(self.record_count as usize);
        for entry in &self.index {
            rows.extend(self.read_block(entry)?.into_iter().map(|(_, v)| v));
        }
        Ok(rows)
    }

    fn bloom_filter(&self) -> Result<BloomFilter, WriterError> {
        let (start, end) = self.bloom_range;
        Ok(BloomFilter::from_bytes(&self.data[start..end])?)
    }

    fn key_range(&self) -> Result<Option<(String, String)>, WriterError> {
        let Some(first) = self.index.first() else {
            return Ok(None);
        };
        let Some(last_block) = self.index.last() else {
            return Ok(None);
        };
        let max = self.read_block(last_block)?.pop().map(|(k, _)| k);
        Ok(max.map(|max| (first.first_key.clone(), max)))
    }
}
