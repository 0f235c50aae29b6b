// Log Block Format
//
// Append-only log files hold a sequence of blocks:
//
//   MAGIC | type: u8 | header_len: u32 | header (JSON) | body_len: u64 | body
//
// Data blocks carry records, delete blocks carry record keys, command
// blocks carry rollback instructions. A reader that hits a torn or
// corrupt block resynchronizes on the next magic.

use std::collections::HashSet;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fs::FileSystem;
use crate::record::{Record, RecordKey};

pub const LOG_MAGIC: &[u8; 7] = b"#TMLOG#";

const FIXED_HEADER_LEN: usize = LOG_MAGIC.len() + 1 + 4;

#[derive(Debug, thiserror::Error)]
pub enum LogFormatError {
    #[error("log I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode log block: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("block at offset {offset} is not a {expected} block")]
    UnexpectedBlock { offset: u64, expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    Data,
    Delete,
    Command,
}

impl BlockType {
    fn code(&self) -> u8 {
        match self {
            BlockType::Data => 1,
            BlockType::Delete => 2,
            BlockType::Command => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(BlockType::Data),
            2 => Some(BlockType::Delete),
            3 => Some(BlockType::Command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Instant that wrote the block.
    pub instant_time: String,
    /// Command blocks: instant whose blocks are invalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instant: Option<String>,
    /// Command blocks: offset up to which the file is valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_offset: Option<u64>,
    #[serde(default)]
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogBlock {
    pub block_type: BlockType,
    pub header: BlockHeader,
    pub body: Vec<u8>,
}

impl LogBlock {
    pub fn data(instant_time: &str, records: &[Record]) -> Result<Self, LogFormatError> {
        Ok(Self {
            block_type: BlockType::Data,
            header: BlockHeader {
                instant_time: instant_time.to_string(),
                target_instant: None,
                valid_offset: None,
                record_count: records.len() as u64,
            },
            body: serde_json::to_vec(records)?,
        })
    }

    pub fn delete(instant_time: &str, keys: &[RecordKey]) -> Result<Self, LogFormatError> {
        Ok(Self {
            block_type: BlockType::Delete,
            header: BlockHeader {
                instant_time: instant_time.to_string(),
                target_instant: None,
                valid_offset: None,
                record_count: keys.len() as u64,
            },
            body: serde_json::to_vec(keys)?,
        })
    }

    /// Rollback command: everything `target_instant` wrote at or after
    /// `valid_offset` is invalid.
    pub fn rollback_command(instant_time: &str, target_instant: &str, valid_offset: u64) -> Self {
        Self {
            block_type: BlockType::Command,
            header: BlockHeader {
                instant_time: instant_time.to_string(),
                target_instant: Some(target_instant.to_string()),
                valid_offset: Some(valid_offset),
                record_count: 0,
            },
            body: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogFormatError> {
        let header = serde_json::to_vec(&self.header)?;
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + header.len() + 8 + self.body.len());
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(self.block_type.code());
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&(self.body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    pub fn records(&self) -> Result<Vec<Record>, LogFormatError> {
        match self.block_type {
            BlockType::Data => Ok(serde_json::from_slice(&self.body)?),
            _ => Err(LogFormatError::UnexpectedBlock {
                offset: 0,
                expected: "data",
            }),
        }
    }

    pub fn deleted_keys(&self) -> Result<Vec<RecordKey>, LogFormatError> {
        match self.block_type {
            BlockType::Delete => Ok(serde_json::from_slice(&self.body)?),
            _ => Err(LogFormatError::UnexpectedBlock {
                offset: 0,
                expected: "delete",
            }),
        }
    }
}

/// A decoded block and where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedBlock {
    pub offset: u64,
    /// Encoded length on disk.
    pub len: u64,
    pub block: LogBlock,
}

/// Result of scanning one log file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogScan {
    pub blocks: Vec<PositionedBlock>,
    /// Start offsets of regions that could not be decoded.
    pub corrupt_offsets: Vec<u64>,
    pub len: u64,
}

impl LogScan {
    pub fn parse(data: &[u8]) -> Self {
        let mut scan = LogScan {
            len: data.len() as u64,
            ..Default::default()
        };

        let mut pos = 0;
        while pos < data.len() {
            if data[pos..].starts_with(LOG_MAGIC) {
                if let Some((block, next)) = decode_block(data, pos) {
                    scan.blocks.push(PositionedBlock {
                        offset: pos as u64,
                        len: (next - pos) as u64,
                        block,
                    });
                    pos = next;
                    continue;
                }
            }

            scan.corrupt_offsets.push(pos as u64);
            pos = match find_magic(data, pos + 1) {
                Some(next) => next,
                None => data.len(),
            };
        }
        scan
    }

    /// Instants already rolled back by a command block in this file.
    pub fn rolled_back_instants(&self) -> HashSet<&str> {
        self.blocks
            .iter()
            .filter(|b| b.block.block_type == BlockType::Command)
            .filter_map(|b| b.block.header.target_instant.as_deref())
            .collect()
    }

    /// Offset before the first byte `instant_time` contributed: the start
    /// of its first block, else the start of a trailing corrupt region
    /// (a torn write), else the end of the file.
    pub fn valid_offset_before(&self, instant_time: &str) -> u64 {
        if let Some(first) = self
            .blocks
            .iter()
            .find(|b| b.block.header.instant_time == instant_time)
        {
            return first.offset;
        }

        let last_block_end = self
            .blocks
            .last()
            .map_or(0, |b| b.offset + b.len);
        match self.corrupt_offsets.iter().find(|&&o| o >= last_block_end) {
            Some(&torn) => torn,
            None => self.len,
        }
    }

    /// Blocks readers may use: written by a completed instant and not
    /// invalidated by a rollback command. Command blocks are excluded.
    pub fn valid_blocks<'a>(
        &'a self,
        is_completed: impl Fn(&str) -> bool + 'a,
    ) -> impl Iterator<Item = &'a PositionedBlock> + 'a {
        let rolled_back = self.rolled_back_instants();
        self.blocks.iter().filter(move |b| {
            b.block.block_type != BlockType::Command
                && !rolled_back.contains(b.block.header.instant_time.as_str())
                && is_completed(&b.block.header.instant_time)
        })
    }
}

fn find_magic(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(LOG_MAGIC.len())
        .position(|w| w == LOG_MAGIC)
        .map(|p| p + from)
}

fn decode_block(data: &[u8], start: usize) -> Option<(LogBlock, usize)> {
    let mut pos = start + LOG_MAGIC.len();

    let block_type = BlockType::from_code(*data.get(pos)?)?;
    pos += 1;

    let header_len = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;
    let header: BlockHeader = serde_json::from_slice(data.get(pos..pos.checked_add(header_len)?)?).ok()?;
    pos += header_len;

    let body_len = u64::from_le_bytes(data.get(pos..pos + 8)?.try_into().ok()?) as usize;
    pos += 8;
    let end = pos.checked_add(body_len)?;
    let body = data.get(pos..end)?.to_vec();

    Some((
        LogBlock {
            block_type,
            header,
            body,
        },
        end,
    ))
}

/// Appends blocks to one log file.
#[derive(Debug)]
pub struct LogWriter<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
}

impl<'a> LogWriter<'a> {
    pub fn new(fs: &'a dyn FileSystem, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length; a missing file has length zero.
    pub fn len(&self) -> Result<u64, LogFormatError> {
        match self.fs.len(&self.path) {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Append one block, returning the offset it starts at.
    pub fn append(&self, block: &LogBlock) -> Result<u64, LogFormatError> {
        let offset = self.len()?;
        let bytes = block.encode()?;

        let mut out = self
            .fs
            .open_append(&self.path)
            .map_err(|e| self.io_error(e))?;
        out.write_all(&bytes).map_err(|e| self.io_error(e))?;
        out.flush().map_err(|e| self.io_error(e))?;
        Ok(offset)
    }

    pub fn scan(&self) -> Result<LogScan, LogFormatError> {
        let data = self.fs.read(&self.path).map_err(|e| self.io_error(e))?;
        Ok(LogScan::parse(&data))
    }

    fn io_error(&self, source: io::Error) -> LogFormatError {
        LogFormatError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use serde_json::Map;
    use tempfile::TempDir;

    fn record(key: &str) -> Record {
        Record {
            key: RecordKey::new(key, "p"),
            current_location: None,
            data: Map::new(),
        }
    }

    #[test]
    fn blocks_append_and_scan_in_order() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem;
        let writer = LogWriter::new(&fs, dir.path().join(".fg_001.log.1_0-0-0"));

        let first = writer.append(&LogBlock::data("001", &[record("a")]).unwrap()).unwrap();
        let second = writer
            .append(&LogBlock::delete("002", &[RecordKey::new("a", "p")]).unwrap())
            .unwrap();

        let scan = writer.scan().unwrap();
        assert_eq!(first, 0);
        assert_eq!(scan.blocks.len(), 2);
        assert_eq!(scan.blocks[1].offset, second);
        assert_eq!(scan.blocks[0].block.records().unwrap()[0].record_key(), "a");
        assert_eq!(scan.blocks[1].block.deleted_keys().unwrap().len(), 1);
        assert!(scan.corrupt_offsets.is_empty());
    }

    #[test]
    fn torn_tail_is_skipped_and_located() {
        let mut data = LogBlock::data("001", &[record("a")]).unwrap().encode().unwrap();
        let good_len = data.len() as u64;
        let torn = LogBlock::data("002", &[record("b")]).unwrap().encode().unwrap();
        data.extend_from_slice(&torn[..torn.len() / 2]);

        let scan = LogScan::parse(&data);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.corrupt_offsets, vec![good_len]);
        assert_eq!(scan.valid_offset_before("002"), good_len);
    }

    #[test]
    fn reader_resyncs_after_garbage() {
        let mut data = b"garbage".to_vec();
        data.extend(LogBlock::data("001", &[record("a")]).unwrap().encode().unwrap());

        let scan = LogScan::parse(&data);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.blocks[0].offset, 7);
        assert_eq!(scan.corrupt_offsets, vec![0]);
    }

    #[test]
    fn rolled_back_and_pending_blocks_are_invalid() {
        let mut data = Vec::new();
        for block in [
            LogBlock::data("001", &[record("a")]).unwrap(),
            LogBlock::data("002", &[record("b")]).unwrap(),
            LogBlock::rollback_command("003", "002", 10),
            LogBlock::data("004", &[record("c")]).unwrap(),
        ] {
            data.extend(block.encode().unwrap());
        }

        let scan = LogScan::parse(&data);
        let valid: Vec<&str> = scan
            .valid_blocks(|ts| ts != "004")
            .map(|b| b.block.header.instant_time.as_str())
            .collect();
        assert_eq!(valid, vec!["001"]);
    }

    #[test]
    fn valid_offset_is_start_of_first_block_of_instant() {
        let mut data = LogBlock::data("001", &[record("a")]).unwrap().encode().unwrap();
        let boundary = data.len() as u64;
        data.extend(LogBlock::data("002", &[record("b")]).unwrap().encode().unwrap());
        data.extend(LogBlock::data("002", &[record("c")]).unwrap().encode().unwrap());

        let scan = LogScan::parse(&data);
        assert_eq!(scan.valid_offset_before("002"), boundary);
        assert_eq!(scan.valid_offset_before("009"), data.len() as u64);
    }
}
