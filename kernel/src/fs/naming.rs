// Data File Naming
//
// Base files:  {fileId}_{writeToken}_{instantTime}.{extension}
// Log files:   .{fileId}_{baseInstantTime}.log.{version}_{writeToken}
//
// The write token `{taskId}-{stageId}-{attemptId}` attributes a physical
// file to the task attempt that produced it.

use std::fmt;

/// Folder holding the timeline, table properties and markers.
pub const META_FOLDER_NAME: &str = ".tidemark";
/// Folder (inside the metadata folder) holding per-instant marker directories.
pub const TEMP_FOLDER_NAME: &str = ".temp";
/// Folder (inside the metadata folder) holding archived instants.
pub const ARCHIVE_FOLDER_NAME: &str = "archived";

const LOG_EXTENSION: &str = ".log.";

/// Identifies one task attempt that wrote a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken {
    pub task_id: u64,
    pub stage_id: u64,
    pub attempt_id: u64,
}

impl WriteToken {
    pub fn new(task_id: u64, stage_id: u64, attempt_id: u64) -> Self {
        Self {
            task_id,
            stage_id,
            attempt_id,
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split('-').map(|p| p.parse::<u64>().ok());
        let token = Self::new(parts.next()??, parts.next()??, parts.next()??);
        parts.next().is_none().then_some(token)
    }
}

impl fmt::Display for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.task_id, self.stage_id, self.attempt_id)
    }
}

/// Parsed name of a versioned base file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseFileName {
    pub file_id: String,
    pub write_token: String,
    pub instant_time: String,
    pub extension: String,
}

impl BaseFileName {
    pub fn new(file_id: &str, write_token: &WriteToken, instant_time: &str, extension: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            write_token: write_token.to_string(),
            instant_time: instant_time.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if name.starts_with('.') {
            return None;
        }
        let (stem, extension) = name.rsplit_once('.')?;
        let parts: Vec<&str> = stem.split('_').collect();
        match parts.as_slice() {
            [file_id, write_token, instant_time]
                if !file_id.is_empty() && WriteToken::parse(write_token).is_some() =>
            {
                Some(Self {
                    file_id: file_id.to_string(),
                    write_token: write_token.to_string(),
                    instant_time: instant_time.to_string(),
                    extension: extension.to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.file_id, self.write_token, self.instant_time, self.extension
        )
    }
}

/// Parsed name of an append-only log file of a file slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogFileName {
    pub file_id: String,
    pub base_instant_time: String,
    pub version: u32,
    pub write_token: String,
}

impl LogFileName {
    pub fn new(file_id: &str, base_instant_time: &str, version: u32, write_token: &WriteToken) -> Self {
        Self {
            file_id: file_id.to_string(),
            base_instant_time: base_instant_time.to_string(),
            version,
            write_token: write_token.to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('.')?;
        let (left, right) = rest.split_once(LOG_EXTENSION)?;
        let (file_id, base_instant_time) = left.split_once('_')?;
        let (version, write_token) = right.split_once('_')?;
        WriteToken::parse(write_token)?;

        Some(Self {
            file_id: file_id.to_string(),
            base_instant_time: base_instant_time.to_string(),
            version: version.parse().ok()?,
            write_token: write_token.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            ".{}_{}{}{}_{}",
            self.file_id, self.base_instant_time, LOG_EXTENSION, self.version, self.write_token
        )
    }
}

/// Any file a writer produces inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataFileName {
    Base(BaseFileName),
    Log(LogFileName),
}

impl DataFileName {
    pub fn parse(name: &str) -> Option<Self> {
        LogFileName::parse(name)
            .map(DataFileName::Log)
            .or_else(|| BaseFileName::parse(name).map(DataFileName::Base))
    }

    pub fn file_id(&self) -> &str {
        match self {
            DataFileName::Base(b) => &b.file_id,
            DataFileName::Log(l) => &l.file_id,
        }
    }
}

/// Join a partition path onto the table base path; the empty partition
/// is the base path itself.
pub fn partition_dir(base_path: &std::path::Path, partition_path: &str) -> std::path::PathBuf {
    if partition_path.is_empty() {
        base_path.to_path_buf()
    } else {
        base_path.join(partition_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_file_name_round_trip() {
        let name = BaseFileName::new(
            "5b6c0d3e-2f1a-4c5e-9b0a-0f2e3d4c5b6a",
            &WriteToken::new(3, 0, 1),
            "20240101000000000",
            "parquet",
        );
        let text = name.file_name();
        assert_eq!(
            text,
            "5b6c0d3e-2f1a-4c5e-9b0a-0f2e3d4c5b6a_3-0-1_20240101000000000.parquet"
        );
        assert_eq!(BaseFileName::parse(&text), Some(name));
    }

    #[test]
    fn log_file_name_round_trip() {
        let name = LogFileName::new("fg1", "20240101000000000", 2, &WriteToken::new(0, 1, 0));
        let text = name.file_name();
        assert_eq!(text, ".fg1_20240101000000000.log.2_0-1-0");
        assert_eq!(LogFileName::parse(&text), Some(name.clone()));
        assert_eq!(DataFileName::parse(&text), Some(DataFileName::Log(name)));
    }

    #[test]
    fn foreign_files_are_not_data_files() {
        assert_eq!(DataFileName::parse("table.json"), None);
        assert_eq!(DataFileName::parse("a_b_c.parquet"), None);
        assert_eq!(DataFileName::parse(".hidden"), None);
    }
}
