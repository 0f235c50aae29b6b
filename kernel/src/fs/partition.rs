// Partition Discovery
//
// Lists the partition paths of a table, either assuming the fixed
// `yyyy/mm/dd` date layout or by walking the tree for directories that
// hold data files.

use std::io::{self, ErrorKind};
use std::path::Path;

use super::naming::{DataFileName, META_FOLDER_NAME};
use super::FileSystem;

const DATE_PARTITION_DEPTH: usize = 3;

/// Partition paths relative to `base_path`, `/`-separated and sorted.
/// The empty string denotes a non-partitioned table.
pub fn list_partitions(
    fs: &dyn FileSystem,
    base_path: &Path,
    assume_date_partitioning: bool,
) -> io::Result<Vec<String>> {
    let mut partitions = if assume_date_partitioning {
        date_partitions(fs, base_path)?
    } else {
        data_partitions(fs, base_path)?
    };
    partitions.sort();
    partitions.dedup();
    Ok(partitions)
}

fn date_partitions(fs: &dyn FileSystem, base_path: &Path) -> io::Result<Vec<String>> {
    let mut level = vec![String::new()];

    for _ in 0..DATE_PARTITION_DEPTH {
        let mut next = Vec::new();
        for prefix in &level {
            let dir = super::naming::partition_dir(base_path, prefix);
            for entry in list_or_empty(fs, &dir)? {
                let Some(name) = dir_name(&entry.path) else {
                    continue;
                };
                if !entry.is_dir || name.starts_with('.') {
                    continue;
                }
                next.push(join(prefix, &name));
            }
        }
        level = next;
    }
    Ok(level)
}

fn data_partitions(fs: &dyn FileSystem, base_path: &Path) -> io::Result<Vec<String>> {
    let mut partitions = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(prefix) = pending.pop() {
        let dir = super::naming::partition_dir(base_path, &prefix);
        let mut holds_data = false;
        for entry in list_or_empty(fs, &dir)? {
            let Some(name) = dir_name(&entry.path) else {
                continue;
            };
            if entry.is_dir {
                if name != META_FOLDER_NAME {
                    pending.push(join(&prefix, &name));
                }
            } else if DataFileName::parse(&name).is_some() {
                holds_data = true;
            }
        }
        if holds_data {
            partitions.push(prefix);
        }
    }
    Ok(partitions)
}

fn list_or_empty(fs: &dyn FileSystem, dir: &Path) -> io::Result<Vec<super::FileStatus>> {
    match fs.list(dir) {
        Ok(entries) => Ok(entries),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use tempfile::TempDir;

    const DATA_FILE: &str = "fg_0-0-0_20240101000000000.parquet";

    fn touch(dir: &TempDir, relative: &str) {
        LocalFileSystem
            .create_durable_empty(&dir.path().join(relative))
            .unwrap();
    }

    #[test]
    fn walks_for_directories_with_data_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir, &format!("region=eu/{DATA_FILE}"));
        touch(&dir, &format!("region=us/city=nyc/{DATA_FILE}"));
        touch(&dir, "region=us/notes.txt");
        touch(&dir, &format!(".tidemark/{DATA_FILE}"));

        let partitions = list_partitions(&LocalFileSystem, dir.path(), false).unwrap();
        assert_eq!(partitions, vec!["region=eu", "region=us/city=nyc"]);
    }

    #[test]
    fn date_partitioning_lists_three_levels() {
        let dir = TempDir::new().unwrap();
        touch(&dir, &format!("2024/01/01/{DATA_FILE}"));
        touch(&dir, "2024/01/02/empty-partition-marker");
        touch(&dir, ".tidemark/2024.commit");

        let partitions = list_partitions(&LocalFileSystem, dir.path(), true).unwrap();
        assert_eq!(partitions, vec!["2024/01/01", "2024/01/02"]);
    }

    #[test]
    fn non_partitioned_table_is_the_empty_partition() {
        let dir = TempDir::new().unwrap();
        touch(&dir, DATA_FILE);

        let partitions = list_partitions(&LocalFileSystem, dir.path(), false).unwrap();
        assert_eq!(partitions, vec![""]);
    }
}
