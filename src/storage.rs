//! # Recording Storage
//!
//! Tasks name their audio by file name; this module maps those names onto the
//! recordings directory and reports disk usage for display.

use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

use crate::error::WorkerError;

/// Disk usage of the volume holding the recordings, in bytes.
#[derive(Debug, Clone, Serialize)]
pub struct DiskSpace {
    pub available_bytes: u64,
    pub total_bytes: u64,
    /// Bytes taken by the recordings themselves
    pub recordings_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Storage {
    recordings_dir: PathBuf,
}

impl Storage {
    pub fn new(recordings_dir: impl Into<PathBuf>) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
        }
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Path of an existing recording. Names must be plain file names.
    pub fn audio_file_path(&self, file_name: &str) -> Result<PathBuf, WorkerError> {
        let mut components = Path::new(file_name).components();
        let is_plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !is_plain {
            return Err(WorkerError::InvalidFileName(file_name.to_string()));
        }

        let path = self.recordings_dir.join(file_name);
        if !path.is_file() {
            return Err(WorkerError::AudioFileNotFound(path));
        }
        Ok(path)
    }

    pub fn disk_space(&self) -> DiskSpace {
        let recordings_dir = fs::canonicalize(&self.recordings_dir)
            .unwrap_or_else(|_| self.recordings_dir.clone());

        let disks = Disks::new_with_refreshed_list();
        // The mount point with the longest matching prefix holds the directory
        let disk = disks
            .list()
            .iter()
            .filter(|disk| recordings_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        let (available_bytes, total_bytes) = disk
            .map(|disk| (disk.available_space(), disk.total_space()))
            .unwrap_or((0, 0));

        let recordings_bytes = directory_size(&self.recordings_dir);
        debug!(
            available_bytes,
            total_bytes,
            recordings_bytes,
            "Disk space measured"
        );

        DiskSpace {
            available_bytes,
            total_bytes,
            recordings_bytes,
        }
    }
}

fn directory_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => directory_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
