//! Named snapshot file management
//!
//! Stores versioned snapshot blobs under one directory per partition.
//! Writes go to a temp file first and are renamed into place so a crash
//! mid-write never leaves a half-visible snapshot.

use crate::error::Result;
use bytes::Bytes;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Manages snapshot files in a single directory
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    /// Open (creating if needed) the snapshot directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Write a snapshot atomically. Returns the byte size written.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<u64> {
        let tmp = self.dir.join(format!("{name}.partial"));
        let path = self.dir.join(name);

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(name, bytes = data.len(), "wrote snapshot");
        Ok(data.len() as u64)
    }

    /// Read a snapshot, `None` if it does not exist
    pub fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a snapshot if present
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every snapshot in the directory (partition teardown)
    pub fn remove_all(&self) -> Result<()> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "removed snapshot files");
        }
        Ok(())
    }

    /// Byte size of a snapshot, 0 if absent
    pub fn size(&self, name: &str) -> Result<u64> {
        let path = self.dir.join(name);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
