//! Disk manager for SnapDB
//!
//! This module handles direct file I/O for per-table data files
//! (`table_<id>.data`).

use crate::error::Result;
use crate::storage::page::{PageId, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk manager
#[derive(Debug)]
pub struct DiskManager {
    /// File handles for open tables
    open_files: Mutex<HashMap<u32, File>>,
    /// Directory where data files are stored
    data_dir: PathBuf,
    /// fsync after each flush
    sync: bool,
}

impl DiskManager {
    pub fn new(data_dir: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            open_files: Mutex::new(HashMap::new()),
            data_dir: data_dir.into(),
            sync,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn table_path(&self, table_id: u32) -> PathBuf {
        self.data_dir.join(format!("table_{}.data", table_id))
    }

    pub fn read_page(&self, table_id: u32, page_id: PageId, data: &mut [u8]) -> Result<()> {
        let mut open_files = self.open_files.lock();
        let file = self.get_file_mut(&mut open_files, table_id)?;
        file.seek(SeekFrom::Start((page_id as u64) * (PAGE_SIZE as u64)))?;
        file.read_exact(data)?;
        Ok(())
    }

    pub fn write_page(&self, table_id: u32, page_id: PageId, data: &[u8]) -> Result<()> {
        let mut open_files = self.open_files.lock();
        let file = self.get_file_mut(&mut open_files, table_id)?;
        file.seek(SeekFrom::Start((page_id as u64) * (PAGE_SIZE as u64)))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Push written pages of a table to stable storage
    pub fn flush(&self, table_id: u32) -> Result<()> {
        let mut open_files = self.open_files.lock();
        let file = self.get_file_mut(&mut open_files, table_id)?;
        file.flush()?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn get_page_count(&self, table_id: u32) -> Result<u64> {
        let mut open_files = self.open_files.lock();
        let file = self.get_file_mut(&mut open_files, table_id)?;
        let file_len = file.metadata()?.len();
        Ok(file_len / PAGE_SIZE as u64)
    }

    fn get_file_mut<'a>(
        &self,
        open_files: &'a mut HashMap<u32, File>,
        table_id: u32,
    ) -> Result<&'a mut File> {
        use std::collections::hash_map::Entry;
        match open_files.entry(table_id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.table_path(table_id))?;
                Ok(e.insert(file))
            }
        }
    }
}
