//! Page I/O: fixed-size block read/write over a single on-disk file.
//!
//! Reads past the current file length return zero-filled buffers; writes
//! extend the file as needed. Crash-atomic whole-page replacement is the
//! caller's responsibility in combination with the WAL (the storage
//! engine's Page I/O component).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use galdr_common::{GaldrError, GaldrResult, PageId};

/// Raw block-level I/O over a file with a fixed, configured page size.
pub struct DiskManager {
    file: File,
    page_size: u32,
}

impl DiskManager {
    /// Opens (creating if absent) the file at `path` for block I/O at
    /// `page_size` bytes per page.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u32) -> GaldrResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file, page_size })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Current file length in whole pages (rounds down any partial tail).
    pub fn page_count(&self) -> GaldrResult<u64> {
        let len = self.file.metadata()?.len();
        Ok(len / self.page_size as u64)
    }

    fn offset_of(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }

    /// Reads exactly `page_size` bytes into `buf`. Reads beyond the current
    /// file length are zero-filled rather than erroring.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> GaldrResult<()> {
        if buf.len() != self.page_size as usize {
            return Err(GaldrError::InvalidOperation(format!(
                "read_page buffer length {} does not match page size {}",
                buf.len(),
                self.page_size
            )));
        }
        let offset = self.offset_of(page_id);
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }
        if offset + buf.len() as u64 > file_len {
            buf.fill(0);
            let available = (file_len - offset) as usize;
            self.file.read_exact_at(&mut buf[..available], offset)?;
            return Ok(());
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes exactly `page_size` bytes at `page_id`, extending the file as
    /// needed. Does not itself update any allocation bookkeeping — callers
    /// (the Page Manager) own `total_page_count`, the bitmap, and the FSM.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> GaldrResult<()> {
        if buf.len() != self.page_size as usize {
            return Err(GaldrError::InvalidOperation(format!(
                "write_page buffer length {} does not match page size {}",
                buf.len(),
                self.page_size
            )));
        }
        let offset = self.offset_of(page_id);
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Durable sync of all buffered writes.
    pub fn flush(&self) -> GaldrResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Grows or shrinks the file to hold exactly `page_count` pages.
    pub fn set_length(&self, page_count: u64) -> GaldrResult<()> {
        self.file.set_len(page_count * self.page_size as u64)?;
        Ok(())
    }

    /// Flushes and releases the underlying file handle.
    pub fn close(self) -> GaldrResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut dm = DiskManager::open(&path, 4096).unwrap();
        let mut data = vec![0u8; 4096];
        data[..4].copy_from_slice(b"DEAD");
        data[4092..].copy_from_slice(b"BEEF");
        dm.write_page(3, &data).unwrap();
        dm.flush().unwrap();

        let mut buf = vec![0u8; 4096];
        dm.read_page(3, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"DEAD");
        assert_eq!(&buf[4092..], b"BEEF");
    }

    #[test]
    fn reads_past_length_are_zero_filled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let dm = DiskManager::open(&path, 4096).unwrap();
        let mut buf = vec![0xAA; 4096];
        dm.read_page(10, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn wrong_buffer_size_is_invalid_operation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut dm = DiskManager::open(&path, 4096).unwrap();
        let small = vec![0u8; 10];
        assert!(matches!(
            dm.write_page(0, &small),
            Err(GaldrError::InvalidOperation(_))
        ));
    }

    #[test]
    fn isolation_across_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut dm = DiskManager::open(&path, 4096).unwrap();
        dm.write_page(2, &vec![0xBB; 4096]).unwrap();
        dm.write_page(1, &vec![0xAA; 4096]).unwrap();
        dm.write_page(3, &vec![0xCC; 4096]).unwrap();

        let mut buf = vec![0u8; 4096];
        dm.read_page(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xBB));
        dm.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn set_length_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut dm = DiskManager::open(&path, 4096).unwrap();
            dm.set_length(51).unwrap();
        }
        let dm = DiskManager::open(&path, 4096).unwrap();
        assert_eq!(dm.page_count().unwrap(), 51);
    }
}
