//! Single-writer append path for the WAL: frame writes, explicit flush,
//! checkpoint bookkeeping, and epoch truncation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;

use galdr_common::{GaldrResult, PageId, PageType, TxId};

use crate::frame::{encode_frame, Frame, FrameFlags, WalHeader, WAL_HEADER_SIZE};

struct WriterState {
    file: File,
    header: WalHeader,
    next_frame_number: u64,
}

/// Append-only WAL writer. All appends are serialized through an internal
/// mutex: WAL append is single-writer serialized.
pub struct WalWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl WalWriter {
    /// Opens an existing WAL or creates a fresh one with random salts.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u32) -> GaldrResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (header, next_frame_number) = if len < WAL_HEADER_SIZE as u64 {
            let header = WalHeader {
                page_size,
                checkpoint_tx_id: 0,
                salt1: 0,
                salt2: rand::thread_rng().r#gen(),
            };
            file.set_len(0)?;
            file.write_all(&header.to_bytes())?;
            file.sync_data()?;
            (header, 0)
        } else {
            let mut buf = vec![0u8; WAL_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header = WalHeader::from_bytes(&buf)?;
            let next = next_frame_number_after_scan(&file, &header)?;
            (header, next)
        };

        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file,
                header,
                next_frame_number,
            }),
        })
    }

    pub fn header(&self) -> WalHeader {
        self.state.lock().header
    }

    /// Appends one frame. Not itself durable until [`Self::flush`] is
    /// called.
    pub fn write_frame(
        &self,
        tx_id: TxId,
        page_id: PageId,
        page_type: PageType,
        data: &[u8],
        flags: FrameFlags,
    ) -> GaldrResult<u64> {
        let mut state = self.state.lock();
        let frame_number = state.next_frame_number;
        let header = state.header;
        let bytes = encode_frame(
            frame_number,
            tx_id,
            page_id,
            page_type.to_byte(),
            flags,
            data,
            header.page_size as usize,
            header.salt1,
            header.salt2,
        );
        state.file.seek(SeekFrom::End(0))?;
        state.file.write_all(&bytes)?;
        state.next_frame_number += 1;
        Ok(frame_number)
    }

    /// Writes N-1 frames with `flags=None` and a final frame with
    /// `flags=Commit` for one transaction's touched pages.
    pub fn write_transaction_batch(
        &self,
        tx_id: TxId,
        pending_writes: &[(PageId, PageType, Vec<u8>)],
    ) -> GaldrResult<()> {
        if pending_writes.is_empty() {
            return Ok(());
        }
        let last = pending_writes.len() - 1;
        for (i, (page_id, page_type, bytes)) in pending_writes.iter().enumerate() {
            let flags = if i == last {
                FrameFlags::COMMIT
            } else {
                FrameFlags::NONE
            };
            self.write_frame(tx_id, *page_id, *page_type, bytes, flags)?;
        }
        Ok(())
    }

    /// Durable sync of every appended frame.
    pub fn flush(&self) -> GaldrResult<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }

    /// Updates the WAL header's checkpoint marker. Does not truncate.
    pub fn set_checkpoint_tx_id(&self, tx_id: TxId) -> GaldrResult<()> {
        let mut state = self.state.lock();
        state.header.checkpoint_tx_id = tx_id;
        let bytes = state.header.to_bytes();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&bytes)?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Invalidates every prior frame by bumping `salt1` and randomizing
    /// `salt2`, then reclaims the space those frames occupied. Legal only
    /// when no active transaction holds a snapshot older than the
    /// checkpoint TxId — enforced by the caller (the Transaction Engine).
    pub fn truncate(&self) -> GaldrResult<()> {
        let mut state = self.state.lock();
        state.header.salt1 = state.header.salt1.wrapping_add(1);
        state.header.salt2 = rand::thread_rng().r#gen();
        state.file.set_len(0)?;
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&state.header.to_bytes())?;
        state.file.sync_data()?;
        state.next_frame_number = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn next_frame_number_after_scan(file: &File, header: &WalHeader) -> GaldrResult<u64> {
    let frames = crate::reader::scan_frames(file, header)?;
    Ok(frames.last().map(|f: &Frame| f.frame_number + 1).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::recover;
    use galdr_common::PageType;

    fn page_size() -> u32 {
        4096
    }

    #[test]
    fn write_and_recover_single_committed_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let writer = WalWriter::open(&path, page_size()).unwrap();

        let payload_a = vec![1u8; 10];
        let payload_b = vec![2u8; 10];
        writer
            .write_transaction_batch(
                7,
                &[
                    (1, PageType::Document, payload_a.clone()),
                    (2, PageType::Document, payload_b.clone()),
                ],
            )
            .unwrap();
        writer.flush().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let recovered = recover(&file, &writer.header()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].tx_id, 7);
        assert_eq!(recovered[0].frames.len(), 2);
        assert!(recovered[0].frames[0].payload.starts_with(&payload_a));
        assert!(recovered[0].frames[1].is_commit());
    }

    #[test]
    fn uncommitted_transaction_is_discarded_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let writer = WalWriter::open(&path, page_size()).unwrap();

        writer
            .write_frame(9, 1, PageType::Document, &[5u8; 4], FrameFlags::NONE)
            .unwrap();
        writer.flush().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let recovered = recover(&file, &writer.header()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn auto_commit_frame_is_always_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let writer = WalWriter::open(&path, page_size()).unwrap();

        writer
            .write_frame(
                galdr_common::AUTO_COMMIT_WAL_TX_ID,
                3,
                PageType::Bitmap,
                &[9u8; 4],
                FrameFlags::NONE,
            )
            .unwrap();
        writer.flush().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let recovered = recover(&file, &writer.header()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].tx_id, galdr_common::AUTO_COMMIT_WAL_TX_ID);
    }

    #[test]
    fn truncate_invalidates_prior_frames_via_salt_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let writer = WalWriter::open(&path, page_size()).unwrap();

        writer
            .write_transaction_batch(1, &[(1, PageType::Document, vec![1u8; 4])])
            .unwrap();
        writer.flush().unwrap();
        writer.truncate().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let recovered = recover(&file, &writer.header()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn reopening_existing_wal_continues_frame_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let writer = WalWriter::open(&path, page_size()).unwrap();
            writer
                .write_transaction_batch(1, &[(1, PageType::Document, vec![1u8; 4])])
                .unwrap();
            writer.flush().unwrap();
        }
        let writer = WalWriter::open(&path, page_size()).unwrap();
        let frame_number = writer
            .write_frame(2, 1, PageType::Document, &[2u8; 4], FrameFlags::COMMIT)
            .unwrap();
        assert_eq!(frame_number, 1);
    }
}
