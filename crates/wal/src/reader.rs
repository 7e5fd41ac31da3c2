//! Recovery scan over a WAL file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use galdr_common::{GaldrResult, TxId, AUTO_COMMIT_WAL_TX_ID};

use crate::frame::{decode_frame, Frame, WalHeader, FRAME_HEADER_SIZE, WAL_HEADER_SIZE};

/// Reads every well-formed frame starting right after the WAL header,
/// stopping at the first frame that fails to decode (torn write, or a
/// frame from a since-invalidated salt epoch).
pub(crate) fn scan_frames(file: &File, header: &WalHeader) -> GaldrResult<Vec<Frame>> {
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
    let frame_size = FRAME_HEADER_SIZE + header.page_size as usize;
    let mut buf = vec![0u8; frame_size];
    let mut frames = Vec::new();

    loop {
        let mut read_total = 0;
        while read_total < frame_size {
            match file.read(&mut buf[read_total..])? {
                0 => break,
                n => read_total += n,
            }
        }
        if read_total < frame_size {
            break;
        }
        match decode_frame(&buf, header.page_size as usize, header.salt1, header.salt2) {
            Some(frame) => frames.push(frame),
            None => break,
        }
    }
    Ok(frames)
}

/// A transaction's frames as resolved by the recovery scan: committed
/// transactions replay every touched page in frame order; uncommitted
/// ones are discarded entirely.
pub struct RecoveredTransaction {
    pub tx_id: TxId,
    pub frames: Vec<Frame>,
}

/// Scans `file` and groups its well-formed frames by transaction,
/// keeping only committed transactions in frame (append) order. A
/// frame with `tx_id == AUTO_COMMIT_WAL_TX_ID` is always treated as an
/// already-committed singleton (maintenance writes outside any user
/// transaction, e.g. page manager growth).
pub fn recover(file: &File, header: &WalHeader) -> GaldrResult<Vec<RecoveredTransaction>> {
    let frames = scan_frames(file, header)?;

    let mut by_tx: BTreeMap<TxId, Vec<Frame>> = BTreeMap::new();
    let mut committed: Vec<TxId> = Vec::new();
    let mut order: Vec<TxId> = Vec::new();

    for frame in frames {
        let tx_id = frame.tx_id;
        if !by_tx.contains_key(&tx_id) {
            order.push(tx_id);
        }
        let is_commit = frame.is_commit() || tx_id == AUTO_COMMIT_WAL_TX_ID;
        by_tx.entry(tx_id).or_default().push(frame);
        if is_commit && !committed.contains(&tx_id) {
            committed.push(tx_id);
        }
    }

    let mut out = Vec::new();
    for tx_id in order {
        if !committed.contains(&tx_id) {
            continue;
        }
        if let Some(frames) = by_tx.remove(&tx_id) {
            out.push(RecoveredTransaction { tx_id, frames });
        }
    }
    Ok(out)
}

/// Convenience wrapper bundling a WAL file handle with its header, used
/// by the engine crate's recovery path.
pub struct WalReader {
    file: File,
    header: WalHeader,
}

impl WalReader {
    pub fn open(path: &std::path::Path) -> GaldrResult<Self> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = WalHeader::from_bytes(&buf)?;
        Ok(Self { file, header })
    }

    pub fn header(&self) -> WalHeader {
        self.header
    }

    pub fn recover(&self) -> GaldrResult<Vec<RecoveredTransaction>> {
        recover(&self.file, &self.header)
    }
}
