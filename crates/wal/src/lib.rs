//! Write-ahead log: binary frame format, a single-writer append path, and
//! the recovery scan that replays committed transactions.

mod frame;
mod reader;
mod writer;

pub use frame::{
    decode_frame, encode_frame, Frame, FrameFlags, WalHeader, FRAME_HEADER_SIZE, WAL_HEADER_SIZE,
};
pub use reader::{recover, RecoveredTransaction, WalReader};
pub use writer::WalWriter;

pub use galdr_common::{GaldrError, GaldrResult, PageId, PageType, TxId};
