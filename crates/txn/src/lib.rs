//! Transaction bookkeeping: TxId allocation and the active-transaction
//! set, plus a page-structural latch table used by the Transaction
//! Engine's serialized commit path.

mod latch;
mod manager;

pub use latch::{DeadlockPolicy, LatchMode, LatchTable};
pub use manager::TransactionManager;

pub use galdr_common::{GaldrError, GaldrResult, PageId, TxId};
