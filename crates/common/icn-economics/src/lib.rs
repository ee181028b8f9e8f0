#![forbid(unsafe_code)]

pub mod account;
pub mod channel;
pub mod error;
pub mod ledger;
pub mod ledger_metrics;
pub mod sled_ledger_store;
pub mod store;

pub use account::Account;
pub use channel::{
    ActiveEscrow, ChannelId, ChannelState, EscrowReceipt, PaymentChannel, TransactionEntry,
    TransactionKind,
};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{EscrowLedger, LedgerConfig};
pub use sled_ledger_store::SledLedgerStore;
pub use store::{LedgerStore, MemoryLedgerStore};
