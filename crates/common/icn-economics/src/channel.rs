use chrono::{DateTime, Utc};
use icn_types::{ExecutionOutcome, TaskId, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ChannelId = String;

/// Lifecycle of a payment channel.
///
/// `Opening -> Open -> Escrowed -> Settling -> Closed`. A channel in
/// `Settling` may lock a new escrow or be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Opening,
    Open,
    Escrowed,
    Settling,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Escrow,
    Release,
    Refund,
    Close,
}

/// One audit log entry. Balances are the values after the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub sequence: u64,
    pub kind: TransactionKind,
    pub amount: TokenAmount,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub current_balance: TokenAmount,
    pub escrowed_amount: TokenAmount,
    pub total_settled: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEscrow {
    pub task_id: TaskId,
    pub amount: TokenAmount,
    pub locked_at: DateTime<Utc>,
}

/// Result of releasing an escrow. Replayed verbatim on repeated releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReceipt {
    pub channel_id: ChannelId,
    pub task_id: TaskId,
    pub outcome: ExecutionOutcome,
    /// Amount paid to the payee on success, or returned to the channel on failure.
    pub amount: TokenAmount,
    pub sequence: u64,
    pub released_at: DateTime<Utc>,
}

/// Bilateral channel between a payer and a payee.
///
/// `total_deposit == current_balance + escrowed_amount + total_settled`
/// holds before and after every ledger operation. Funds returned to the payer
/// on close leave `total_deposit` and are tracked in `total_refunded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub id: ChannelId,
    pub payer: String,
    pub payee: String,
    /// Auction that produced this channel, if any.
    pub auction_ref: Option<String>,
    pub total_deposit: TokenAmount,
    pub current_balance: TokenAmount,
    pub escrowed_amount: TokenAmount,
    pub total_settled: TokenAmount,
    pub total_refunded: TokenAmount,
    pub state: ChannelState,
    pub sequence: u64,
    /// Set when the active escrow has been released; cleared by the next lock.
    pub escrow_released: bool,
    pub active_escrow: Option<ActiveEscrow>,
    pub receipts: BTreeMap<TaskId, EscrowReceipt>,
    pub frozen: bool,
    pub log: Vec<TransactionEntry>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PaymentChannel {
    pub(crate) fn new(
        id: ChannelId,
        payer: String,
        payee: String,
        auction_ref: Option<String>,
    ) -> Self {
        Self {
            id,
            payer,
            payee,
            auction_ref,
            total_deposit: 0,
            current_balance: 0,
            escrowed_amount: 0,
            total_settled: 0,
            total_refunded: 0,
            state: ChannelState::Opening,
            sequence: 0,
            escrow_released: false,
            active_escrow: None,
            receipts: BTreeMap::new(),
            frozen: false,
            log: Vec::new(),
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Returns a description of the imbalance, if any.
    pub fn check_invariant(&self) -> Option<String> {
        let parts = self.current_balance as u128
            + self.escrowed_amount as u128
            + self.total_settled as u128;
        if parts != self.total_deposit as u128 {
            return Some(format!(
                "total_deposit {} != current {} + escrowed {} + settled {}",
                self.total_deposit, self.current_balance, self.escrowed_amount, self.total_settled
            ));
        }
        let escrow_held = self.active_escrow.as_ref().map(|e| e.amount).unwrap_or(0);
        if escrow_held != self.escrowed_amount {
            return Some(format!(
                "escrowed {} does not match active escrow {}",
                self.escrowed_amount, escrow_held
            ));
        }
        None
    }

    /// Bumps the sequence number and appends an audit entry.
    pub(crate) fn record(&mut self, kind: TransactionKind, amount: TokenAmount, task_id: Option<TaskId>) {
        self.sequence += 1;
        self.log.push(TransactionEntry {
            sequence: self.sequence,
            kind,
            amount,
            task_id,
            timestamp: Utc::now(),
            current_balance: self.current_balance,
            escrowed_amount: self.escrowed_amount,
            total_settled: self.total_settled,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }
}
