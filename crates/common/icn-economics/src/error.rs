use icn_types::TokenAmount;
use thiserror::Error;

use crate::channel::ChannelState;

/// Failures returned by [`crate::EscrowLedger`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(TokenAmount),

    #[error("Insufficient funds for {owner}: requested {requested}, available {available}")]
    InsufficientFunds {
        owner: String,
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("Insufficient balance in channel {channel_id}: requested {requested}, available {available}")]
    InsufficientChannelBalance {
        channel_id: String,
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Cannot {operation} channel {channel_id} in state {state:?}")]
    InvalidChannelState {
        channel_id: String,
        state: ChannelState,
        operation: &'static str,
    },

    #[error("Invalid channel parties: {0}")]
    InvalidParties(String),

    #[error("Task {task_id} does not hold the active escrow on channel {channel_id}")]
    TaskMismatch { channel_id: String, task_id: String },

    #[error("Task {task_id} already used an escrow on channel {channel_id}")]
    DuplicateTask { channel_id: String, task_id: String },

    #[error("Channel {0} is frozen after an invariant violation")]
    ChannelFrozen(String),

    #[error("Account {0} is frozen after an invariant violation")]
    AccountFrozen(String),

    #[error("Ledger invariant violated on {entity}: {detail}")]
    InvariantViolation { entity: String, detail: String },

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::InsufficientChannelBalance { .. } => "insufficient_channel_balance",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::ChannelNotFound(_) => "channel_not_found",
            LedgerError::InvalidChannelState { .. } => "invalid_channel_state",
            LedgerError::InvalidParties(_) => "invalid_parties",
            LedgerError::TaskMismatch { .. } => "task_mismatch",
            LedgerError::DuplicateTask { .. } => "duplicate_task",
            LedgerError::ChannelFrozen(_) => "channel_frozen",
            LedgerError::AccountFrozen(_) => "account_frozen",
            LedgerError::InvariantViolation { .. } => "invariant_violation",
            LedgerError::Storage(_) => "storage",
        }
    }
}

impl LedgerError {
    /// Rejected before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_) | LedgerError::InvalidParties(_)
        )
    }

    /// Requires operator attention rather than a caller retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::InvariantViolation { .. }
                | LedgerError::ChannelFrozen(_)
                | LedgerError::AccountFrozen(_)
                | LedgerError::Storage(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
