use chrono::{DateTime, Utc};
use icn_types::TokenAmount;
use serde::{Deserialize, Serialize};

/// A participant's spendable funds.
///
/// `balance` always equals
/// `total_deposited + total_earned - total_withdrawn - total_paid - committed`,
/// where `committed` is the sum of this owner's contributions still held in
/// open payment channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub owner: String,
    pub balance: TokenAmount,
    pub total_deposited: TokenAmount,
    pub total_withdrawn: TokenAmount,
    /// Escrow releases credited to this owner as payee.
    pub total_earned: TokenAmount,
    /// Escrow releases paid out of this owner's channels as payer.
    pub total_paid: TokenAmount,
    /// Funds currently held in open channels where this owner is payer.
    pub committed: TokenAmount,
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.into(),
            balance: 0,
            total_deposited: 0,
            total_withdrawn: 0,
            total_earned: 0,
            total_paid: 0,
            committed: 0,
            frozen: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a description of the imbalance, if any.
    pub fn check_invariant(&self) -> Option<String> {
        let inflow = self.total_deposited as i128 + self.total_earned as i128;
        let outflow =
            self.total_withdrawn as i128 + self.total_paid as i128 + self.committed as i128;
        let expected = inflow - outflow;
        if expected != self.balance as i128 {
            return Some(format!(
                "balance {} != deposited {} + earned {} - withdrawn {} - paid {} - committed {}",
                self.balance,
                self.total_deposited,
                self.total_earned,
                self.total_withdrawn,
                self.total_paid,
                self.committed
            ));
        }
        None
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
