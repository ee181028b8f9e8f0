use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::account::Account;
use crate::channel::{ChannelId, PaymentChannel};

/// Durable backing for the escrow ledger.
///
/// `commit` writes every entity touched by one ledger operation as a single
/// atomic batch: either all of them are stored or none is. The ledger calls
/// it while it still holds the entity locks, so a read after a successful
/// commit always observes it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn commit(&self, accounts: &[&Account], channels: &[&PaymentChannel]) -> Result<()>;

    async fn load_accounts(&self) -> Result<Vec<Account>>;

    async fn load_channels(&self) -> Result<Vec<PaymentChannel>>;

    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    channels: HashMap<ChannelId, PaymentChannel>,
}

/// Keeps the latest copy of each entity in memory.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn commit(&self, accounts: &[&Account], channels: &[&PaymentChannel]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for account in accounts {
            tables
                .accounts
                .insert(account.owner.clone(), (*account).clone());
        }
        for channel in channels {
            tables
                .channels
                .insert(channel.id.clone(), (*channel).clone());
        }
        Ok(())
    }

    async fn load_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.tables.read().await.accounts.values().cloned().collect())
    }

    async fn load_channels(&self) -> Result<Vec<PaymentChannel>> {
        Ok(self.tables.read().await.channels.values().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
