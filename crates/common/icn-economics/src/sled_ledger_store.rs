use crate::ledger_metrics::store_error;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionResult;
use sled::{Db, Transactional};
use tracing::error;

use crate::account::Account;
use crate::channel::PaymentChannel;
use crate::store::LedgerStore;

const ACCOUNTS_TREE_NAME: &str = "accounts";
const CHANNELS_TREE_NAME: &str = "channels";

/// A LedgerStore backed by Sled, one tree per table, values encoded with bincode.
#[derive(Clone)] // sled::Db is Arc internally
pub struct SledLedgerStore {
    db: Db,
}

impl SledLedgerStore {
    /// Opens or creates a Sled database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).context("Failed to open Sled database for escrow ledger")?;
        db.open_tree(ACCOUNTS_TREE_NAME)
            .context("Failed to open accounts tree in Sled database")?;
        db.open_tree(CHANNELS_TREE_NAME)
            .context("Failed to open channels tree in Sled database")?;
        Ok(Self { db })
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db.open_tree(name).map_err(|e| {
            store_error("sled", "open_tree", "io");
            anyhow!("Failed to access {} tree: {}", name, e)
        })
    }

    fn encode<T: Serialize>(tree_name: &str, key: &str, value: &T) -> Result<(Vec<u8>, Vec<u8>)> {
        let bytes = bincode::serialize(value).map_err(|e| {
            store_error("sled", "commit", "serialization");
            error!(tree = tree_name, key, error = %e, "Failed to serialize ledger entity");
            anyhow!("Serialization error for {} in {}: {}", key, tree_name, e)
        })?;
        Ok((key.as_bytes().to_vec(), bytes))
    }

    /// Writes both batches in one multi-tree transaction.
    fn write_batch(&self, accounts: &[(Vec<u8>, Vec<u8>)], channels: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let accounts_tree = self.tree(ACCOUNTS_TREE_NAME)?;
        let channels_tree = self.tree(CHANNELS_TREE_NAME)?;
        let result: TransactionResult<(), ()> =
            (&accounts_tree, &channels_tree).transaction(|(tx_accounts, tx_channels)| {
                for (key, value) in accounts {
                    tx_accounts.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in channels {
                    tx_channels.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            });
        result.map_err(|e| {
            store_error("sled", "commit", "io");
            error!(error = ?e, "Ledger commit transaction failed");
            anyhow!("Sled commit transaction failed: {:?}", e)
        })
    }

    fn load_all<T: DeserializeOwned>(&self, tree_name: &str) -> Result<Vec<T>> {
        let tree = self.tree(tree_name)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (key, value) = item.map_err(|e| {
                store_error("sled", "load", "io");
                anyhow!("Sled iteration I/O error in {}: {}", tree_name, e)
            })?;
            let entity = bincode::deserialize::<T>(&value).map_err(|e| {
                store_error("sled", "load", "deserialization");
                let key = String::from_utf8_lossy(&key).to_string();
                error!(tree = tree_name, %key, error = %e, "Failed to deserialize ledger entity");
                // corrupt data must not be skipped silently
                anyhow!("Failed to deserialize {} in {}: {}", key, tree_name, e)
            })?;
            out.push(entity);
        }
        Ok(out)
    }

    /// Flushes pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .context("Failed to flush escrow ledger database")?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SledLedgerStore {
    async fn commit(&self, accounts: &[&Account], channels: &[&PaymentChannel]) -> Result<()> {
        let accounts = accounts
            .iter()
            .map(|a| Self::encode(ACCOUNTS_TREE_NAME, &a.owner, *a))
            .collect::<Result<Vec<_>>>()?;
        let channels = channels
            .iter()
            .map(|c| Self::encode(CHANNELS_TREE_NAME, &c.id, *c))
            .collect::<Result<Vec<_>>>()?;
        self.write_batch(&accounts, &channels)
    }

    async fn load_accounts(&self) -> Result<Vec<Account>> {
        self.load_all(ACCOUNTS_TREE_NAME)
    }

    async fn load_channels(&self) -> Result<Vec<PaymentChannel>> {
        self.load_all(CHANNELS_TREE_NAME)
    }

    fn name(&self) -> &'static str {
        "sled"
    }
}
