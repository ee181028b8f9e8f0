use chrono::{DateTime, Utc};
use icn_types::{ExecutionOutcome, TaskId, TokenAmount};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::Account;
use crate::channel::{
    ActiveEscrow, ChannelId, ChannelState, EscrowReceipt, PaymentChannel, TransactionEntry,
    TransactionKind,
};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger_metrics::*;
use crate::store::{LedgerStore, MemoryLedgerStore};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Re-check invariants on every mutated entity before committing it.
    pub verify_after_mutation: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            verify_after_mutation: cfg!(debug_assertions),
        }
    }
}

type Shared<T> = Arc<Mutex<T>>;

/// The only component allowed to move money.
///
/// Each account and channel sits behind its own mutex; the outer maps are only
/// write-locked to insert new entities. When a call needs a channel and
/// accounts, the channel is locked first, then accounts in owner order.
///
/// Every mutation works on a copy of the entity: the copy is checked, written
/// to the store, and only then swapped in, so a failed call leaves no trace.
pub struct EscrowLedger {
    accounts: RwLock<HashMap<String, Shared<Account>>>,
    channels: RwLock<HashMap<ChannelId, Shared<PaymentChannel>>>,
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    violations: AtomicU64,
}

impl Default for EscrowLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl EscrowLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_store(Arc::new(MemoryLedgerStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            store,
            config,
            violations: AtomicU64::new(0),
        }
    }

    /// Rebuilds a ledger from previously persisted state.
    ///
    /// Channels that fail their invariant on load are frozen.
    pub async fn restore(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> LedgerResult<Self> {
        let accounts = store
            .load_accounts()
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let channels = store
            .load_channels()
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let ledger = Self::with_store(store, config);
        let mut open_channels: i64 = 0;
        {
            let mut map = ledger.accounts.write().await;
            for mut acct in accounts {
                if let Some(detail) = acct.check_invariant() {
                    acct.frozen = true;
                    ledger.flag_violation(&format!("account:{}", acct.owner), &detail);
                }
                map.insert(acct.owner.clone(), Arc::new(Mutex::new(acct)));
            }
        }
        {
            let mut map = ledger.channels.write().await;
            for mut ch in channels {
                if let Some(detail) = ch.check_invariant() {
                    ch.frozen = true;
                    ledger.flag_violation(&format!("channel:{}", ch.id), &detail);
                }
                if !ch.is_closed() {
                    open_channels += 1;
                }
                map.insert(ch.id.clone(), Arc::new(Mutex::new(ch)));
            }
        }
        LEDGER_OPEN_CHANNELS.add(open_channels);
        ledger.verify_conservation().await;
        let accounts = ledger.accounts.read().await.len();
        let channels = ledger.channels.read().await.len();
        info!(store = ledger.store.name(), accounts, channels, "Escrow ledger restored");
        Ok(ledger)
    }

    /// Number of invariant violations detected by this instance.
    pub fn invariant_violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }

    // ---- accounts -------------------------------------------------------

    /// Credits `amount` to `owner`, creating the account if needed. Returns the new balance.
    pub async fn deposit(&self, owner: &str, amount: TokenAmount) -> LedgerResult<TokenAmount> {
        let result = self.deposit_inner(owner, amount).await;
        self.finish("deposit", result)
    }

    async fn deposit_inner(&self, owner: &str, amount: TokenAmount) -> LedgerResult<TokenAmount> {
        ensure_positive(amount)?;
        if owner.is_empty() {
            return Err(LedgerError::InvalidParties("empty owner".into()));
        }
        let entry = self.account_entry_or_create(owner).await;
        let mut acct = entry.lock().await;
        ensure_account_usable(&acct)?;

        let mut next = acct.clone();
        next.balance = checked_add(next.balance, amount)?;
        next.total_deposited = checked_add(next.total_deposited, amount)?;
        next.touch();

        self.check_account(&mut acct, &next)?;
        self.persist(&[&next], &[]).await?;
        *acct = next;
        info!(owner, amount, balance = acct.balance, "Deposit recorded");
        Ok(acct.balance)
    }

    /// Debits `amount` from `owner`. Returns the new balance.
    pub async fn withdraw(&self, owner: &str, amount: TokenAmount) -> LedgerResult<TokenAmount> {
        let result = self.withdraw_inner(owner, amount).await;
        self.finish("withdraw", result)
    }

    async fn withdraw_inner(&self, owner: &str, amount: TokenAmount) -> LedgerResult<TokenAmount> {
        ensure_positive(amount)?;
        let entry = self.account_entry(owner).await?;
        let mut acct = entry.lock().await;
        ensure_account_usable(&acct)?;
        if acct.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                owner: owner.to_string(),
                requested: amount,
                available: acct.balance,
            });
        }

        let mut next = acct.clone();
        next.balance -= amount;
        next.total_withdrawn = checked_add(next.total_withdrawn, amount)?;
        next.touch();

        self.check_account(&mut acct, &next)?;
        self.persist(&[&next], &[]).await?;
        *acct = next;
        info!(owner, amount, balance = acct.balance, "Withdrawal recorded");
        Ok(acct.balance)
    }

    pub async fn get_balance(&self, owner: &str) -> LedgerResult<TokenAmount> {
        let entry = self.account_entry(owner).await?;
        let balance = entry.lock().await.balance;
        Ok(balance)
    }

    /// Snapshot of an account.
    pub async fn account(&self, owner: &str) -> Option<Account> {
        let entry = self.accounts.read().await.get(owner).cloned()?;
        let acct = entry.lock().await.clone();
        Some(acct)
    }

    // ---- channels -------------------------------------------------------

    /// Moves `deposit` from the payer's account into a new channel.
    pub async fn open_channel(
        &self,
        payer: &str,
        payee: &str,
        deposit: TokenAmount,
        auction_ref: Option<&str>,
    ) -> LedgerResult<ChannelId> {
        let result = self.open_channel_inner(payer, payee, deposit, auction_ref).await;
        self.finish("open_channel", result)
    }

    async fn open_channel_inner(
        &self,
        payer: &str,
        payee: &str,
        deposit: TokenAmount,
        auction_ref: Option<&str>,
    ) -> LedgerResult<ChannelId> {
        ensure_positive(deposit)?;
        if payer.is_empty() || payee.is_empty() {
            return Err(LedgerError::InvalidParties("payer and payee are required".into()));
        }
        if payer == payee {
            return Err(LedgerError::InvalidParties(format!(
                "{} cannot open a channel to itself",
                payer
            )));
        }

        let entry = self.account_entry(payer).await?;
        let mut acct = entry.lock().await;
        ensure_account_usable(&acct)?;
        if acct.balance < deposit {
            return Err(LedgerError::InsufficientFunds {
                owner: payer.to_string(),
                requested: deposit,
                available: acct.balance,
            });
        }

        let mut next_acct = acct.clone();
        next_acct.balance -= deposit;
        next_acct.committed = checked_add(next_acct.committed, deposit)?;
        next_acct.touch();

        let id = Uuid::new_v4().to_string();
        let mut channel = PaymentChannel::new(
            id.clone(),
            payer.to_string(),
            payee.to_string(),
            auction_ref.map(str::to_string),
        );
        channel.total_deposit = deposit;
        channel.current_balance = deposit;
        channel.record(TransactionKind::Deposit, deposit, None);
        channel.state = ChannelState::Open;

        self.check_account(&mut acct, &next_acct)?;
        if self.config.verify_after_mutation {
            if let Some(detail) = channel.check_invariant() {
                return Err(self.flag_violation(&format!("channel:{}", id), &detail));
            }
        }

        self.persist(&[&next_acct], &[&channel]).await?;
        self.channels
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(channel)));
        *acct = next_acct;

        LEDGER_CHANNELS_OPENED_TOTAL.inc();
        LEDGER_OPEN_CHANNELS.inc();
        info!(channel_id = %id, payer, payee, deposit, auction_ref = ?auction_ref, "Payment channel opened");
        Ok(id)
    }

    /// Moves `amount` of the channel's spendable balance into escrow for `task_id`.
    pub async fn lock_escrow(
        &self,
        channel_id: &str,
        task_id: &str,
        amount: TokenAmount,
    ) -> LedgerResult<()> {
        let result = self.lock_escrow_inner(channel_id, task_id, amount).await;
        self.finish("lock_escrow", result)
    }

    async fn lock_escrow_inner(
        &self,
        channel_id: &str,
        task_id: &str,
        amount: TokenAmount,
    ) -> LedgerResult<()> {
        ensure_positive(amount)?;
        let entry = self.channel_entry(channel_id).await?;
        let mut ch = entry.lock().await;
        ensure_channel_usable(&ch)?;
        if !matches!(ch.state, ChannelState::Open | ChannelState::Settling) {
            return Err(invalid_state(&ch, "lock escrow on"));
        }
        if ch.receipts.contains_key(task_id) {
            return Err(LedgerError::DuplicateTask {
                channel_id: channel_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        if amount > ch.current_balance {
            return Err(LedgerError::InsufficientChannelBalance {
                channel_id: channel_id.to_string(),
                requested: amount,
                available: ch.current_balance,
            });
        }

        let mut next = ch.clone();
        next.current_balance -= amount;
        next.escrowed_amount = amount;
        next.active_escrow = Some(ActiveEscrow {
            task_id: task_id.to_string(),
            amount,
            locked_at: Utc::now(),
        });
        next.escrow_released = false;
        next.state = ChannelState::Escrowed;
        next.record(TransactionKind::Escrow, amount, Some(task_id.to_string()));

        self.check_channel(&mut ch, &next)?;
        self.persist(&[], &[&next]).await?;
        *ch = next;

        LEDGER_ESCROW_LOCKED_AMOUNT_TOTAL.inc_by(amount);
        info!(channel_id, task_id, amount, sequence = ch.sequence, "Escrow locked");
        Ok(())
    }

    /// Settles the active escrow of `task_id`.
    ///
    /// Success pays the escrow to the payee; failure returns it to the
    /// channel's spendable balance. A repeated call for a task that was
    /// already released returns the first receipt and changes nothing.
    pub async fn release_escrow(
        &self,
        channel_id: &str,
        task_id: &str,
        outcome: ExecutionOutcome,
    ) -> LedgerResult<EscrowReceipt> {
        let result = self.release_escrow_inner(channel_id, task_id, outcome).await;
        self.finish("release_escrow", result)
    }

    async fn release_escrow_inner(
        &self,
        channel_id: &str,
        task_id: &str,
        outcome: ExecutionOutcome,
    ) -> LedgerResult<EscrowReceipt> {
        let entry = self.channel_entry(channel_id).await?;
        let mut ch = entry.lock().await;

        // check-and-set happens under the channel lock
        if let Some(receipt) = ch.receipts.get(task_id) {
            debug!(channel_id, task_id, "Escrow already released; returning stored receipt");
            return Ok(receipt.clone());
        }
        ensure_channel_usable(&ch)?;
        let escrow = match &ch.active_escrow {
            Some(e) if e.task_id == task_id && ch.state == ChannelState::Escrowed => e.clone(),
            _ => {
                return Err(LedgerError::TaskMismatch {
                    channel_id: channel_id.to_string(),
                    task_id: task_id.to_string(),
                })
            }
        };

        let mut next = ch.clone();
        next.escrowed_amount = 0;
        next.active_escrow = None;
        next.escrow_released = true;
        next.state = ChannelState::Settling;

        let receipt = match outcome {
            ExecutionOutcome::Success => {
                next.total_settled = checked_add(next.total_settled, escrow.amount)?;
                next.record(TransactionKind::Release, escrow.amount, Some(task_id.to_string()));

                let payer_entry = self.account_entry(&ch.payer).await?;
                let payee_entry = self.account_entry_or_create(&ch.payee).await;
                let (mut payer, mut payee) =
                    lock_pair(&payer_entry, &payee_entry, ch.payer < ch.payee).await;
                ensure_account_usable(&payer)?;
                ensure_account_usable(&payee)?;

                let mut next_payer = payer.clone();
                next_payer.committed = next_payer.committed.checked_sub(escrow.amount).ok_or_else(|| {
                    self.flag_violation(
                        &format!("account:{}", ch.payer),
                        "release exceeds committed funds",
                    )
                })?;
                next_payer.total_paid = checked_add(next_payer.total_paid, escrow.amount)?;
                next_payer.touch();

                let mut next_payee = payee.clone();
                next_payee.balance = checked_add(next_payee.balance, escrow.amount)?;
                next_payee.total_earned = checked_add(next_payee.total_earned, escrow.amount)?;
                next_payee.touch();

                let receipt = self.receipt(&next, task_id, outcome, escrow.amount);
                next.receipts.insert(task_id.to_string(), receipt.clone());

                self.check_channel(&mut ch, &next)?;
                self.check_account(&mut payer, &next_payer)?;
                self.check_account(&mut payee, &next_payee)?;
                self.persist(&[&next_payer, &next_payee], &[&next]).await?;
                *payer = next_payer;
                *payee = next_payee;
                receipt
            }
            ExecutionOutcome::Failure => {
                next.current_balance = checked_add(next.current_balance, escrow.amount)?;
                next.record(TransactionKind::Refund, escrow.amount, Some(task_id.to_string()));

                let receipt = self.receipt(&next, task_id, outcome, escrow.amount);
                next.receipts.insert(task_id.to_string(), receipt.clone());

                self.check_channel(&mut ch, &next)?;
                self.persist(&[], &[&next]).await?;
                receipt
            }
        };
        *ch = next;

        LEDGER_ESCROW_RELEASED_AMOUNT_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc_by(escrow.amount);
        info!(
            channel_id,
            task_id,
            outcome = outcome.as_str(),
            amount = escrow.amount,
            sequence = ch.sequence,
            "Escrow released"
        );
        Ok(receipt)
    }

    /// Closes the channel and refunds its spendable balance to the payer.
    /// Returns the refunded amount.
    pub async fn close_channel(&self, channel_id: &str) -> LedgerResult<TokenAmount> {
        let result = self.close_channel_inner(channel_id).await;
        self.finish("close_channel", result)
    }

    async fn close_channel_inner(&self, channel_id: &str) -> LedgerResult<TokenAmount> {
        let entry = self.channel_entry(channel_id).await?;
        let mut ch = entry.lock().await;
        ensure_channel_usable(&ch)?;
        if !matches!(ch.state, ChannelState::Open | ChannelState::Settling) || ch.escrowed_amount > 0 {
            return Err(invalid_state(&ch, "close"));
        }

        let refund = ch.current_balance;
        let mut next = ch.clone();
        next.total_deposit -= refund;
        next.total_refunded = checked_add(next.total_refunded, refund)?;
        next.current_balance = 0;
        next.state = ChannelState::Closed;
        next.closed_at = Some(Utc::now());
        next.record(TransactionKind::Close, refund, None);

        let payer_entry = self.account_entry(&ch.payer).await?;
        let mut payer = payer_entry.lock().await;
        ensure_account_usable(&payer)?;
        let mut next_payer = payer.clone();
        next_payer.committed = next_payer.committed.checked_sub(refund).ok_or_else(|| {
            self.flag_violation(&format!("account:{}", ch.payer), "refund exceeds committed funds")
        })?;
        next_payer.balance = checked_add(next_payer.balance, refund)?;
        next_payer.touch();

        self.check_channel(&mut ch, &next)?;
        self.check_account(&mut payer, &next_payer)?;
        self.persist(&[&next_payer], &[&next]).await?;
        *payer = next_payer;
        *ch = next;

        LEDGER_CHANNELS_CLOSED_TOTAL.inc();
        LEDGER_OPEN_CHANNELS.dec();
        info!(channel_id, refund, settled = ch.total_settled, "Payment channel closed");
        Ok(refund)
    }

    /// Recomputes the channel invariant. A violation freezes the channel.
    pub async fn verify_invariant(&self, channel_id: &str) -> LedgerResult<()> {
        let entry = self.channel_entry(channel_id).await?;
        let mut ch = entry.lock().await;
        if let Some(detail) = ch.check_invariant() {
            ch.frozen = true;
            return Err(self.flag_violation(&format!("channel:{}", channel_id), &detail));
        }
        Ok(())
    }

    /// Recomputes the account invariant. A violation freezes the account.
    pub async fn verify_account(&self, owner: &str) -> LedgerResult<()> {
        let entry = self.account_entry(owner).await?;
        let mut acct = entry.lock().await;
        if let Some(detail) = acct.check_invariant() {
            acct.frozen = true;
            return Err(self.flag_violation(&format!("account:{}", owner), &detail));
        }
        Ok(())
    }

    /// Verifies every channel and account, then cross-checks account totals
    /// against the channels behind them. Returns the number of violations found.
    pub async fn verify_all(&self) -> usize {
        let mut failures = 0;
        for id in self.channel_ids().await {
            if self.verify_invariant(&id).await.is_err() {
                failures += 1;
            }
        }
        let owners: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        for owner in owners {
            if self.verify_account(&owner).await.is_err() {
                failures += 1;
            }
        }
        failures + self.verify_conservation().await
    }

    /// A payer's `committed` must equal the funds still held by its channels,
    /// and a payee's `total_earned` the sum settled to it. Accounts that
    /// disagree are frozen. Parties of frozen channels are skipped since those
    /// channels were already reported.
    async fn verify_conservation(&self) -> usize {
        let mut committed: HashMap<String, TokenAmount> = HashMap::new();
        let mut earned: HashMap<String, TokenAmount> = HashMap::new();
        let mut skipped: HashSet<String> = HashSet::new();

        let channels: Vec<Shared<PaymentChannel>> =
            self.channels.read().await.values().cloned().collect();
        for entry in channels {
            let ch = entry.lock().await;
            if ch.frozen {
                skipped.insert(ch.payer.clone());
                skipped.insert(ch.payee.clone());
                continue;
            }
            let held = ch.current_balance.saturating_add(ch.escrowed_amount);
            let c = committed.entry(ch.payer.clone()).or_default();
            *c = c.saturating_add(held);
            let e = earned.entry(ch.payee.clone()).or_default();
            *e = e.saturating_add(ch.total_settled);
        }

        let accounts: Vec<Shared<Account>> =
            self.accounts.read().await.values().cloned().collect();
        let mut failures = 0;
        for entry in accounts {
            let mut acct = entry.lock().await;
            if acct.frozen || skipped.contains(&acct.owner) {
                continue;
            }
            let expected_committed = committed.get(&acct.owner).copied().unwrap_or(0);
            let expected_earned = earned.get(&acct.owner).copied().unwrap_or(0);
            let detail = if acct.committed != expected_committed {
                Some(format!(
                    "committed {} but channels hold {}",
                    acct.committed, expected_committed
                ))
            } else if acct.total_earned != expected_earned {
                Some(format!(
                    "earned {} but channels settled {}",
                    acct.total_earned, expected_earned
                ))
            } else {
                None
            };
            if let Some(detail) = detail {
                acct.frozen = true;
                self.flag_violation(&format!("account:{}", acct.owner), &detail);
                failures += 1;
            }
        }
        failures
    }

    /// Snapshot of a channel, including its audit log.
    pub async fn channel(&self, channel_id: &str) -> Option<PaymentChannel> {
        let entry = self.channels.read().await.get(channel_id).cloned()?;
        let ch = entry.lock().await.clone();
        Some(ch)
    }

    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Every log entry of the channels where `owner` is payer or payee,
    /// oldest first.
    pub async fn transaction_history(&self, owner: &str) -> Vec<(ChannelId, TransactionEntry)> {
        let entries: Vec<Shared<PaymentChannel>> =
            self.channels.read().await.values().cloned().collect();
        let mut history = Vec::new();
        for entry in entries {
            let ch = entry.lock().await;
            if ch.payer == owner || ch.payee == owner {
                history.extend(ch.log.iter().map(|e| (ch.id.clone(), e.clone())));
            }
        }
        history.sort_by(|(a_id, a), (b_id, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a_id.cmp(b_id))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        history
    }

    /// Escrows locked before `now - max_hold` that are still outstanding.
    pub async fn expired_escrows(
        &self,
        now: DateTime<Utc>,
        max_hold: Duration,
    ) -> Vec<(ChannelId, TaskId)> {
        let max_hold = match chrono::Duration::from_std(max_hold) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let entries: Vec<Shared<PaymentChannel>> =
            self.channels.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for entry in entries {
            let ch = entry.lock().await;
            if ch.frozen {
                continue;
            }
            if let Some(escrow) = &ch.active_escrow {
                if now.signed_duration_since(escrow.locked_at) >= max_hold {
                    expired.push((ch.id.clone(), escrow.task_id.clone()));
                }
            }
        }
        expired
    }

    // ---- internals ------------------------------------------------------

    async fn account_entry(&self, owner: &str) -> LedgerResult<Shared<Account>> {
        self.accounts
            .read()
            .await
            .get(owner)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(owner.to_string()))
    }

    async fn account_entry_or_create(&self, owner: &str) -> Shared<Account> {
        if let Some(entry) = self.accounts.read().await.get(owner) {
            return entry.clone();
        }
        self.accounts
            .write()
            .await
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(owner))))
            .clone()
    }

    async fn channel_entry(&self, channel_id: &str) -> LedgerResult<Shared<PaymentChannel>> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .cloned()
            .ok_or_else(|| LedgerError::ChannelNotFound(channel_id.to_string()))
    }

    fn receipt(
        &self,
        next: &PaymentChannel,
        task_id: &str,
        outcome: ExecutionOutcome,
        amount: TokenAmount,
    ) -> EscrowReceipt {
        EscrowReceipt {
            channel_id: next.id.clone(),
            task_id: task_id.to_string(),
            outcome,
            amount,
            sequence: next.sequence,
            released_at: Utc::now(),
        }
    }

    fn check_channel(&self, current: &mut PaymentChannel, next: &PaymentChannel) -> LedgerResult<()> {
        if !self.config.verify_after_mutation {
            return Ok(());
        }
        if let Some(detail) = next.check_invariant() {
            current.frozen = true;
            return Err(self.flag_violation(&format!("channel:{}", current.id), &detail));
        }
        Ok(())
    }

    fn check_account(&self, current: &mut Account, next: &Account) -> LedgerResult<()> {
        if !self.config.verify_after_mutation {
            return Ok(());
        }
        if let Some(detail) = next.check_invariant() {
            current.frozen = true;
            return Err(self.flag_violation(&format!("account:{}", current.owner), &detail));
        }
        Ok(())
    }

    fn flag_violation(&self, entity: &str, detail: &str) -> LedgerError {
        self.violations.fetch_add(1, Ordering::SeqCst);
        LEDGER_INVARIANT_VIOLATIONS_TOTAL.inc();
        error!(entity, detail, "LEDGER INVARIANT VIOLATION; entity frozen");
        LedgerError::InvariantViolation {
            entity: entity.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Writes every entity touched by one operation as a single batch.
    async fn persist(&self, accounts: &[&Account], channels: &[&PaymentChannel]) -> LedgerResult<()> {
        self.store.commit(accounts, channels).await.map_err(|e| {
            let owners: Vec<&str> = accounts.iter().map(|a| a.owner.as_str()).collect();
            let channel_ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
            error!(
                store = self.store.name(),
                ?owners,
                ?channel_ids,
                error = %e,
                "Failed to persist ledger batch"
            );
            LedgerError::Storage(e.to_string())
        })
    }

    fn finish<T>(&self, operation: &'static str, result: LedgerResult<T>) -> LedgerResult<T> {
        record_operation(operation, &result);
        if let Err(e) = &result {
            if e.is_validation() {
                debug!(operation, error = %e, "Ledger request rejected");
            } else if !e.is_fatal() {
                warn!(operation, error = %e, "Ledger operation refused");
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) async fn tamper_channel(&self, channel_id: &str, f: impl FnOnce(&mut PaymentChannel)) {
        if let Some(entry) = self.channels.read().await.get(channel_id) {
            f(&mut *entry.lock().await);
        }
    }
}

fn ensure_positive(amount: TokenAmount) -> LedgerResult<()> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn checked_add(a: TokenAmount, b: TokenAmount) -> LedgerResult<TokenAmount> {
    a.checked_add(b).ok_or(LedgerError::InvalidAmount(b))
}

fn ensure_account_usable(acct: &Account) -> LedgerResult<()> {
    if acct.frozen {
        return Err(LedgerError::AccountFrozen(acct.owner.clone()));
    }
    Ok(())
}

fn ensure_channel_usable(ch: &PaymentChannel) -> LedgerResult<()> {
    if ch.frozen {
        return Err(LedgerError::ChannelFrozen(ch.id.clone()));
    }
    Ok(())
}

fn invalid_state(ch: &PaymentChannel, operation: &'static str) -> LedgerError {
    LedgerError::InvalidChannelState {
        channel_id: ch.id.clone(),
        state: ch.state,
        operation,
    }
}

/// Locks two accounts in a fixed global order and hands the guards back as `(a, b)`.
async fn lock_pair<'a>(
    a: &'a Shared<Account>,
    b: &'a Shared<Account>,
    a_first: bool,
) -> (MutexGuard<'a, Account>, MutexGuard<'a, Account>) {
    if a_first {
        let ga = a.lock().await;
        let gb = b.lock().await;
        (ga, gb)
    } else {
        let gb = b.lock().await;
        let ga = a.lock().await;
        (ga, gb)
    }
}
