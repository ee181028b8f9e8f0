use async_trait::async_trait;
use icn_economics::{
    Account, ChannelState, EscrowLedger, LedgerConfig, LedgerError, LedgerStore,
    MemoryLedgerStore, PaymentChannel, SledLedgerStore, TransactionKind,
};
use icn_types::ExecutionOutcome;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store whose next commit can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryLedgerStore,
    fail_next: AtomicBool,
}

impl FlakyStore {
    fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn commit(&self, accounts: &[&Account], channels: &[&PaymentChannel]) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("write refused");
        }
        self.inner.commit(accounts, channels).await
    }

    async fn load_accounts(&self) -> anyhow::Result<Vec<Account>> {
        self.inner.load_accounts().await
    }

    async fn load_channels(&self) -> anyhow::Result<Vec<PaymentChannel>> {
        self.inner.load_channels().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn strict_config() -> LedgerConfig {
    LedgerConfig {
        verify_after_mutation: true,
    }
}

fn ledger() -> EscrowLedger {
    EscrowLedger::new(LedgerConfig {
        verify_after_mutation: true,
    })
}

async fn assert_channel_balanced(ledger: &EscrowLedger, channel_id: &str) {
    let ch = ledger.channel(channel_id).await.unwrap();
    assert_eq!(
        ch.total_deposit,
        ch.current_balance + ch.escrowed_amount + ch.total_settled,
        "channel {} out of balance: {:?}",
        channel_id,
        ch
    );
}

#[tokio::test]
async fn deposit_and_withdraw() {
    let ledger = ledger();
    assert_eq!(ledger.deposit("alice", 100).await.unwrap(), 100);
    assert_eq!(ledger.withdraw("alice", 30).await.unwrap(), 70);
    assert_eq!(ledger.get_balance("alice").await.unwrap(), 70);

    let acct = ledger.account("alice").await.unwrap();
    assert_eq!(acct.total_deposited, 100);
    assert_eq!(acct.total_withdrawn, 30);
}

#[tokio::test]
async fn rejects_zero_amounts_and_overdrafts() {
    let ledger = ledger();
    assert_eq!(
        ledger.deposit("alice", 0).await.unwrap_err(),
        LedgerError::InvalidAmount(0)
    );
    ledger.deposit("alice", 10).await.unwrap();
    let err = ledger.withdraw("alice", 11).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientFunds {
            requested: 11,
            available: 10,
            ..
        }
    ));
    assert_eq!(ledger.get_balance("alice").await.unwrap(), 10);
    assert!(matches!(
        ledger.withdraw("nobody", 1).await.unwrap_err(),
        LedgerError::AccountNotFound(_)
    ));
}

#[tokio::test]
async fn open_channel_commits_payer_funds() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger
        .open_channel("alice", "bob", 60, Some("auction-1"))
        .await
        .unwrap();

    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.state, ChannelState::Open);
    assert_eq!(channel.current_balance, 60);
    assert_eq!(channel.auction_ref.as_deref(), Some("auction-1"));
    assert_eq!(channel.log.len(), 1);
    assert_eq!(channel.log[0].kind, TransactionKind::Deposit);

    let alice = ledger.account("alice").await.unwrap();
    assert_eq!(alice.balance, 40);
    assert_eq!(alice.committed, 60);

    assert!(matches!(
        ledger.open_channel("alice", "bob", 41, None).await.unwrap_err(),
        LedgerError::InsufficientFunds { .. }
    ));
    assert!(matches!(
        ledger.open_channel("alice", "alice", 1, None).await.unwrap_err(),
        LedgerError::InvalidParties(_)
    ));
}

#[tokio::test]
async fn lock_escrow_rejects_overdraw_and_second_escrow() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 50, None).await.unwrap();

    let err = ledger.lock_escrow(&ch, "t1", 51).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientChannelBalance {
            requested: 51,
            available: 50,
            ..
        }
    ));

    ledger.lock_escrow(&ch, "t1", 20).await.unwrap();
    let err = ledger.lock_escrow(&ch, "t2", 10).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidChannelState {
            state: ChannelState::Escrowed,
            ..
        }
    ));
    assert_channel_balanced(&ledger, &ch).await;
}

#[tokio::test]
async fn successful_release_pays_payee() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 50, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 50).await.unwrap();

    let receipt = ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    assert_eq!(receipt.amount, 50);
    assert_eq!(receipt.outcome, ExecutionOutcome::Success);

    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.state, ChannelState::Settling);
    assert_eq!(channel.total_settled, 50);
    assert_eq!(channel.escrowed_amount, 0);
    assert!(channel.escrow_released);

    let bob = ledger.account("bob").await.unwrap();
    assert_eq!(bob.balance, 50);
    assert_eq!(bob.total_earned, 50);
    let alice = ledger.account("alice").await.unwrap();
    assert_eq!(alice.total_paid, 50);
    assert_eq!(alice.committed, 0);
    assert_eq!(alice.balance, 50);
}

#[tokio::test]
async fn failed_release_refunds_channel_then_close_refunds_payer() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 50, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 50).await.unwrap();

    ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Failure)
        .await
        .unwrap();
    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.current_balance, 50);
    assert_eq!(channel.total_settled, 0);
    assert_eq!(channel.log.last().unwrap().kind, TransactionKind::Refund);
    assert!(ledger.account("bob").await.is_none());

    let refunded = ledger.close_channel(&ch).await.unwrap();
    assert_eq!(refunded, 50);
    assert_eq!(ledger.get_balance("alice").await.unwrap(), 100);

    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.state, ChannelState::Closed);
    assert_eq!(channel.total_refunded, 50);
    assert_channel_balanced(&ledger, &ch).await;
}

#[tokio::test]
async fn release_twice_is_a_no_op() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 40, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 40).await.unwrap();

    let first = ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    let after_first = ledger.channel(&ch).await.unwrap();
    let bob_after_first = ledger.account("bob").await.unwrap();

    // even a conflicting outcome replays the original receipt
    let second = ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Failure)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.channel(&ch).await.unwrap(), after_first);
    assert_eq!(ledger.account("bob").await.unwrap(), bob_after_first);
}

#[tokio::test]
async fn concurrent_releases_pay_exactly_once() {
    let ledger = Arc::new(ledger());
    ledger.deposit("alice", 1_000).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 500, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 500).await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = ledger.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                ledger
                    .release_escrow(&ch, "t1", ExecutionOutcome::Success)
                    .await
            })
        })
        .collect();
    let receipts: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(receipts.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(ledger.get_balance("bob").await.unwrap(), 500);
    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.total_settled, 500);
    // deposit, escrow, release
    assert_eq!(channel.sequence, 3);
}

#[tokio::test]
async fn release_for_unknown_task_is_rejected() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 40, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 40).await.unwrap();

    assert!(matches!(
        ledger
            .release_escrow(&ch, "t2", ExecutionOutcome::Success)
            .await
            .unwrap_err(),
        LedgerError::TaskMismatch { .. }
    ));
}

#[tokio::test]
async fn close_is_rejected_while_escrow_outstanding() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 40, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 10).await.unwrap();

    assert!(matches!(
        ledger.close_channel(&ch).await.unwrap_err(),
        LedgerError::InvalidChannelState { .. }
    ));

    ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    assert_eq!(ledger.close_channel(&ch).await.unwrap(), 30);
    assert!(matches!(
        ledger.close_channel(&ch).await.unwrap_err(),
        LedgerError::InvalidChannelState {
            state: ChannelState::Closed,
            ..
        }
    ));

    let alice = ledger.account("alice").await.unwrap();
    assert_eq!(alice.balance, 90);
    assert_eq!(alice.committed, 0);
}

#[tokio::test]
async fn sequence_numbers_strictly_increase() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 90, None).await.unwrap();
    for i in 0..3 {
        let task = format!("t{}", i);
        ledger.lock_escrow(&ch, &task, 10).await.unwrap();
        ledger
            .release_escrow(&ch, &task, ExecutionOutcome::Success)
            .await
            .unwrap();
    }
    ledger.close_channel(&ch).await.unwrap();

    let channel = ledger.channel(&ch).await.unwrap();
    let seqs: Vec<u64> = channel.log.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    assert_eq!(channel.total_settled, 30);
    assert_eq!(channel.total_refunded, 60);
}

#[tokio::test]
async fn random_operation_sequences_preserve_invariants() {
    let ledger = ledger();
    let mut rng = StdRng::seed_from_u64(7);
    let owners = ["alice", "bob", "carol"];
    let mut channels: Vec<String> = Vec::new();
    let mut task_counter = 0u32;

    for _ in 0..400 {
        let owner = owners[rng.gen_range(0..owners.len())];
        let amount = rng.gen_range(0..60);
        match rng.gen_range(0..6) {
            0 => {
                let _ = ledger.deposit(owner, amount).await;
            }
            1 => {
                let _ = ledger.withdraw(owner, amount).await;
            }
            2 => {
                let payee = owners[rng.gen_range(0..owners.len())];
                if let Ok(id) = ledger.open_channel(owner, payee, amount, None).await {
                    channels.push(id);
                }
            }
            3 if !channels.is_empty() => {
                let ch = &channels[rng.gen_range(0..channels.len())];
                task_counter += 1;
                let _ = ledger
                    .lock_escrow(ch, &format!("task-{}", task_counter), amount)
                    .await;
            }
            4 if !channels.is_empty() => {
                let ch = &channels[rng.gen_range(0..channels.len())];
                if let Some(escrow) = ledger.channel(ch).await.unwrap().active_escrow {
                    let outcome = if rng.gen_bool(0.5) {
                        ExecutionOutcome::Success
                    } else {
                        ExecutionOutcome::Failure
                    };
                    ledger
                        .release_escrow(ch, &escrow.task_id, outcome)
                        .await
                        .unwrap();
                }
            }
            5 if !channels.is_empty() => {
                let ch = &channels[rng.gen_range(0..channels.len())];
                let _ = ledger.close_channel(ch).await;
            }
            _ => {}
        }

        for ch in &channels {
            assert_channel_balanced(&ledger, ch).await;
        }
    }

    assert_eq!(ledger.verify_all().await, 0);
    assert_eq!(ledger.invariant_violations(), 0);

    // money is conserved across the whole ledger
    let mut deposited = 0u64;
    let mut withdrawn = 0u64;
    let mut held = 0u64;
    for owner in owners {
        if let Some(acct) = ledger.account(owner).await {
            deposited += acct.total_deposited;
            withdrawn += acct.total_withdrawn;
            held += acct.balance;
        }
    }
    for ch in &channels {
        let c = ledger.channel(ch).await.unwrap();
        held += c.current_balance + c.escrowed_amount;
    }
    assert_eq!(deposited - withdrawn, held);
}

#[tokio::test]
async fn expired_escrows_are_reported() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 40, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 40).await.unwrap();

    let now = chrono::Utc::now();
    assert!(ledger
        .expired_escrows(now, Duration::from_secs(60))
        .await
        .is_empty());
    let later = now + chrono::Duration::seconds(61);
    assert_eq!(
        ledger.expired_escrows(later, Duration::from_secs(60)).await,
        vec![(ch.clone(), "t1".to_string())]
    );
}

#[tokio::test]
async fn restores_from_sled_store() {
    let dir = tempfile::tempdir().unwrap();
    let ch = {
        let store = Arc::new(SledLedgerStore::open(dir.path()).unwrap());
        let ledger = EscrowLedger::with_store(store.clone(), LedgerConfig::default());
        ledger.deposit("alice", 100).await.unwrap();
        let ch = ledger.open_channel("alice", "bob", 60, None).await.unwrap();
        ledger.lock_escrow(&ch, "t1", 25).await.unwrap();
        store.flush().await.unwrap();
        ch
    };

    let store = Arc::new(SledLedgerStore::open(dir.path()).unwrap());
    let ledger = EscrowLedger::restore(store, LedgerConfig::default())
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("alice").await.unwrap(), 40);
    let channel = ledger.channel(&ch).await.unwrap();
    assert_eq!(channel.state, ChannelState::Escrowed);
    assert_eq!(channel.escrowed_amount, 25);

    // the restored escrow can still be settled
    ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("bob").await.unwrap(), 25);
    assert_eq!(ledger.invariant_violations(), 0);
}

#[tokio::test]
async fn failed_open_channel_commit_leaves_no_partial_state() {
    let store = Arc::new(FlakyStore::default());
    let ledger = EscrowLedger::with_store(store.clone(), strict_config());
    ledger.deposit("alice", 100).await.unwrap();

    store.fail_next_commit();
    let err = ledger.open_channel("alice", "bob", 60, None).await.unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
    assert!(ledger.channel_ids().await.is_empty());
    assert_eq!(ledger.get_balance("alice").await.unwrap(), 100);

    let restored = EscrowLedger::restore(store.clone(), strict_config())
        .await
        .unwrap();
    let alice = restored.account("alice").await.unwrap();
    assert_eq!(alice.balance, 100);
    assert_eq!(alice.committed, 0);
    assert!(restored.channel_ids().await.is_empty());
    assert_eq!(restored.verify_all().await, 0);

    let ch = restored.open_channel("alice", "bob", 60, None).await.unwrap();
    restored.lock_escrow(&ch, "t1", 60).await.unwrap();
    assert_eq!(restored.invariant_violations(), 0);
}

#[tokio::test]
async fn failed_release_commit_can_be_retried_after_restore() {
    let store = Arc::new(FlakyStore::default());
    let ledger = EscrowLedger::with_store(store.clone(), strict_config());
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 60, None).await.unwrap();
    ledger.lock_escrow(&ch, "t1", 60).await.unwrap();

    store.fail_next_commit();
    let err = ledger
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(ledger.channel(&ch).await.unwrap().state, ChannelState::Escrowed);

    let restored = EscrowLedger::restore(store.clone(), strict_config())
        .await
        .unwrap();
    assert_eq!(restored.verify_all().await, 0);
    let receipt = restored
        .release_escrow(&ch, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    assert_eq!(receipt.amount, 60);
    assert_eq!(restored.get_balance("bob").await.unwrap(), 60);
    let alice = restored.account("alice").await.unwrap();
    assert_eq!(alice.committed, 0);
    assert_eq!(alice.total_paid, 60);
    assert_eq!(restored.verify_all().await, 0);
}

#[tokio::test]
async fn restore_freezes_payer_whose_commitments_drifted() {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = EscrowLedger::with_store(store.clone(), strict_config());
    ledger.deposit("alice", 100).await.unwrap();
    let ch = ledger.open_channel("alice", "bob", 60, None).await.unwrap();

    // a channel record written without its payer account
    let mut orphan = ledger.channel(&ch).await.unwrap();
    orphan.id = "orphan".to_string();
    store.commit(&[], &[&orphan]).await.unwrap();

    let restored = EscrowLedger::restore(store, strict_config()).await.unwrap();
    assert_eq!(restored.invariant_violations(), 1);
    assert!(restored.account("alice").await.unwrap().frozen);
    assert!(matches!(
        restored.withdraw("alice", 1).await.unwrap_err(),
        LedgerError::AccountFrozen(_)
    ));
}

#[tokio::test]
async fn transaction_history_covers_both_roles() {
    let ledger = ledger();
    ledger.deposit("alice", 100).await.unwrap();
    ledger.deposit("bob", 50).await.unwrap();
    let paid_by_alice = ledger.open_channel("alice", "bob", 40, None).await.unwrap();
    ledger.lock_escrow(&paid_by_alice, "t1", 40).await.unwrap();
    ledger
        .release_escrow(&paid_by_alice, "t1", ExecutionOutcome::Success)
        .await
        .unwrap();
    let paid_by_bob = ledger.open_channel("bob", "carol", 20, None).await.unwrap();

    let alice = ledger.transaction_history("alice").await;
    let kinds: Vec<TransactionKind> = alice.iter().map(|(_, e)| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransactionKind::Deposit,
            TransactionKind::Escrow,
            TransactionKind::Release
        ]
    );
    assert!(alice.iter().all(|(id, _)| *id == paid_by_alice));

    let bob = ledger.transaction_history("bob").await;
    assert_eq!(bob.len(), 4);
    assert_eq!(bob.iter().filter(|(id, _)| *id == paid_by_bob).count(), 1);
    assert!(bob.windows(2).all(|w| w[0].1.timestamp <= w[1].1.timestamp));

    assert_eq!(ledger.transaction_history("carol").await.len(), 1);
    assert!(ledger.transaction_history("dave").await.is_empty());
}

