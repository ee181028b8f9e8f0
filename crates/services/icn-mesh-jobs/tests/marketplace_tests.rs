mod common;

use common::{vision_task, Behavior, Harness, CAPABILITY};
use futures::future::join_all;
use icn_economics::{ChannelState, TransactionKind};
use icn_mesh_jobs::{
    AllocationResult, MarketConfig, MarketError, NotAllocatedReason, RefundReason,
};
use icn_types::{ExecutionOutcome, ReputationReason};
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn three_bidders() -> Harness {
    let h = Harness::new().await;
    h.bidder("alpha", 90.0, 200).await;
    h.bidder("beta", 70.0, 300).await;
    h.bidder("gamma", 95.0, 450).await;
    h.market.deposit("requester", 1_000).await.unwrap();
    h
}

#[tokio::test(start_paused = true)]
async fn successful_allocation_pays_second_price_and_rewards_winner() {
    let h = three_bidders().await;

    let result = h.market.allocate_and_settle(&vision_task("task-1")).await.unwrap();
    let allocation = match &result {
        AllocationResult::Settled(a) => a.clone(),
        other => panic!("expected settlement, got {:?}", other),
    };

    // alpha has the best composite score and pays the second-highest quote
    assert_eq!(allocation.worker_id, "alpha");
    assert_eq!(allocation.bid_price, 200);
    assert_eq!(allocation.clearing_price, 300);
    assert_eq!(allocation.settlement.receipt.outcome, ExecutionOutcome::Success);
    assert!(allocation.settlement.channel_closed);

    let ledger = h.market.ledger();
    assert_eq!(h.market.get_balance("alpha").await.unwrap(), 300);
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 700);
    let channel = ledger.channel(&allocation.escrow.channel_id).await.unwrap();
    assert_eq!(channel.total_settled, 300);
    assert_eq!(channel.state, ChannelState::Closed);

    let updates = h.reputation.updates_for("alpha").await;
    assert_eq!(updates.len(), 1);
    assert!(updates[0].delta > 0.0);
    assert!(matches!(
        updates[0].reason,
        ReputationReason::TaskCompleted { efficient: true, .. }
    ));
    assert_eq!(ledger.verify_all().await, 0);
    assert_eq!(ledger.invariant_violations(), 0);

    let auction = h.market.get_auction_status(&allocation.auction_id).await.unwrap();
    assert_eq!(auction.bids.len(), 3);
    assert_eq!(h.market.index().get("alpha").await.unwrap().load, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_execution_refunds_requester() {
    let h = three_bidders().await;
    h.executor.set(Behavior::Fail(0.4));

    let result = h.market.allocate_and_settle(&vision_task("task-2")).await.unwrap();
    let (allocation, reason) = match result {
        AllocationResult::Refunded { allocation, reason } => (allocation, reason),
        other => panic!("expected refund, got {:?}", other),
    };
    assert_eq!(reason, RefundReason::ExecutionFailed { progress: 0.4 });
    assert_eq!(allocation.settlement.receipt.amount, 300);

    // the escrow went back to the channel before the close refunded the payer
    let channel = h.market.ledger().channel(&allocation.escrow.channel_id).await.unwrap();
    let refund = channel
        .log
        .iter()
        .find(|e| e.kind == TransactionKind::Refund)
        .unwrap();
    assert_eq!(refund.amount, 300);
    assert_eq!(refund.current_balance, 300);
    assert_eq!(refund.escrowed_amount, 0);
    assert_eq!(channel.total_settled, 0);

    assert_eq!(h.market.get_balance("requester").await.unwrap(), 1_000);
    assert!(h.market.ledger().account("alpha").await.is_none());

    let updates = h.reputation.updates_for("alpha").await;
    assert_eq!(updates.len(), 1);
    assert!(updates[0].delta < 0.0);
}

#[tokio::test(start_paused = true)]
async fn execution_timeout_resolves_to_refund() {
    let h = three_bidders().await;
    h.executor.set(Behavior::Hang);

    let task = vision_task("task-3").with_execution_timeout(Duration::from_secs(60));
    let result = h.market.allocate_and_settle(&task).await.unwrap();
    match result {
        AllocationResult::Refunded { reason, .. } => assert_eq!(reason, RefundReason::TimedOut),
        other => panic!("expected refund, got {:?}", other),
    }
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 1_000);
    assert_eq!(h.market.index().get("alpha").await.unwrap().load, 0);
}

#[tokio::test(start_paused = true)]
async fn executor_error_resolves_to_refund() {
    let h = three_bidders().await;
    h.executor.set(Behavior::Crash);

    let result = h.market.allocate_and_settle(&vision_task("task-4")).await.unwrap();
    assert!(matches!(
        result,
        AllocationResult::Refunded {
            reason: RefundReason::ExecutorError { .. },
            ..
        }
    ));
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 1_000);
}

#[tokio::test(start_paused = true)]
async fn too_few_candidates_never_touches_the_ledger() {
    let h = Harness::new().await;
    h.bidder("alpha", 90.0, 200).await;
    h.bidder("beta", 70.0, 300).await;
    h.market.deposit("requester", 1_000).await.unwrap();

    let result = h.market.allocate_and_settle(&vision_task("task-5")).await.unwrap();
    assert_eq!(
        result,
        AllocationResult::NotAllocated {
            reason: NotAllocatedReason::NoEligibleWorkers { found: 2, required: 3 }
        }
    );
    assert!(h.market.ledger().channel_ids().await.is_empty());
    assert!(h.market.auctions().is_empty().await);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn two_bids_resolve_to_insufficient_bidders() {
    let h = Harness::new().await;
    h.bidder("alpha", 90.0, 200).await;
    h.bidder("beta", 70.0, 300).await;
    h.silent_worker("gamma", 95.0).await;
    h.market.deposit("requester", 1_000).await.unwrap();

    let result = h.market.allocate_and_settle(&vision_task("task-6")).await.unwrap();
    assert_eq!(
        result,
        AllocationResult::NotAllocated {
            reason: NotAllocatedReason::InsufficientBidders { received: 2, required: 3 }
        }
    );
    assert!(h.market.ledger().channel_ids().await.is_empty());
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 1_000);
}

#[tokio::test(start_paused = true)]
async fn unfunded_requester_is_rejected_before_execution() {
    let h = Harness::new().await;
    h.bidder("alpha", 90.0, 200).await;
    h.bidder("beta", 70.0, 300).await;
    h.bidder("gamma", 95.0, 450).await;
    h.market.deposit("requester", 100).await.unwrap();

    let result = h.market.allocate_and_settle(&vision_task("task-7")).await.unwrap();
    assert!(matches!(
        result,
        AllocationResult::NotAllocated {
            reason: NotAllocatedReason::PaymentRejected { .. }
        }
    ));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 100);
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_are_not_allocated() {
    let h = three_bidders().await;

    let no_caps = icn_types::TaskSpec::new("task-8", "requester", Vec::<String>::new(), 500);
    let result = h.market.allocate_and_settle(&no_caps).await.unwrap();
    assert!(matches!(
        result,
        AllocationResult::NotAllocated {
            reason: NotAllocatedReason::InvalidRequest { .. }
        }
    ));

    let too_slow = vision_task("task-9").with_execution_timeout(Duration::from_secs(3_600));
    let result = h.market.allocate_and_settle(&too_slow).await.unwrap();
    assert!(matches!(
        result,
        AllocationResult::NotAllocated {
            reason: NotAllocatedReason::InvalidRequest { .. }
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_allocations_keep_the_ledger_balanced() {
    let h = three_bidders().await;
    h.market.deposit("requester", 4_000).await.unwrap();

    let tasks: Vec<_> = (0..5).map(|i| vision_task(&format!("batch-{}", i))).collect();
    let results = join_all(tasks.iter().map(|t| h.market.allocate_and_settle(t))).await;

    for result in &results {
        assert!(result.as_ref().unwrap().is_settled());
    }
    assert_eq!(h.market.get_balance("requester").await.unwrap(), 5_000 - 5 * 300);
    assert_eq!(h.market.get_balance("alpha").await.unwrap(), 5 * 300);
    assert_eq!(h.market.ledger().verify_all().await, 0);
    assert_eq!(h.market.ledger().invariant_violations(), 0);
}

#[tokio::test(start_paused = true)]
async fn allocation_results_serialize_with_their_kind() {
    let h = Harness::new().await;
    let result = h.market.allocate_and_settle(&vision_task("task-10")).await.unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["result"], "not_allocated");
    assert_eq!(json["reason"]["reason"], "no_eligible_workers");
}

#[tokio::test(start_paused = true)]
async fn background_tasks_start_and_stop() {
    let h = three_bidders().await;
    h.market.start().await;
    tokio::time::sleep(Duration::from_secs(61)).await;
    let alpha = h.market.index().get("alpha").await.unwrap();
    assert!((alpha.avg_response_ms - 20.0).abs() < 1e-9);
    h.market.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_limit_comes_from_config_but_invites_do_not() {
    let h = Harness::with_config(MarketConfig {
        discovery_default_limit: 2,
        ledger_verify_after_mutation: true,
        ..MarketConfig::default()
    })
    .await;
    h.bidder("alpha", 90.0, 200).await;
    h.bidder("beta", 70.0, 300).await;
    h.bidder("gamma", 95.0, 450).await;
    h.silent_worker("delta", 60.0).await;
    h.market.deposit("requester", 1_000).await.unwrap();

    let query = h.market.query_for([CAPABILITY]);
    assert_eq!(query.limit, 2);
    assert_eq!(h.market.discover(&query).await.unwrap().len(), 2);

    let result = h.market.allocate_and_settle(&vision_task("task-11")).await.unwrap();
    assert!(result.is_settled());
    let auction = h.market.auction_for_task("task-11").await.unwrap();
    assert_eq!(auction.invited.len(), 4);
}

#[tokio::test]
async fn refresh_reputation_pulls_the_current_score() {
    let h = Harness::new().await;
    h.silent_worker("alpha", 50.0).await;
    assert!((h.market.index().get("alpha").await.unwrap().reputation - 50.0).abs() < 1e-9);

    h.reputation.set_score("alpha", 82.0).await;
    let score = h.market.refresh_reputation("alpha").await.unwrap();
    assert!((score - 82.0).abs() < 1e-9);
    assert!((h.market.index().get("alpha").await.unwrap().reputation - 82.0).abs() < 1e-9);

    assert!(matches!(
        h.market.refresh_reputation("ghost").await.unwrap_err(),
        MarketError::Discovery(_)
    ));
}

