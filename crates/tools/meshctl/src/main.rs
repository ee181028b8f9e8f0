use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::stream::{self, StreamExt};
use icn_mesh_jobs::{
    metrics, AllocationResult, CachingReputationClient, DefaultReputationClient, InMemoryReputationClient,
    MarketConfig, Marketplace, MarketplaceDeps, NotAllocatedReason, ReputationClient,
};
use icn_types::{AuctionKind, TaskSpec, TokenAmount, WorkerRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod sim;

use sim::{BidProfile, SimExecutor, SimProbe, SimTransport};

const CAPABILITIES: [&str; 4] = ["vision-analysis", "resize", "transcode", "inference"];
const REGIONS: [&str; 3] = ["eu-west", "us-east", "ap-south"];
const REQUESTER: &str = "sim-requester";

/// Command-line interface for the mesh compute marketplace
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Marketplace configuration file (TOML). MARKET_* variables override it.
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[clap(long, global = true, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run allocations end to end against simulated workers
    Simulate {
        /// Number of simulated workers
        #[clap(long, default_value = "12")]
        workers: usize,

        /// Number of tasks to allocate
        #[clap(long, default_value = "20")]
        tasks: usize,

        /// Share of executions that fail
        #[clap(long, default_value = "0.1")]
        failure_rate: f64,

        /// RNG seed; equal seeds give equal bids and outcomes
        #[clap(long, default_value = "42")]
        seed: u64,

        /// Auction window in seconds
        #[clap(long, default_value = "1")]
        auction_secs: u64,

        /// Allocations in flight at once
        #[clap(long, default_value = "4")]
        concurrency: usize,

        /// Maximum price per task
        #[clap(long, default_value = "500")]
        max_price: TokenAmount,

        /// Print Prometheus metrics after the run
        #[clap(long)]
        metrics: bool,
    },

    /// Look up worker scores on the configured reputation service
    Reputation {
        /// Worker IDs to query
        #[clap(required = true)]
        workers: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(filter).init();

    let config = MarketConfig::load(cli.config.as_deref()).context("Failed to load marketplace configuration")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Reputation { workers } => query_reputation(&config, &workers).await,
        Commands::Simulate {
            workers,
            tasks,
            failure_rate,
            seed,
            auction_secs,
            concurrency,
            max_price,
            metrics: show_metrics,
        } => {
            let mut config = config;
            config.auction_default_duration_secs = auction_secs.max(1);
            let params = SimParams {
                workers,
                tasks,
                failure_rate,
                seed,
                concurrency: concurrency.max(1),
                max_price,
            };
            simulate(config, params).await?;
            if show_metrics {
                println!("\n{}", "Metrics".blue().bold());
                println!("{}", metrics::gather_text());
            }
            Ok(())
        }
    }
}

async fn query_reputation(config: &MarketConfig, workers: &[String]) -> Result<()> {
    let remote = DefaultReputationClient::new(&config.reputation_service_url)?;
    let client = CachingReputationClient::new(
        Arc::new(remote),
        Duration::from_secs(config.reputation_cache_ttl_secs),
    );
    println!(
        "{} {}",
        "Reputation service:".blue().bold(),
        config.reputation_service_url
    );
    for worker in workers {
        match client.get_score(worker).await {
            Ok(score) => println!("  {:<16} {}", worker, format!("{:.1}", score).green()),
            Err(e) => println!("  {:<16} {}", worker, e.to_string().red()),
        }
    }
    Ok(())
}

struct SimParams {
    workers: usize,
    tasks: usize,
    failure_rate: f64,
    seed: u64,
    concurrency: usize,
    max_price: TokenAmount,
}

async fn simulate(config: MarketConfig, params: SimParams) -> Result<()> {
    println!("{}", "Simulating mesh marketplace".blue().bold());
    println!("Workers: {}", params.workers);
    println!("Tasks: {}", params.tasks);
    println!("Failure rate: {:.2}", params.failure_rate);
    println!("Seed: {}", params.seed);

    let mut rng = StdRng::seed_from_u64(params.seed);
    let (transport, invites) = SimTransport::new();
    let probe = Arc::new(SimProbe::new(params.seed));
    let reputation = Arc::new(InMemoryReputationClient::new());
    let deps = MarketplaceDeps {
        transport: Arc::new(transport),
        probe: probe.clone(),
        executor: Arc::new(SimExecutor::new(params.seed, params.failure_rate)),
        reputation: reputation.clone(),
        ledger_store: None,
    };
    let market = Arc::new(Marketplace::new(config, deps).await?);

    let mut profiles = HashMap::new();
    for i in 0..params.workers {
        let id = format!("worker-{:03}", i);
        let mut caps = vec![CAPABILITIES[0]];
        caps.extend(CAPABILITIES[1..].iter().filter(|_| rng.gen_bool(0.5)));
        let record = WorkerRecord::new(id.clone(), caps)
            .with_region(REGIONS[i % REGIONS.len()])
            .with_quality(rng.gen_range(50.0..100.0));
        reputation.set_score(id.clone(), rng.gen_range(30.0..100.0)).await;
        probe.set_latency(&id, rng.gen_range(5..300));
        market.register_worker(record).await?;

        let floor = rng.gen_range(0.2..0.6);
        profiles.insert(
            id,
            BidProfile {
                floor,
                ceiling: (floor + rng.gen_range(0.1..0.4)).min(1.0),
                participation: rng.gen_range(0.6..1.0),
            },
        );
    }
    let bidders = sim::spawn_bidders(market.clone(), invites, profiles, params.seed);

    let funding = (params.tasks as TokenAmount).saturating_mul(params.max_price).max(1);
    market.deposit(REQUESTER, funding).await?;
    market.start().await;

    let kinds = [AuctionKind::SecondPrice, AuctionKind::FirstPrice, AuctionKind::Reserve];
    let specs: Vec<TaskSpec> = (0..params.tasks)
        .map(|i| {
            let kind = kinds[i % kinds.len()];
            let mut task = TaskSpec::new(format!("task-{:04}", i), REQUESTER, ["vision-analysis"], params.max_price)
                .with_kind(kind)
                .with_region(REGIONS[i % REGIONS.len()]);
            if kind == AuctionKind::Reserve {
                task = task.with_reserve(params.max_price / 2);
            }
            task
        })
        .collect();

    let results: Vec<(String, Result<AllocationResult, icn_mesh_jobs::MarketError>)> = stream::iter(specs)
        .map(|task| {
            let market = market.clone();
            async move {
                let result = market.allocate_and_settle(&task).await;
                (task.task_id, result)
            }
        })
        .buffer_unordered(params.concurrency)
        .collect()
        .await;

    market.shutdown().await;
    bidders.abort();

    let mut summary = Summary::default();
    for (task_id, result) in &results {
        summary.record(task_id, result);
    }
    summary.print();

    let ledger = market.ledger();
    let failures = ledger.verify_all().await;
    println!("Requester balance: {}", market.get_balance(REQUESTER).await?);
    let mut earners: Vec<(String, TokenAmount)> = Vec::new();
    for id in market.index().worker_ids().await {
        if let Some(account) = ledger.account(&id).await {
            earners.push((id, account.total_earned));
        }
    }
    earners.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("\n{}", "Top earners".blue().bold());
    for (id, earned) in earners.iter().take(5) {
        println!("  {:<12} {}", id, earned.to_string().green());
    }

    let mut statuses: Vec<(&'static str, usize)> = market
        .index()
        .status_counts()
        .await
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();
    statuses.sort();
    println!("\n{}", "Workers by status".blue().bold());
    for (status, count) in statuses {
        println!("  {:<12} {}", status, count);
    }

    let violations = ledger.invariant_violations();
    if failures == 0 && violations == 0 {
        println!("\n{}", "Ledger invariants hold".green().bold());
    } else {
        println!(
            "\n{} ({} failed checks, {} violations)",
            "Ledger invariants violated".red().bold(),
            failures,
            violations
        );
    }
    info!(tasks = results.len(), "Simulation finished");
    Ok(())
}

#[derive(Default)]
struct Summary {
    settled: usize,
    refunded: usize,
    errors: usize,
    paid: TokenAmount,
    not_allocated: BTreeMap<&'static str, usize>,
}

impl Summary {
    fn record(&mut self, task_id: &str, result: &Result<AllocationResult, icn_mesh_jobs::MarketError>) {
        match result {
            Ok(AllocationResult::Settled(a)) => {
                self.settled += 1;
                self.paid += a.clearing_price;
                println!(
                    "{} {} -> {} at {}",
                    "settled ".green(),
                    task_id,
                    a.worker_id,
                    a.clearing_price
                );
            }
            Ok(AllocationResult::Refunded { allocation, reason }) => {
                self.refunded += 1;
                println!(
                    "{} {} -> {} ({:?})",
                    "refunded".yellow(),
                    task_id,
                    allocation.worker_id,
                    reason
                );
            }
            Ok(AllocationResult::NotAllocated { reason }) => {
                *self.not_allocated.entry(reason_label(reason)).or_default() += 1;
                println!("{} {} ({:?})", "skipped ".red(), task_id, reason);
            }
            Err(e) => {
                self.errors += 1;
                println!("{} {}: {}", "error   ".red().bold(), task_id, e);
            }
        }
    }

    fn print(&self) {
        println!("\n{}", "Summary".blue().bold());
        println!("Settled: {}", self.settled.to_string().green());
        println!("Refunded: {}", self.refunded.to_string().yellow());
        for (reason, count) in &self.not_allocated {
            println!("Not allocated ({}): {}", reason, count.to_string().red());
        }
        if self.errors > 0 {
            println!("Errors: {}", self.errors.to_string().red().bold());
        }
        println!("Paid to workers: {}", self.paid);
    }
}

fn reason_label(reason: &NotAllocatedReason) -> &'static str {
    match reason {
        NotAllocatedReason::InvalidRequest { .. } => "invalid request",
        NotAllocatedReason::NoEligibleWorkers { .. } => "no eligible workers",
        NotAllocatedReason::InsufficientBidders { .. } => "insufficient bidders",
        NotAllocatedReason::NoBids => "no bids",
        NotAllocatedReason::AuctionCanceled => "canceled",
        NotAllocatedReason::TransportUnavailable { .. } => "transport unavailable",
        NotAllocatedReason::PaymentRejected { .. } => "payment rejected",
    }
}
