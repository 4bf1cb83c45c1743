//! Orbit XA simulator
//!
//! Drives concurrent two-phase-commit traffic through the connection manager
//! against two in-memory resource managers and prints pool and switch
//! statistics at the end.
//!
//! Usage:
//!   orbit-xa-sim [--config FILE] [--transactions N] [--concurrency N]

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use orbit_xa::{
    BranchOutcome, ConnectionHandle, ConnectionManager, InMemorySwitch, ManagerConfig,
    MatchCriteria, SwitchOperation, SwitchRegistry, SwitchStatus, Vote, Xid,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Orbit XA simulator
#[derive(Parser)]
#[command(
    name = "orbit-xa-sim",
    version = env!("CARGO_PKG_VERSION"),
    about = "Drive simulated two-phase-commit traffic through the XA connection manager"
)]
struct Args {
    /// Manager configuration file (TOML); defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of global transactions to run
    #[arg(short, long, default_value_t = 100)]
    transactions: usize,

    /// Transactions in flight at once
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Simulated latency of every resource manager call, in milliseconds
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,

    /// Every Nth transaction has DB2 fail its prepare (0 disables)
    #[arg(long, default_value_t = 10)]
    fail_every: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("{},orbit_xa=info", args.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = match &args.config {
        Some(path) => ManagerConfig::load_from_file(path)
            .await
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => ManagerConfig::default(),
    };
    info!("[Configuration] {:?}", config);

    let latency = Duration::from_millis(args.latency_ms);
    let db1 = Arc::new(InMemorySwitch::new("DB1").with_latency(latency));
    let db2 = Arc::new(InMemorySwitch::new("DB2").with_latency(latency));
    let registry = Arc::new(SwitchRegistry::new());
    registry.register_switch("DB1", db1.clone())?;
    registry.register_switch("DB2", db2.clone())?;

    let manager = ConnectionManager::new(registry, config)?;
    manager.start();
    manager
        .pool()
        .prefill("DB1", &MatchCriteria::default())
        .await?;

    let started = Instant::now();
    let limiter = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let runs = (0..args.transactions).map(|n| {
        let manager = manager.clone();
        let limiter = Arc::clone(&limiter);
        let db2 = db2.clone();
        let inject = args.fail_every > 0 && n % args.fail_every == args.fail_every - 1;
        async move {
            let _slot = limiter.acquire_owned().await?;
            if inject {
                db2.fail_next(SwitchOperation::Prepare, SwitchStatus::ResourceUnavailable);
            }
            run_transaction(&manager).await
        }
    });

    let mut committed = 0;
    let mut rolled_back = 0;
    let mut failed = 0;
    for result in join_all(runs).await {
        match result {
            Ok(true) => committed += 1,
            Ok(false) => rolled_back += 1,
            Err(e) => {
                error!("Transaction failed: {:#}", e);
                failed += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    let switch_stats: Vec<_> = manager
        .invocation_stats()
        .into_iter()
        .map(|(resource, operation, stats)| {
            json!({
                "resource": resource,
                "operation": operation.as_str(),
                "invoked": stats.invoked,
                "failures": stats.failures,
                "retries": stats.retries,
                "avg_us": stats.average().as_micros() as u64,
                "max_us": stats.max.as_micros() as u64,
            })
        })
        .collect();
    let summary = json!({
        "transactions": args.transactions,
        "committed": committed,
        "rolled_back": rolled_back,
        "failed": failed,
        "elapsed_ms": elapsed.as_millis() as u64,
        "pool": manager.pool_stats(),
        "switches": switch_stats,
        "db1_committed": db1.committed_xids().len(),
        "db2_committed": db2.committed_xids().len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    manager.shutdown().await;
    Ok(())
}

/// One global transaction spanning DB1 and DB2. Returns whether it committed.
async fn run_transaction(manager: &ConnectionManager) -> Result<bool> {
    let xid = Xid::generate();
    let criteria = MatchCriteria::default();
    let first = manager.allocate("DB1", &criteria, Some(&xid)).await?;
    let second = match manager.allocate("DB2", &criteria, Some(&xid)).await {
        Ok(handle) => handle,
        Err(e) => {
            abandon(manager, &xid, &first).await;
            return Err(e).context("allocating DB2");
        }
    };

    manager.delist(&first).await?;
    manager.delist(&second).await?;
    // Release before completion: the manager returns both once the branch is done
    manager.release(&first).await?;
    manager.release(&second).await?;

    let prepared = manager.prepare_branch(&xid).await?;
    if prepared.vote == Vote::Rollback {
        warn!("Branch {} voted ROLLBACK", xid);
        manager.rollback_branch(&xid).await?;
        return Ok(false);
    }

    let report = manager.commit_branch(&xid).await?;
    if report.outcome != BranchOutcome::Completed {
        anyhow::bail!("branch {} finished {:?}", xid, report.outcome);
    }
    Ok(true)
}

/// Roll back a half-built branch and give its connection back
async fn abandon(manager: &ConnectionManager, xid: &Xid, handle: &ConnectionHandle) {
    if let Err(e) = manager.rollback_branch(xid).await {
        warn!("Rolling back abandoned branch {} failed: {}", xid, e);
    }
    if let Err(e) = manager.release(handle).await {
        warn!("Releasing {} failed: {}", handle, e);
    }
}
