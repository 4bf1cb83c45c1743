//! Metrics for pooled XA connections
//!
//! Emission goes through the `metrics` facade; nothing is recorded unless the
//! host process installs a recorder. `InvocationStats` keeps an in-process copy
//! of switch call statistics for operators and tests.

use crate::switch::{SwitchOperation, SwitchStatus};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PREFIX: &str = "orbit.xa";

/// Statistics for one (resource manager, operation) pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationStats {
    /// Calls made, retries included
    pub invoked: u64,
    /// Final outcomes other than OK
    pub failures: u64,
    /// Calls that were reissued after RETRY
    pub retries: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl InvocationStats {
    pub fn record_call(&mut self, elapsed: Duration) {
        if self.invoked == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.invoked += 1;
        self.total += elapsed;
    }

    pub fn average(&self) -> Duration {
        if self.invoked == 0 {
            Duration::ZERO
        } else {
            self.total / self.invoked as u32
        }
    }
}

pub fn record_switch_call(
    resource: &str,
    operation: SwitchOperation,
    status: SwitchStatus,
    elapsed: Duration,
) {
    counter!(
        format!("{PREFIX}.switch.calls.total"),
        "resource" => resource.to_string(),
        "operation" => operation.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        format!("{PREFIX}.switch.duration.seconds"),
        "resource" => resource.to_string(),
        "operation" => operation.as_str()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_connection_created(resource: &str) {
    counter!(format!("{PREFIX}.pool.created.total"), "resource" => resource.to_string())
        .increment(1);
}

pub fn record_connection_closed(resource: &str, reason: &'static str) {
    counter!(
        format!("{PREFIX}.pool.closed.total"),
        "resource" => resource.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_acquire(hit: bool, waited: Duration) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(format!("{PREFIX}.pool.acquire.total"), "outcome" => outcome).increment(1);
    histogram!(format!("{PREFIX}.pool.acquire.wait.seconds")).record(waited.as_secs_f64());
}

pub fn record_acquire_timeout(resource: &str) {
    counter!(format!("{PREFIX}.pool.timeouts.total"), "resource" => resource.to_string())
        .increment(1);
}

pub fn record_pool_occupancy(available: usize, in_use: usize) {
    gauge!(format!("{PREFIX}.pool.available")).set(available as f64);
    gauge!(format!("{PREFIX}.pool.in_use")).set(in_use as f64);
}

pub fn record_branch_outcome(phase: &'static str, outcome: &'static str, participants: usize) {
    counter!(
        format!("{PREFIX}.branch.{phase}.total"),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(format!("{PREFIX}.branch.participants.count")).record(participants as f64);
}
