use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

lazy_static! {
  static ref COUNTERS: Mutex<HashMap<&'static str, Arc<AtomicU64>>> = Mutex::new(HashMap::new());
}

/// Process-wide named counter. Counters are created on first use and live for
/// the lifetime of the process.
pub fn counter(name: &'static str) -> Arc<AtomicU64> {
  return COUNTERS
    .lock()
    .entry(name)
    .or_insert_with(|| Arc::new(AtomicU64::new(0)))
    .clone();
}

pub fn increment(name: &'static str) {
  counter(name).fetch_add(1, Ordering::Relaxed);
}

pub fn get(name: &'static str) -> u64 {
  return counter(name).load(Ordering::Relaxed);
}

pub mod names {
  pub const CRON_JOB_LAUNCH_FAILURES: &str = "cron_job_launch_failures";
  pub const ILLEGAL_TRANSITIONS: &str = "illegal_transitions";
  pub const SHARD_UNIQUENESS_REPAIRS: &str = "shard_uniqueness_repairs";
  pub const SLOW_QUERIES: &str = "slow_queries";
  pub const PREEMPTION_VICTORIES: &str = "preemption_victories";
  pub const OFFERS_DECLINED: &str = "offers_declined";
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_counter_accumulates() {
    let before = get("test_counter");
    increment("test_counter");
    increment("test_counter");
    assert_eq!(get("test_counter"), before + 2);
  }
}
