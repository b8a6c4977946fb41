use arc_swap::{ArcSwap, Guard};
use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::constants::{
  CRON_START_INITIAL_BACKOFF_DEFAULT, CRON_START_MAX_BACKOFF_DEFAULT, EXECUTOR_CPU_RESERVATION,
  EXECUTOR_RAM_RESERVATION_MB, MAX_TASKS_PER_JOB_DEFAULT, PREEMPTION_CANDIDACY_DELAY_DEFAULT,
  PREEMPTION_INTERVAL_DEFAULT, SLOW_QUERY_THRESHOLD_DEFAULT,
};
use crate::model::Resources;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Validation error: {0}")]
  Invalid(String),
}

/// Tunables for the scheduling core. Serializable so deployments can load it
/// from whatever configuration source fronts the process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Upper bound on a job's shard count.
  pub max_tasks_per_job: u32,
  /// When set, admission rejects tasks without a contact email.
  pub require_contact_email: bool,
  /// Task queries slower than this are logged.
  pub slow_query_log_threshold_ms: i64,
  /// Minimum time a task must sit in PENDING before it may preempt.
  pub preemption_candidacy_delay_secs: i64,
  /// Period of the preempter tick.
  pub preemption_interval_secs: i64,
  /// First delayed cron-run poll interval.
  pub cron_start_initial_backoff_secs: i64,
  /// Cap on the delayed cron-run poll interval.
  pub cron_start_max_backoff_secs: i64,
  /// CPU subtracted from every offer for the executor process.
  pub executor_cpu_reservation: f64,
  /// RAM subtracted from every offer for the executor process.
  pub executor_ram_reservation_mb: u64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    return SchedulerConfig {
      max_tasks_per_job: MAX_TASKS_PER_JOB_DEFAULT,
      require_contact_email: true,
      slow_query_log_threshold_ms: SLOW_QUERY_THRESHOLD_DEFAULT.num_milliseconds(),
      preemption_candidacy_delay_secs: PREEMPTION_CANDIDACY_DELAY_DEFAULT.num_seconds(),
      preemption_interval_secs: PREEMPTION_INTERVAL_DEFAULT.num_seconds(),
      cron_start_initial_backoff_secs: CRON_START_INITIAL_BACKOFF_DEFAULT.num_seconds(),
      cron_start_max_backoff_secs: CRON_START_MAX_BACKOFF_DEFAULT.num_seconds(),
      executor_cpu_reservation: EXECUTOR_CPU_RESERVATION,
      executor_ram_reservation_mb: EXECUTOR_RAM_RESERVATION_MB,
    };
  }
}

impl SchedulerConfig {
  pub fn slow_query_log_threshold(&self) -> std::time::Duration {
    return std::time::Duration::from_millis(self.slow_query_log_threshold_ms.max(0) as u64);
  }

  pub fn preemption_candidacy_delay(&self) -> Duration {
    return Duration::seconds(self.preemption_candidacy_delay_secs);
  }

  pub fn preemption_interval(&self) -> std::time::Duration {
    return std::time::Duration::from_secs(self.preemption_interval_secs.max(1) as u64);
  }

  pub fn cron_start_initial_backoff(&self) -> std::time::Duration {
    return std::time::Duration::from_secs(self.cron_start_initial_backoff_secs.max(1) as u64);
  }

  pub fn cron_start_max_backoff(&self) -> std::time::Duration {
    return std::time::Duration::from_secs(self.cron_start_max_backoff_secs.max(1) as u64);
  }

  /// Slice of every offer reserved for the executor process.
  pub fn executor_reservation(&self) -> Resources {
    return Resources {
      num_cpus: self.executor_cpu_reservation,
      ram_mb: self.executor_ram_reservation_mb,
      disk_mb: 0,
      num_ports: 0,
    };
  }
}

pub fn validate_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
  if config.max_tasks_per_job == 0 {
    return Err(ConfigError::Invalid(
      "max_tasks_per_job must be positive".to_string(),
    ));
  }
  if config.executor_cpu_reservation < 0.0 {
    return Err(ConfigError::Invalid(
      "executor_cpu_reservation must not be negative".to_string(),
    ));
  }
  if config.cron_start_initial_backoff_secs > config.cron_start_max_backoff_secs {
    return Err(ConfigError::Invalid(
      "cron_start_initial_backoff_secs exceeds cron_start_max_backoff_secs".to_string(),
    ));
  }
  return Ok(());
}

type Listener = Box<dyn Fn(&SchedulerConfig) + Send + Sync>;

/// Shared handle to the live configuration. Long-running components load the
/// current value each tick; interested parties may listen for swaps.
pub struct ConfigHandle {
  value: ArcSwap<SchedulerConfig>,
  listeners: Mutex<Vec<Listener>>,
}

impl ConfigHandle {
  pub fn new(config: SchedulerConfig) -> Self {
    return ConfigHandle {
      value: ArcSwap::from_pointee(config),
      listeners: Mutex::new(Vec::new()),
    };
  }

  pub fn load(&self) -> Guard<Arc<SchedulerConfig>> {
    return self.value.load();
  }

  pub fn load_full(&self) -> Arc<SchedulerConfig> {
    return self.value.load_full();
  }

  pub fn store(&self, config: SchedulerConfig) -> Result<(), ConfigError> {
    validate_config(&config)?;
    let ptr = Arc::new(config);
    self.value.store(ptr.clone());

    for listener in self.listeners.lock().iter() {
      listener(&ptr);
    }
    return Ok(());
  }

  pub fn listen<F>(&self, listener: F)
  where
    F: 'static + Send + Sync + Fn(&SchedulerConfig),
  {
    self.listeners.lock().push(Box::new(listener));
  }
}

impl Default for ConfigHandle {
  fn default() -> Self {
    return ConfigHandle::new(SchedulerConfig::default());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = SchedulerConfig::default();
    assert!(validate_config(&config).is_ok());
    assert_eq!(config.max_tasks_per_job, 1000);
    assert_eq!(config.slow_query_log_threshold_ms, 25);
    assert_eq!(config.preemption_candidacy_delay_secs, 600);
    assert_eq!(config.executor_reservation().ram_mb, 128);
  }

  #[test]
  fn test_store_rejects_invalid() {
    let handle = ConfigHandle::default();
    let result = handle.store(SchedulerConfig {
      max_tasks_per_job: 0,
      ..Default::default()
    });
    assert!(result.is_err());
    // The previous value stays live.
    assert_eq!(handle.load().max_tasks_per_job, 1000);
  }

  #[test]
  fn test_listeners_observe_swap() {
    let handle = ConfigHandle::default();
    let seen = Arc::new(Mutex::new(0u32));

    let seen_clone = seen.clone();
    handle.listen(move |config| {
      *seen_clone.lock() = config.max_tasks_per_job;
    });

    handle
      .store(SchedulerConfig {
        max_tasks_per_job: 7,
        ..Default::default()
      })
      .unwrap();
    assert_eq!(*seen.lock(), 7);
  }
}
