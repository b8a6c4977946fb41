use chrono::Utc;
use cron::Schedule;
use log::*;
use parking_lot::Mutex;
use std::collections::{hash_map::Entry, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ConfigHandle;
use crate::constants::CRON_MANAGER_KEY;
use crate::model::{CronCollisionPolicy, JobConfiguration, JobKey, TaskStatus};
use crate::query::TaskQuery;
use crate::state_machine::StateManager;
use crate::stats;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum CronError {
  #[error("Invalid cron schedule '{0}'")]
  InvalidSchedule(String),
  #[error("Job {0} is not cron-managed")]
  NotCron(JobKey),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

pub type CronCallback = dyn Fn() + Send + Sync;

/// Port to the cron engine. The core only needs scheduling, descheduling and
/// expression validation; evaluation semantics live behind this boundary.
pub trait CronScheduler: Send + Sync {
  fn is_valid_schedule(&self, expr: &str) -> bool;
  fn schedule(&self, expr: &str, callback: Arc<CronCallback>) -> Result<String, CronError>;
  fn deschedule(&self, key: &str);
  fn get_schedule(&self, key: &str) -> Option<String>;
  fn start(&self);
  fn stop(&self);
}

static CRON_KEY_COUNTER: AtomicI64 = AtomicI64::new(1024);

struct CronEntry {
  spec: String,
  schedule: Schedule,
  callback: Arc<CronCallback>,
  handle: Option<tokio::task::AbortHandle>,
}

impl CronEntry {
  fn start(&mut self, key: &str) {
    let key = key.to_string();
    let schedule = self.schedule.clone();
    let callback = self.callback.clone();

    let handle = tokio::spawn(async move {
      loop {
        let now = Utc::now();
        let Some(next) = schedule.upcoming(Utc).next() else {
          break;
        };
        let Ok(duration) = (next - now).to_std() else {
          warn!("Invalid duration for '{key}': {next:?}");
          continue;
        };

        tokio::time::sleep(duration).await;

        (callback)();
      }

      info!("Exited cron entry: '{key}'");
    });

    self.handle = Some(handle.abort_handle());
  }

  fn stop(&mut self) {
    if let Some(ref handle) = self.handle {
      handle.abort();
    }
    self.handle = None;
  }
}

/// Cron engine backed by spawned timer loops, one per registered entry.
pub struct TokioCronScheduler {
  entries: Mutex<HashMap<String, CronEntry>>,
  running: AtomicBool,
}

impl Default for TokioCronScheduler {
  fn default() -> Self {
    return TokioCronScheduler::new();
  }
}

impl TokioCronScheduler {
  pub fn new() -> Self {
    return TokioCronScheduler {
      entries: Mutex::new(HashMap::new()),
      running: AtomicBool::new(false),
    };
  }
}

impl CronScheduler for TokioCronScheduler {
  fn is_valid_schedule(&self, expr: &str) -> bool {
    return Schedule::from_str(expr).is_ok();
  }

  fn schedule(&self, expr: &str, callback: Arc<CronCallback>) -> Result<String, CronError> {
    let schedule =
      Schedule::from_str(expr).map_err(|_| CronError::InvalidSchedule(expr.to_string()))?;

    let key = format!("cron-{}", CRON_KEY_COUNTER.fetch_add(1, Ordering::SeqCst));
    let mut entry = CronEntry {
      spec: expr.to_string(),
      schedule,
      callback,
      handle: None,
    };
    if self.running.load(Ordering::SeqCst) {
      entry.start(&key);
    }
    self.entries.lock().insert(key.clone(), entry);
    return Ok(key);
  }

  fn deschedule(&self, key: &str) {
    if let Some(mut entry) = self.entries.lock().remove(key) {
      entry.stop();
    }
  }

  fn get_schedule(&self, key: &str) -> Option<String> {
    return self.entries.lock().get(key).map(|e| e.spec.clone());
  }

  fn start(&self) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }
    for (key, entry) in self.entries.lock().iter_mut() {
      if entry.handle.is_none() {
        entry.start(key);
      }
    }
  }

  fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    for entry in self.entries.lock().values_mut() {
      entry.stop();
    }
  }
}

impl Drop for TokioCronScheduler {
  fn drop(&mut self) {
    for entry in self.entries.lock().values_mut() {
      entry.stop();
    }
  }
}

/// Materializes cron job templates into PENDING tasks on each fire, applying
/// the job's collision policy when prior tasks are still live.
pub struct CronJobManager {
  state: StateManager,
  cron: Arc<dyn CronScheduler>,
  config: Arc<ConfigHandle>,
  registered: Mutex<HashMap<JobKey, String>>,
  /// At most one queued delayed run per job.
  pending_runs: Mutex<HashMap<JobKey, tokio::task::AbortHandle>>,
}

impl CronJobManager {
  pub fn new(
    state: StateManager,
    cron: Arc<dyn CronScheduler>,
    config: Arc<ConfigHandle>,
  ) -> Arc<Self> {
    return Arc::new(CronJobManager {
      state,
      cron,
      config,
      registered: Mutex::new(HashMap::new()),
      pending_runs: Mutex::new(HashMap::new()),
    });
  }

  /// Registers every persisted cron job with the cron engine. Jobs whose
  /// schedule no longer parses are counted and skipped.
  pub fn storage_started(self: &Arc<Self>) {
    let jobs = self
      .state
      .storage()
      .consistent_read(|state| state.jobs.fetch_jobs(CRON_MANAGER_KEY));

    for job in jobs {
      if let Err(err) = self.schedule_with_engine(&job) {
        stats::increment(stats::names::CRON_JOB_LAUNCH_FAILURES);
        error!("Failed to schedule cron job {}: {err}", job.key);
      }
    }
  }

  /// Persists and schedules a new cron job.
  pub fn register_job(self: &Arc<Self>, job: JobConfiguration) -> Result<(), CronError> {
    let Some(ref spec) = job.cron_schedule else {
      return Err(CronError::NotCron(job.key.clone()));
    };
    if !self.cron.is_valid_schedule(spec) {
      return Err(CronError::InvalidSchedule(spec.clone()));
    }

    self.state.storage().write(|state, _work| {
      state.jobs.save_job(CRON_MANAGER_KEY, job.clone());
      return Ok(());
    })?;
    return self.schedule_with_engine(&job);
  }

  /// Removes a job from the store and the cron engine and drops any queued
  /// delayed run.
  pub fn deregister_job(&self, key: &JobKey) -> Result<(), CronError> {
    if let Some(cron_key) = self.registered.lock().remove(key) {
      self.cron.deschedule(&cron_key);
    }
    if let Some(handle) = self.pending_runs.lock().remove(key) {
      handle.abort();
    }
    self.state.storage().write(|state, _work| {
      state.jobs.remove_job(CRON_MANAGER_KEY, key);
      return Ok(());
    })?;
    return Ok(());
  }

  pub fn is_registered(&self, key: &JobKey) -> bool {
    return self.registered.lock().contains_key(key);
  }

  fn schedule_with_engine(self: &Arc<Self>, job: &JobConfiguration) -> Result<(), CronError> {
    let Some(ref spec) = job.cron_schedule else {
      return Err(CronError::NotCron(job.key.clone()));
    };
    if !self.cron.is_valid_schedule(spec) {
      return Err(CronError::InvalidSchedule(spec.clone()));
    }

    let manager = self.clone();
    let key = job.key.clone();
    let cron_key = self.cron.schedule(
      spec,
      Arc::new(move || {
        manager.cron_triggered(&key);
      }),
    )?;
    self.registered.lock().insert(job.key.clone(), cron_key);
    return Ok(());
  }

  /// One cron fire. Launches the templated tasks directly when the job is
  /// idle; otherwise the collision policy decides.
  pub fn cron_triggered(self: &Arc<Self>, key: &JobKey) {
    info!("Cron fire for {key}");

    let Some(job) = self
      .state
      .storage()
      .consistent_read(|state| state.jobs.fetch_job(CRON_MANAGER_KEY, key))
    else {
      warn!("Cron fire for unknown job {key}");
      return;
    };

    let active = self
      .state
      .storage()
      .consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::by_job(key).active()));
    if active.is_empty() {
      self.launch(&job, 0);
      return;
    }

    match job.collision_policy() {
      CronCollisionPolicy::KillExisting => {
        let killed = self.state.change_state(
          &TaskQuery::by_job(key).active(),
          TaskStatus::Killing,
          Some("Killed by cron run".to_string()),
        );
        if let Err(err) = killed {
          error!("Cron kill for {key} failed: {err}");
          return;
        }

        let remaining = self
          .state
          .storage()
          .consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::by_job(key).active()));
        if remaining.is_empty() {
          self.launch(&job, 0);
        } else {
          self.delay_run(&job);
        }
      }
      CronCollisionPolicy::CancelNew => {
        info!("Dropping cron run for {key}: prior tasks still active");
      }
      CronCollisionPolicy::RunOverlap => {
        if active.iter().any(|t| t.status == TaskStatus::Pending) {
          warn!("Suppressing overlapping cron run for {key}: shards still pending");
          return;
        }
        // Shifted shard ids intentionally exceed shard_count; overlapping
        // runs coexist under the same job key.
        let shard_offset = active.iter().map(|t| t.shard_id()).max().unwrap_or(0) + 1;
        self.launch(&job, shard_offset);
      }
    };
  }

  /// Interrupts any queued delayed runs.
  pub fn stop(&self) {
    for (_key, handle) in self.pending_runs.lock().drain() {
      handle.abort();
    }
  }

  fn launch(&self, job: &JobConfiguration, shard_offset: u32) {
    match self.state.insert_tasks(job.shard_configs(shard_offset)) {
      Ok(tasks) => info!("Launched {} tasks for cron job {}", tasks.len(), job.key),
      Err(err) => {
        stats::increment(stats::names::CRON_JOB_LAUNCH_FAILURES);
        error!("Cron launch for {} failed: {err}", job.key);
      }
    };
  }

  /// Queues a poll that waits for the job's prior tasks to reach a terminal
  /// state, then launches. Duplicate queue attempts per job are no-ops.
  fn delay_run(self: &Arc<Self>, job: &JobConfiguration) {
    let mut pending_runs = self.pending_runs.lock();
    match pending_runs.entry(job.key.clone()) {
      Entry::Occupied(_) => {
        debug!("Delayed cron run for {} already queued", job.key);
      }
      Entry::Vacant(entry) => {
        let manager = self.clone();
        let job = job.clone();

        let handle = tokio::spawn(async move {
          let config = manager.config.load_full();
          let mut backoff = config.cron_start_initial_backoff();
          let max_backoff = config.cron_start_max_backoff();

          loop {
            tokio::time::sleep(backoff).await;

            let remaining = manager.state.storage().consistent_read(|state| {
              return state
                .tasks
                .fetch_tasks(&TaskQuery::by_job(&job.key).active())
                .len();
            });
            if remaining == 0 {
              manager.launch(&job, 0);
              break;
            }
            debug!(
              "Delayed cron run for {} waiting on {remaining} tasks",
              job.key
            );
            backoff = std::cmp::min(backoff * 2, max_backoff);
          }

          manager.pending_runs.lock().remove(&job.key);
        });

        entry.insert(handle.abort_handle());
      }
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::fixtures;

  #[test]
  fn test_cron_expression_validation() {
    let scheduler = TokioCronScheduler::new();
    //                                      sec      min  hour  dom  month  dow  year
    assert!(!scheduler.is_valid_schedule("*/100   *    *     *    *      *    *"));
    assert!(scheduler.is_valid_schedule("*/40    *    *     *    *      *    *"));
    assert!(!scheduler.is_valid_schedule("not a schedule"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cron_scheduler_fires() {
    let scheduler = TokioCronScheduler::new();
    let (sender, receiver) = async_channel::unbounded::<()>();

    //               sec  min   hour   day of month   month   day of week  year
    let expression = "*    *     *         *            *         *         *";
    let key = scheduler
      .schedule(
        expression,
        Arc::new(move || {
          let _ = sender.try_send(());
        }),
      )
      .unwrap();
    assert_eq!(scheduler.get_schedule(&key).as_deref(), Some(expression));

    scheduler.start();
    receiver.recv().await.unwrap();

    scheduler.deschedule(&key);
    assert_eq!(scheduler.get_schedule(&key), None);
  }

  #[test]
  fn test_idle_fire_launches_all_shards() {
    let harness = fixtures::StateHarness::new();
    let manager = harness.cron_manager();

    let mut job = fixtures::job_configuration("jim", "nightly", 3);
    job.cron_schedule = Some("0 0 0 * * * *".to_string());
    manager.register_job(job.clone()).unwrap();
    assert!(manager.is_registered(&job.key));

    manager.cron_triggered(&job.key);
    let pending = harness.pending_tasks();
    assert_eq!(pending.len(), 3);
    let shards: Vec<u32> = pending.iter().map(|t| t.shard_id()).collect();
    assert_eq!(shards, vec![0, 1, 2]);
  }

  #[test]
  fn test_register_rejects_invalid_schedule() {
    let harness = fixtures::StateHarness::new();
    let manager = harness.cron_manager();

    let mut job = fixtures::job_configuration("jim", "nightly", 1);
    job.cron_schedule = Some("invalid".to_string());
    assert!(matches!(
      manager.register_job(job.clone()),
      Err(CronError::InvalidSchedule(_))
    ));

    job.cron_schedule = None;
    assert!(matches!(
      manager.register_job(job),
      Err(CronError::NotCron(_))
    ));
  }

  #[test]
  fn test_cancel_new_drops_fire() {
    let harness = fixtures::StateHarness::new();
    let manager = harness.cron_manager();

    let mut job = fixtures::job_configuration("jim", "nightly", 1);
    job.cron_schedule = Some("0 0 0 * * * *".to_string());
    job.cron_collision_policy = Some(CronCollisionPolicy::CancelNew);
    manager.register_job(job.clone()).unwrap();

    manager.cron_triggered(&job.key);
    let first = harness.pending_tasks();
    assert_eq!(first.len(), 1);

    manager.cron_triggered(&job.key);
    assert_eq!(harness.all_tasks().len(), 1);
  }

  #[test]
  fn test_run_overlap_shifts_shard_ids() {
    let harness = fixtures::StateHarness::new();
    let manager = harness.cron_manager();

    let mut job = fixtures::job_configuration("jim", "nightly", 2);
    job.cron_schedule = Some("0 0 0 * * * *".to_string());
    job.cron_collision_policy = Some(CronCollisionPolicy::RunOverlap);
    manager.register_job(job.clone()).unwrap();

    manager.cron_triggered(&job.key);
    // Pending shards suppress an overlapping run outright.
    manager.cron_triggered(&job.key);
    assert_eq!(harness.all_tasks().len(), 2);

    // Once running, the next fire lands above the live shard ids.
    for task in harness.pending_tasks() {
      harness.run_to(task.task_id(), TaskStatus::Running);
    }
    manager.cron_triggered(&job.key);

    let mut shards: Vec<u32> = harness.all_tasks().iter().map(|t| t.shard_id()).collect();
    shards.sort();
    assert_eq!(shards, vec![0, 1, 2, 3]);
  }

  /// Kill-existing with a live task: the fire kills it, queues a delayed
  /// run, and the launch happens once the kill lands.
  #[tokio::test(start_paused = true)]
  async fn test_kill_existing_waits_for_terminal_tasks() {
    let harness = fixtures::StateHarness::new();
    let manager = harness.cron_manager();

    let mut job = fixtures::job_configuration("jim", "nightly", 1);
    job.cron_schedule = Some("0 0 0 * * * *".to_string());
    manager.register_job(job.clone()).unwrap();

    manager.cron_triggered(&job.key);
    let first_id = harness.pending_tasks()[0].task_id().to_string();
    harness.run_to(&first_id, TaskStatus::Running);

    manager.cron_triggered(&job.key);
    let killing = harness.fetch(&first_id).unwrap();
    assert_eq!(killing.status, TaskStatus::Killing);
    // Not yet terminal: nothing new launched, a delayed run is queued.
    assert_eq!(harness.all_tasks().len(), 1);
    assert_eq!(manager.pending_runs.lock().len(), 1);

    // Duplicate fires do not queue a second delayed run.
    manager.cron_triggered(&job.key);
    assert_eq!(manager.pending_runs.lock().len(), 1);

    // The kill lands; the poller notices and launches the fresh run.
    harness
      .state
      .change_state(
        &TaskQuery::by_id(first_id.clone()),
        TaskStatus::Killed,
        None,
      )
      .unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;

    assert!(manager.pending_runs.lock().is_empty());
    let pending = harness.pending_tasks();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].task_id(), first_id);
  }
}
