use chrono::Utc;
use log::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::admission::{check_quota, validate_and_populate, ValidationError};
use crate::assigner::TaskAssigner;
use crate::codec::Codec;
use crate::config::{validate_config, ConfigError, ConfigHandle, SchedulerConfig};
use crate::constants::IMMEDIATE_MANAGER_KEY;
use crate::cron::{CronError, CronJobManager, CronScheduler};
use crate::driver::{spawn_driver_dispatcher, AttributeLoader, Driver, DriverCall, DriverHandle};
use crate::events::{self, EventBus, SchedulerEvent};
use crate::filter::SchedulingFilter;
use crate::model::{JobConfiguration, JobKey, TaskStatus};
use crate::preemption::Preempter;
use crate::query::TaskQuery;
use crate::state_machine::{apply_transition, StateManager};
use crate::storage::{Storage, StorageError};
use crate::updates::UpdateManager;

#[derive(Debug, Error)]
pub enum SchedulerError {
  #[error("Validation error: {0}")]
  Validation(#[from] ValidationError),
  #[error("Cron error: {0}")]
  Cron(#[from] CronError),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
}

pub struct SchedulerArgs {
  pub config: SchedulerConfig,
  pub driver: Arc<dyn Driver>,
  pub cron: Arc<dyn CronScheduler>,
  pub codec: Arc<dyn Codec>,
  pub attribute_loader: Option<Arc<dyn AttributeLoader>>,
}

/// The assembled scheduling core: storage, state machine, offer matching,
/// preemption, cron materialization and rolling updates behind one handle.
pub struct Scheduler {
  pub config: Arc<ConfigHandle>,
  pub bus: EventBus,
  pub storage: Storage,
  pub state: StateManager,
  pub assigner: TaskAssigner,
  pub updates: UpdateManager,
  pub preempter: Arc<Preempter>,
  pub cron: Arc<CronJobManager>,

  cron_port: Arc<dyn CronScheduler>,
  driver: Arc<dyn Driver>,
  driver_receiver: Mutex<Option<async_channel::Receiver<DriverCall>>>,
  tickers: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl Scheduler {
  pub fn new(args: SchedulerArgs) -> Result<Self, SchedulerError> {
    validate_config(&args.config)?;
    let config = Arc::new(ConfigHandle::new(args.config));

    let bus = EventBus::new();
    bus.subscribe(events::log_event);

    let (driver_handle, driver_receiver) = DriverHandle::new_pair();
    let storage = Storage::new(&config.load(), bus.clone(), driver_handle.clone());
    let state = StateManager::new(storage.clone());
    let filter = SchedulingFilter::new(storage.clone());

    let assigner = TaskAssigner::new(
      state.clone(),
      filter.clone(),
      driver_handle.clone(),
      args.codec,
      args.attribute_loader,
      config.clone(),
    );
    let updates = UpdateManager::new(state.clone());
    let preempter = Arc::new(Preempter::new(state.clone(), filter, config.clone()));
    let cron = CronJobManager::new(state.clone(), args.cron.clone(), config.clone());

    // Completed kills release the matching preemption claim.
    let preempter_clone = preempter.clone();
    bus.subscribe(move |event| {
      let SchedulerEvent::TaskStateChange { task, .. } = event else {
        return;
      };
      if !task.status.is_terminal() {
        return;
      }
      if let Some(claim) = preempter_clone.release_claim(task.task_id()) {
        info!(
          "Slot on {} freed for preemption candidate {}",
          claim.host, claim.candidate_task_id
        );
      }
    });

    return Ok(Scheduler {
      config,
      bus,
      storage,
      state,
      assigner,
      updates,
      preempter,
      cron,
      cron_port: args.cron,
      driver: args.driver,
      driver_receiver: Mutex::new(Some(driver_receiver)),
      tickers: Mutex::new(Vec::new()),
    });
  }

  /// Brings the core online: repairs storage, replays cron registrations and
  /// starts the periodic machinery. Requires a tokio runtime.
  pub fn start(&self) -> Result<(), SchedulerError> {
    let mut tickers = self.tickers.lock();

    if let Some(receiver) = self.driver_receiver.lock().take() {
      tickers.push(spawn_driver_dispatcher(receiver, self.driver.clone()));
    }

    // Index rebuild and duplicate-shard repair, then the started event.
    let now = Utc::now();
    self.storage.write(move |state, work| {
      let duplicates = state.tasks.backfill();
      for task_id in duplicates {
        apply_transition(
          state,
          work,
          &task_id,
          TaskStatus::Killing,
          Some("Duplicate shard repair".to_string()),
          now,
        );
      }
      work.push_event(SchedulerEvent::StorageStarted);
      return Ok(());
    })?;

    self.cron.storage_started();
    self.cron_port.start();
    tickers.push(self.preempter.start());
    return Ok(());
  }

  pub fn stop(&self) {
    for ticker in self.tickers.lock().drain(..) {
      ticker.abort();
    }
    self.cron.stop();
    self.cron_port.stop();
  }

  /// Admits a job: validates, charges quota, persists and launches (or, for
  /// cron jobs, registers the schedule).
  pub fn create_job(&self, mut job: JobConfiguration) -> Result<(), SchedulerError> {
    validate_and_populate(&mut job, &self.config.load())?;

    let quota = self
      .storage
      .consistent_read(|state| check_quota(state, &job));
    quota?;

    if job.is_cron() {
      self.cron.register_job(job)?;
      return Ok(());
    }

    let stored = job.clone();
    self.storage.write(move |state, _work| {
      state.jobs.save_job(IMMEDIATE_MANAGER_KEY, stored.clone());
      return Ok(());
    })?;
    self.state.insert_tasks(job.shard_configs(0))?;
    return Ok(());
  }

  /// Tears a job down: removes the stored configuration (stopping service
  /// respawns and cron fires), then kills whatever is still active.
  pub fn kill_job(&self, key: &JobKey) -> Result<usize, SchedulerError> {
    if self.cron.is_registered(key) {
      self.cron.deregister_job(key)?;
    }
    let key_clone = key.clone();
    self.storage.write(move |state, _work| {
      state.jobs.remove_job(IMMEDIATE_MANAGER_KEY, &key_clone);
      return Ok(());
    })?;

    let killed = self.state.change_state(
      &TaskQuery::by_job(key).active(),
      TaskStatus::Killing,
      Some("Killed by user request".to_string()),
    )?;
    return Ok(killed);
  }

  /// Restarts the given shards by killing their running tasks; replacements
  /// are created when the kills land.
  pub fn restart_shards(
    &self,
    key: &JobKey,
    shards: &BTreeSet<u32>,
  ) -> Result<usize, SchedulerError> {
    let restarted = self.state.change_state(
      &TaskQuery::by_job(key).with_shards(shards.iter().copied()),
      TaskStatus::Restarting,
      Some("Restarted by user request".to_string()),
    )?;
    return Ok(restarted);
  }
}
