use chrono::Utc;
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::constants::UPDATE_TOKEN_LENGTH;
use crate::model::{JobKey, TaskConfig, TaskStatus};
use crate::query::TaskQuery;
use crate::state_machine::{apply_transition, create_pending_task, StateManager};
use crate::storage::{
  ShardUpdateConfiguration, StorageError, UpdateConfiguration,
};

#[derive(Debug, Error)]
pub enum UpdateError {
  #[error("No update in progress for {0}")]
  NoUpdateInProgress(JobKey),
  #[error("An update is already in progress for {0}")]
  UpdateInProgress(JobKey),
  #[error("Invalid update token for {0}")]
  InvalidToken(JobKey),
  #[error("Update for {0} cannot finish while shards are updating")]
  ShardsStillUpdating(JobKey),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardUpdateResult {
  /// The shard had no live task; one was created from the target config.
  Added,
  /// The live task is being killed and will be replaced.
  Restarting,
  /// The live task already matches the target config.
  Unchanged,
  /// Nothing to do for this shard.
  Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateResult {
  Success,
  Failed,
}

/// Tracks one rolling update per job: an opaque token, a per-shard pairing of
/// old and new configs, and the forward/backward shard transitions.
#[derive(Clone)]
pub struct UpdateManager {
  state: StateManager,
}

impl UpdateManager {
  pub fn new(state: StateManager) -> Self {
    return UpdateManager { state };
  }

  /// Pairs the job's current shard configs with `new_configs` and persists
  /// them under a fresh token. Only one update may be registered per job.
  pub fn register_update(
    &self,
    key: &JobKey,
    new_configs: Vec<TaskConfig>,
  ) -> Result<String, UpdateError> {
    let token = crate::rand::generate_random_string(UPDATE_TOKEN_LENGTH);
    let key = key.clone();

    let result = self.state.storage().write(move |state, _work| {
      if state.updates.fetch_update(&key).is_some() {
        return Ok(Err(UpdateError::UpdateInProgress(key.clone())));
      }

      let mut old_by_shard: BTreeMap<u32, TaskConfig> = BTreeMap::new();
      for task in state.tasks.fetch_tasks(&TaskQuery::by_job(&key).active()) {
        old_by_shard.insert(task.shard_id(), task.config().clone());
      }
      let mut new_by_shard: BTreeMap<u32, TaskConfig> = new_configs
        .into_iter()
        .map(|config| (config.shard_id, config))
        .collect();

      let shard_ids: BTreeSet<u32> = old_by_shard
        .keys()
        .chain(new_by_shard.keys())
        .copied()
        .collect();
      let shards = shard_ids
        .into_iter()
        .map(|shard_id| {
          return ShardUpdateConfiguration {
            shard_id,
            old: old_by_shard.remove(&shard_id),
            new: new_by_shard.remove(&shard_id),
          };
        })
        .collect();

      state.updates.save_update(UpdateConfiguration {
        job_key: key.clone(),
        token: token.clone(),
        shards,
      });
      return Ok(Ok(token.clone()));
    })?;
    return result;
  }

  /// Rolls the given shards forward to their new configs, or backward to
  /// their old ones. Live tasks are retired through UPDATING/ROLLBACK; their
  /// replacements materialize when the kill completes.
  pub fn modify_shards(
    &self,
    key: &JobKey,
    user: &str,
    shards: &BTreeSet<u32>,
    token: &str,
    rolling_forward: bool,
  ) -> Result<BTreeMap<u32, ShardUpdateResult>, UpdateError> {
    let now = Utc::now();
    let key = key.clone();
    let user = user.to_string();
    let token = token.to_string();
    let shards = shards.clone();

    let result = self.state.storage().write(move |state, work| {
      let Some(update) = state.updates.fetch_update(&key) else {
        return Ok(Err(UpdateError::NoUpdateInProgress(key.clone())));
      };
      if update.token != token {
        return Ok(Err(UpdateError::InvalidToken(key.clone())));
      }

      let transition = if rolling_forward {
        TaskStatus::Updating
      } else {
        TaskStatus::Rollback
      };

      let mut results = BTreeMap::new();
      for shard_id in shards {
        let target = update.shard(shard_id).and_then(|shard| {
          return if rolling_forward {
            shard.new.clone()
          } else {
            shard.old.clone()
          };
        });
        let existing = state
          .tasks
          .fetch_tasks(&TaskQuery::by_job(&key).with_shards([shard_id]).active())
          .pop();

        let result = match (existing, target) {
          (Some(task), Some(ref target)) if task.config() == target => {
            ShardUpdateResult::Unchanged
          }
          (Some(task), target) => {
            if task.status == TaskStatus::Pending {
              // Nothing is running; swap the config directly.
              apply_transition(state, work, task.task_id(), TaskStatus::Killing, None, now);
              if let Some(config) = target {
                let _ = create_pending_task(state, work, config, None, 0, now);
              }
            } else {
              apply_transition(
                state,
                work,
                task.task_id(),
                transition,
                Some(format!("Shard updated by {user}")),
                now,
              );
            }
            ShardUpdateResult::Restarting
          }
          (None, Some(config)) => {
            let _ = create_pending_task(state, work, config, None, 0, now);
            ShardUpdateResult::Added
          }
          (None, None) => ShardUpdateResult::Completed,
        };
        results.insert(shard_id, result);
      }
      return Ok(Ok(results));
    })?;
    return result;
  }

  /// Clears the registered update. Fails while any shard is mid-transition.
  /// With no token, no registered update and `expect_update_config` unset
  /// this is an idempotent no-op returning `false`.
  pub fn finish_update(
    &self,
    key: &JobKey,
    user: &str,
    token: Option<&str>,
    result: UpdateResult,
    expect_update_config: bool,
  ) -> Result<bool, UpdateError> {
    let key = key.clone();
    let user = user.to_string();
    let token = token.map(str::to_string);

    let outcome = self.state.storage().write(move |state, _work| {
      let in_flight = state
        .tasks
        .fetch_tasks(&TaskQuery::by_job(&key).with_statuses([
          TaskStatus::Updating,
          TaskStatus::Rollback,
        ]));
      if !in_flight.is_empty() {
        return Ok(Err(UpdateError::ShardsStillUpdating(key.clone())));
      }

      let stored = state.updates.fetch_update(&key);
      return match (stored, token) {
        (None, None) if !expect_update_config => Ok(Ok(false)),
        (None, _) => Ok(Err(UpdateError::NoUpdateInProgress(key.clone()))),
        (Some(ref update), Some(ref token)) if update.token != *token => {
          Ok(Err(UpdateError::InvalidToken(key.clone())))
        }
        (Some(_), _) => {
          state.updates.remove_update(&key);
          info!("Update for {key} finished by {user}: {result:?}");
          Ok(Ok(true))
        }
      };
    })?;
    return outcome;
  }
}
