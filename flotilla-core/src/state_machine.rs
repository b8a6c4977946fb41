use chrono::{DateTime, Utc};
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::driver::DriverCall;
use crate::events::SchedulerEvent;
use crate::model::{ScheduledTask, TaskConfig, TaskEvent, TaskStatus};
use crate::query::TaskQuery;
use crate::stats;
use crate::storage::{Storage, StorageError, StoreState, WorkQueue};

/// The authoritative transition table. Terminal states have no outgoing
/// transitions; everything not listed here is illegal and ignored.
pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
  use TaskStatus::*;

  return match from {
    Init => matches!(to, Pending),
    Pending => matches!(to, Assigned | Killing),
    Assigned => matches!(to, Starting | Preempting | Killing | Lost | Updating | Rollback),
    Starting => matches!(to, Running | Failed | Killing | Lost | Updating | Rollback),
    Running => matches!(
      to,
      Finished
        | Failed
        | Killed
        | Killing
        | Lost
        | Preempting
        | Updating
        | Rollback
        | Restarting
    ),
    Killing => matches!(to, Killed | Lost),
    Preempting => matches!(to, Killed | Lost),
    Updating => matches!(to, Killed | Finished | Killing | Lost),
    Rollback => matches!(to, Killed | Finished | Killing | Lost),
    Restarting => matches!(to, Killed | Lost),
    Finished | Failed | Killed | Lost => false,
  };
}

/// Entering one of these states requires the underlying process be killed.
fn requires_kill(to: TaskStatus) -> bool {
  return matches!(
    to,
    TaskStatus::Killing
      | TaskStatus::Preempting
      | TaskStatus::Updating
      | TaskStatus::Rollback
      | TaskStatus::Restarting
  );
}

pub(crate) fn generate_task_id(config: &TaskConfig) -> String {
  return format!(
    "{}-{}-{}-{}-{}",
    config.owner.role,
    config.environment,
    config.job_name,
    config.shard_id,
    Uuid::new_v4()
  );
}

/// Drives every status change of every task. All mutations run inside
/// storage writes; events and driver kills queue up per write and fire after
/// commit.
#[derive(Clone)]
pub struct StateManager {
  storage: Storage,
}

impl StateManager {
  pub fn new(storage: Storage) -> Self {
    return StateManager { storage };
  }

  pub fn storage(&self) -> &Storage {
    return &self.storage;
  }

  /// Creates one PENDING task per config. Configs whose (job, shard) already
  /// has an active task are skipped and counted, never doubled up.
  pub fn insert_tasks(
    &self,
    configs: Vec<TaskConfig>,
  ) -> Result<Vec<ScheduledTask>, StorageError> {
    let now = Utc::now();
    return self.storage.write(move |state, work| {
      let mut created = Vec::new();
      for config in configs {
        if let Some(task) = create_pending_task(state, work, config, None, 0, now) {
          created.push(task);
        }
      }
      return Ok(created);
    });
  }

  /// Applies `to` to every task matching `query`. Illegal transitions are
  /// logged and skipped; the return value counts tasks actually changed.
  pub fn change_state(
    &self,
    query: &TaskQuery,
    to: TaskStatus,
    message: Option<String>,
  ) -> Result<usize, StorageError> {
    let now = Utc::now();
    let query = query.clone();
    return self.storage.write(move |state, work| {
      let task_ids: Vec<String> = state
        .tasks
        .fetch_tasks(&query)
        .into_iter()
        .map(|task| task.task_id().to_string())
        .collect();

      let mut changed = 0;
      for task_id in &task_ids {
        if apply_transition(state, work, task_id, to, message.clone(), now) {
          changed += 1;
        }
      }
      return Ok(changed);
    });
  }

  /// Binds a PENDING task to a slot: host, slave and concrete ports, then
  /// moves it to ASSIGNED. Ports become fixed here.
  pub fn assign_task(
    &self,
    task_id: &str,
    slave_host: &str,
    slave_id: &str,
    ports: BTreeMap<String, u16>,
  ) -> Result<Option<ScheduledTask>, StorageError> {
    let now = Utc::now();
    return self.storage.write(move |state, work| {
      let Some(task) = state.tasks.get(task_id) else {
        warn!("Cannot assign unknown task {task_id}");
        return Ok(None);
      };
      if task.status != TaskStatus::Pending {
        warn!("Cannot assign task {task_id} in state {}", task.status);
        return Ok(None);
      }

      let requested: BTreeSet<&String> = task.config().requested_ports.iter().collect();
      if !ports.keys().all(|name| requested.contains(name)) {
        return Err(StorageError::Transaction(format!(
          "Assigned ports {ports:?} exceed requested ports for {task_id}"
        )));
      }

      let mut assigned = task.clone();
      assigned.assigned.slave_host = Some(slave_host.to_string());
      assigned.assigned.slave_id = Some(slave_id.to_string());
      assigned.assigned.assigned_ports = ports;
      push_status(&mut assigned, TaskStatus::Assigned, None, now);

      state.tasks.save_tasks(vec![assigned.clone()]);
      work.push_event(SchedulerEvent::TaskStateChange {
        task: assigned.clone(),
        old_status: Some(TaskStatus::Pending),
      });
      return Ok(Some(assigned));
    });
  }

  /// Removes tasks outright. Only terminal tasks may be deleted; active ids
  /// are skipped and logged.
  pub fn delete_tasks(&self, task_ids: &BTreeSet<String>) -> Result<usize, StorageError> {
    let task_ids = task_ids.clone();
    return self.storage.write(move |state, work| {
      let mut deletable = BTreeSet::new();
      for task_id in &task_ids {
        match state.tasks.get(task_id) {
          Some(task) if task.status.is_terminal() => {
            deletable.insert(task_id.clone());
          }
          Some(task) => {
            warn!(
              "Refusing to delete task {task_id} in non-terminal state {}",
              task.status
            );
          }
          None => {}
        };
      }

      let removed = state.tasks.delete_tasks(&deletable);
      if !removed.is_empty() {
        work.push_event(SchedulerEvent::TasksDeleted {
          task_ids: deletable,
        });
      }
      return Ok(removed.len());
    });
  }
}

fn push_status(
  task: &mut ScheduledTask,
  to: TaskStatus,
  message: Option<String>,
  now: DateTime<Utc>,
) {
  // Event timestamps never run backwards, even under clock skew.
  let timestamp = now.max(task.latest_event().timestamp);
  task.events.push(TaskEvent {
    timestamp,
    status: to,
    message,
  });
  task.status = to;
}

/// Applies a single transition inside an open storage write. Returns whether
/// the task changed.
pub(crate) fn apply_transition(
  state: &mut StoreState,
  work: &mut WorkQueue,
  task_id: &str,
  to: TaskStatus,
  message: Option<String>,
  now: DateTime<Utc>,
) -> bool {
  let Some(task) = state.tasks.get(task_id) else {
    debug!("Ignoring transition to {to} for unknown task {task_id}");
    return false;
  };
  let from = task.status;

  // Killing a task that never left PENDING: nothing is running anywhere, so
  // the task is simply deleted.
  if from == TaskStatus::Pending && to == TaskStatus::Killing {
    state.tasks.delete_tasks(&[task_id.to_string()].into());
    work.push_event(SchedulerEvent::TasksDeleted {
      task_ids: [task_id.to_string()].into(),
    });
    return true;
  }

  if !is_transition_allowed(from, to) {
    stats::increment(stats::names::ILLEGAL_TRANSITIONS);
    warn!("Illegal state transition for {task_id}: {from} -> {to}");
    return false;
  }

  let mut updated = task.clone();
  push_status(&mut updated, to, message, now);
  state.tasks.save_tasks(vec![updated.clone()]);

  work.push_event(SchedulerEvent::TaskStateChange {
    task: updated.clone(),
    old_status: Some(from),
  });
  if requires_kill(to) {
    work.push_driver_call(DriverCall::KillTask {
      task_id: task_id.to_string(),
    });
  }
  if to.is_terminal() {
    maybe_create_successor(state, work, &updated, from, now);
  }
  return true;
}

/// Rescheduling rules applied when a task reaches a terminal state.
fn maybe_create_successor(
  state: &mut StoreState,
  work: &mut WorkQueue,
  task: &ScheduledTask,
  from: TaskStatus,
  now: DateTime<Utc>,
) {
  let config = task.config().clone();
  let job_key = task.job_key();
  let to = task.status;

  // Tasks retired by an update or rollback are replaced with the
  // configuration the update store dictates, not their own.
  if from == TaskStatus::Updating || from == TaskStatus::Rollback {
    let Some(update) = state.updates.fetch_update(&job_key) else {
      warn!(
        "Task {} finished {from} with no registered update for {job_key}",
        task.task_id()
      );
      return;
    };
    let replacement = update.shard(task.shard_id()).and_then(|shard| {
      return match from {
        TaskStatus::Updating => shard.new.clone(),
        _ => shard.old.clone(),
      };
    });
    if let Some(replacement) = replacement {
      let _ = create_pending_task(
        state,
        work,
        replacement,
        Some(task.task_id().to_string()),
        task.failure_count,
        now,
      );
    }
    return;
  }

  if !config.is_service && to == TaskStatus::Failed {
    if task.failure_count < config.max_task_failures {
      let _ = create_pending_task(
        state,
        work,
        config,
        Some(task.task_id().to_string()),
        task.failure_count + 1,
        now,
      );
    }
    return;
  }

  if config.is_service && state.jobs.contains_job(&job_key) {
    let failure_count = task.failure_count + i32::from(to == TaskStatus::Failed);
    let _ = create_pending_task(
      state,
      work,
      config,
      Some(task.task_id().to_string()),
      failure_count,
      now,
    );
    return;
  }

  // Work interrupted through no fault of its own is re-queued: preempted and
  // restarted tasks, and anything the cluster lost.
  if matches!(from, TaskStatus::Preempting | TaskStatus::Restarting) || to == TaskStatus::Lost {
    let _ = create_pending_task(
      state,
      work,
      config,
      Some(task.task_id().to_string()),
      task.failure_count,
      now,
    );
  }
}

/// Creates a fresh PENDING task, refusing to violate shard uniqueness.
pub(crate) fn create_pending_task(
  state: &mut StoreState,
  work: &mut WorkQueue,
  config: TaskConfig,
  ancestor_task_id: Option<String>,
  failure_count: i32,
  now: DateTime<Utc>,
) -> Option<ScheduledTask> {
  let job_key = config.job_key();
  let shard_id = config.shard_id;

  let occupied = state
    .tasks
    .fetch_tasks(&TaskQuery::by_job(&job_key).with_shards([shard_id]).active());
  if !occupied.is_empty() {
    stats::increment(stats::names::SHARD_UNIQUENESS_REPAIRS);
    error!(
      "Refusing to create duplicate active task for {job_key}/{shard_id}; existing: {:?}",
      occupied.iter().map(|t| t.task_id()).collect::<Vec<_>>()
    );
    return None;
  }

  let mut task = ScheduledTask::new(generate_task_id(&config), config, now);
  task.ancestor_task_id = ancestor_task_id;
  task.failure_count = failure_count;
  push_status(&mut task, TaskStatus::Pending, None, now);

  state.tasks.save_tasks(vec![task.clone()]);
  work.push_event(SchedulerEvent::TaskStateChange {
    task: task.clone(),
    old_status: Some(TaskStatus::Init),
  });
  return Some(task);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::JobKey;
  use crate::test::fixtures;

  #[test]
  fn test_transition_table() {
    use TaskStatus::*;

    assert!(is_transition_allowed(Init, Pending));
    assert!(is_transition_allowed(Pending, Assigned));
    assert!(is_transition_allowed(Running, Preempting));
    assert!(is_transition_allowed(Updating, Finished));
    assert!(is_transition_allowed(Restarting, Killed));

    assert!(!is_transition_allowed(Pending, Running));
    assert!(!is_transition_allowed(Assigned, Finished));
    assert!(!is_transition_allowed(Running, Running));
    for terminal in [Finished, Failed, Killed, Lost] {
      for to in [Pending, Running, Killed, Lost] {
        assert!(!is_transition_allowed(terminal, to));
      }
    }
  }

  #[test]
  fn test_basic_lifecycle_events_stay_coherent() {
    let harness = fixtures::StateHarness::new();
    let created = harness
      .state
      .insert_tasks(vec![fixtures::task_config("jim", "my_job", 0)])
      .unwrap();
    assert_eq!(created.len(), 1);
    let task_id = created[0].task_id().to_string();
    assert_eq!(created[0].status, TaskStatus::Pending);

    for to in [
      TaskStatus::Assigned,
      TaskStatus::Starting,
      TaskStatus::Running,
      TaskStatus::Finished,
    ] {
      let changed = harness
        .state
        .change_state(&TaskQuery::by_id(task_id.clone()), to, None)
        .unwrap();
      assert_eq!(changed, 1, "transition to {to}");
    }

    let task = harness.fetch(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
    assert_eq!(task.latest_event().status, TaskStatus::Finished);
    assert_eq!(task.events.len(), 6);
    for window in task.events.windows(2) {
      assert!(window[0].timestamp <= window[1].timestamp);
    }
    // Non-service, FINISHED: no successor, failure count untouched.
    assert_eq!(task.failure_count, 0);
    assert_eq!(harness.all_tasks().len(), 1);
  }

  #[test]
  fn test_illegal_transition_leaves_task_unchanged() {
    let harness = fixtures::StateHarness::new();
    let created = harness
      .state
      .insert_tasks(vec![fixtures::task_config("jim", "my_job", 0)])
      .unwrap();
    let task_id = created[0].task_id().to_string();
    let before = harness.fetch(&task_id).unwrap();

    let changed = harness
      .state
      .change_state(
        &TaskQuery::by_id(task_id.clone()),
        TaskStatus::Running,
        None,
      )
      .unwrap();

    assert_eq!(changed, 0);
    assert_eq!(harness.fetch(&task_id).unwrap(), before);
  }

  #[test]
  fn test_kill_from_pending_deletes() {
    let harness = fixtures::StateHarness::new();
    let created = harness
      .state
      .insert_tasks(vec![fixtures::task_config("jim", "my_job", 0)])
      .unwrap();
    let task_id = created[0].task_id().to_string();

    let changed = harness
      .state
      .change_state(
        &TaskQuery::by_id(task_id.clone()),
        TaskStatus::Killing,
        None,
      )
      .unwrap();
    assert_eq!(changed, 1);
    assert!(harness.fetch(&task_id).is_none());
    // No process existed, so no kill goes to the driver.
    assert!(harness.driver_calls().is_empty());

    // A second request finds nothing to change.
    let changed = harness
      .state
      .change_state(&TaskQuery::by_id(task_id), TaskStatus::Killing, None)
      .unwrap();
    assert_eq!(changed, 0);
  }

  #[test]
  fn test_kill_requiring_transitions_enqueue_driver_kill() {
    let harness = fixtures::StateHarness::new();
    let task_id = harness.insert_running_task("jim", "my_job", 0);

    harness
      .state
      .change_state(
        &TaskQuery::by_id(task_id.clone()),
        TaskStatus::Preempting,
        Some("preempted".to_string()),
      )
      .unwrap();

    assert_eq!(
      harness.driver_calls(),
      vec![DriverCall::KillTask {
        task_id: task_id.clone()
      }]
    );
  }

  #[test]
  fn test_failed_task_reschedules_until_limit() {
    let harness = fixtures::StateHarness::new();
    let mut config = fixtures::task_config("jim", "my_job", 0);
    config.max_task_failures = 2;
    let created = harness.state.insert_tasks(vec![config]).unwrap();
    let first_id = created[0].task_id().to_string();

    harness.run_to(&first_id, TaskStatus::Running);
    harness
      .state
      .change_state(&TaskQuery::by_id(first_id.clone()), TaskStatus::Failed, None)
      .unwrap();

    let pending = harness.pending_tasks();
    assert_eq!(pending.len(), 1);
    let second = &pending[0];
    assert_eq!(second.ancestor_task_id.as_deref(), Some(first_id.as_str()));
    assert_eq!(second.failure_count, 1);
    assert_eq!(second.config(), harness.fetch(&first_id).unwrap().config());

    // Second failure exhausts max_task_failures = 2.
    let second_id = second.task_id().to_string();
    harness.run_to(&second_id, TaskStatus::Running);
    harness
      .state
      .change_state(&TaskQuery::by_id(second_id.clone()), TaskStatus::Failed, None)
      .unwrap();

    let third = harness.pending_tasks();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].failure_count, 2);
    let third_id = third[0].task_id().to_string();
    harness.run_to(&third_id, TaskStatus::Running);
    harness
      .state
      .change_state(&TaskQuery::by_id(third_id), TaskStatus::Failed, None)
      .unwrap();
    assert!(harness.pending_tasks().is_empty());
  }

  #[test]
  fn test_service_task_reschedules_while_job_exists() {
    let harness = fixtures::StateHarness::new();
    let mut job = fixtures::job_configuration("jim", "my_job", 1);
    job.task.is_service = true;
    harness
      .state
      .storage()
      .write(|state, _work| {
        state
          .jobs
          .save_job(crate::constants::IMMEDIATE_MANAGER_KEY, job.clone());
        return Ok(());
      })
      .unwrap();

    let mut config = fixtures::task_config("jim", "my_job", 0);
    config.is_service = true;
    let created = harness.state.insert_tasks(vec![config]).unwrap();
    let task_id = created[0].task_id().to_string();

    harness.run_to(&task_id, TaskStatus::Running);
    harness
      .state
      .change_state(&TaskQuery::by_id(task_id.clone()), TaskStatus::Finished, None)
      .unwrap();
    assert_eq!(harness.pending_tasks().len(), 1);

    // Remove the job; the replacement's terminal transition spawns nothing.
    harness
      .state
      .storage()
      .write(|state, _work| {
        state
          .jobs
          .remove_job(crate::constants::IMMEDIATE_MANAGER_KEY, &job.key);
        return Ok(());
      })
      .unwrap();
    let replacement_id = harness.pending_tasks()[0].task_id().to_string();
    harness.run_to(&replacement_id, TaskStatus::Running);
    harness
      .state
      .change_state(&TaskQuery::by_id(replacement_id), TaskStatus::Finished, None)
      .unwrap();
    assert!(harness.pending_tasks().is_empty());
  }

  #[test]
  fn test_lost_task_requeues() {
    let harness = fixtures::StateHarness::new();
    let task_id = harness.insert_running_task("jim", "my_job", 0);

    harness
      .state
      .change_state(&TaskQuery::by_id(task_id.clone()), TaskStatus::Lost, None)
      .unwrap();

    let pending = harness.pending_tasks();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].ancestor_task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(pending[0].failure_count, 0);
  }

  #[test]
  fn test_successor_refused_when_shard_occupied() {
    let harness = fixtures::StateHarness::new();
    let task_id = harness.insert_running_task("jim", "my_job", 0);

    // A conflicting active task sneaks in under the same (job, shard).
    harness
      .state
      .storage()
      .write(|state, _work| {
        state.tasks.save_tasks(vec![fixtures::scheduled_task(
          "intruder",
          "jim",
          "my_job",
          0,
          TaskStatus::Running,
        )]);
        return Ok(());
      })
      .unwrap();

    harness
      .state
      .change_state(&TaskQuery::by_id(task_id), TaskStatus::Lost, None)
      .unwrap();
    assert!(harness.pending_tasks().is_empty());
  }

  #[test]
  fn test_delete_requires_terminal_state() {
    let harness = fixtures::StateHarness::new();
    let task_id = harness.insert_running_task("jim", "my_job", 0);

    let deleted = harness
      .state
      .delete_tasks(&[task_id.clone()].into())
      .unwrap();
    assert_eq!(deleted, 0);
    assert!(harness.fetch(&task_id).is_some());

    harness
      .state
      .change_state(&TaskQuery::by_id(task_id.clone()), TaskStatus::Finished, None)
      .unwrap();
    let deleted = harness
      .state
      .delete_tasks(&[task_id.clone()].into())
      .unwrap();
    assert_eq!(deleted, 1);
    assert!(harness.fetch(&task_id).is_none());
  }

  #[test]
  fn test_insert_skips_occupied_shard() {
    let harness = fixtures::StateHarness::new();
    harness
      .state
      .insert_tasks(vec![fixtures::task_config("jim", "my_job", 0)])
      .unwrap();
    let created = harness
      .state
      .insert_tasks(vec![fixtures::task_config("jim", "my_job", 0)])
      .unwrap();
    assert!(created.is_empty());

    let key = JobKey::new("jim", "test", "my_job");
    let active = harness.state.storage().consistent_read(|state| {
      return state.tasks.fetch_tasks(&TaskQuery::by_job(&key).active());
    });
    assert_eq!(active.len(), 1);
  }
}
