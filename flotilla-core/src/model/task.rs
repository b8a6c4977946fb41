use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::constraints::Constraint;
use crate::model::job::{Identity, JobKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
  Init,
  Pending,
  Assigned,
  Starting,
  Running,
  Finished,
  Failed,
  Killing,
  Killed,
  Lost,
  Preempting,
  Updating,
  Rollback,
  Restarting,
}

impl TaskStatus {
  /// Terminal states admit no further transitions, only deletion.
  pub fn is_terminal(self) -> bool {
    return matches!(
      self,
      TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Killed | TaskStatus::Lost
    );
  }

  pub fn is_active(self) -> bool {
    return !self.is_terminal();
  }

  pub fn active_statuses() -> BTreeSet<TaskStatus> {
    return [
      TaskStatus::Init,
      TaskStatus::Pending,
      TaskStatus::Assigned,
      TaskStatus::Starting,
      TaskStatus::Running,
      TaskStatus::Killing,
      TaskStatus::Preempting,
      TaskStatus::Updating,
      TaskStatus::Rollback,
      TaskStatus::Restarting,
    ]
    .into();
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return write!(f, "{self:?}");
  }
}

/// One entry in a task's status history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
  pub timestamp: DateTime<Utc>,
  pub status: TaskStatus,
  pub message: Option<String>,
}

/// Immutable description of a single task. Once a task is persisted none of
/// these fields change, short of the operator-only in-place replace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
  pub owner: Identity,
  pub environment: String,
  pub job_name: String,
  /// Dense 0-indexed ordinal within the job.
  pub shard_id: u32,
  pub num_cpus: f64,
  pub ram_mb: u64,
  pub disk_mb: u64,
  pub requested_ports: BTreeSet<String>,
  pub constraints: BTreeSet<Constraint>,
  pub is_service: bool,
  pub production: bool,
  pub priority: i32,
  pub max_task_failures: i32,
  pub contact_email: Option<String>,
  /// Opaque executor payload, carried through untouched.
  pub executor_payload: Bytes,
  pub task_links: BTreeMap<String, String>,
}

impl TaskConfig {
  pub fn job_key(&self) -> JobKey {
    return JobKey {
      role: self.owner.role.clone(),
      environment: self.environment.clone(),
      name: self.job_name.clone(),
    };
  }
}

/// A task plus everything the scheduler has bound to it: the host, the slave
/// and the concrete ports. `assigned_ports` keys are a subset of
/// `config.requested_ports` and are fixed once the task reaches ASSIGNED.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
  pub task_id: String,
  pub config: TaskConfig,
  pub slave_host: Option<String>,
  pub slave_id: Option<String>,
  pub assigned_ports: BTreeMap<String, u16>,
}

/// A task known to storage, with its full status history.
///
/// Invariants: `status` equals the status of the last event, the event list is
/// never empty, and event timestamps are non-decreasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
  pub assigned: AssignedTask,
  pub status: TaskStatus,
  pub events: Vec<TaskEvent>,
  pub ancestor_task_id: Option<String>,
  pub failure_count: i32,
}

impl ScheduledTask {
  pub fn new(task_id: String, config: TaskConfig, now: DateTime<Utc>) -> Self {
    return ScheduledTask {
      assigned: AssignedTask {
        task_id,
        config,
        slave_host: None,
        slave_id: None,
        assigned_ports: BTreeMap::new(),
      },
      status: TaskStatus::Init,
      events: vec![TaskEvent {
        timestamp: now,
        status: TaskStatus::Init,
        message: None,
      }],
      ancestor_task_id: None,
      failure_count: 0,
    };
  }

  pub fn task_id(&self) -> &str {
    return &self.assigned.task_id;
  }

  pub fn config(&self) -> &TaskConfig {
    return &self.assigned.config;
  }

  pub fn job_key(&self) -> JobKey {
    return self.assigned.config.job_key();
  }

  pub fn shard_id(&self) -> u32 {
    return self.assigned.config.shard_id;
  }

  pub fn first_event_timestamp(&self) -> DateTime<Utc> {
    return self.events.first().expect("events never empty").timestamp;
  }

  pub fn latest_event(&self) -> &TaskEvent {
    return self.events.last().expect("events never empty");
  }

  /// Timestamp at which the task entered its current status.
  pub fn current_status_since(&self) -> DateTime<Utc> {
    return self.latest_event().timestamp;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_terminal_states() {
    for status in [
      TaskStatus::Finished,
      TaskStatus::Failed,
      TaskStatus::Killed,
      TaskStatus::Lost,
    ] {
      assert!(status.is_terminal());
      assert!(!TaskStatus::active_statuses().contains(&status));
    }

    assert_eq!(TaskStatus::active_statuses().len(), 10);
    assert!(TaskStatus::active_statuses().contains(&TaskStatus::Killing));
  }

  #[test]
  fn test_job_key_path() {
    let key = JobKey::new("jim", "prod", "my_job");
    assert_eq!(key.to_path(), "jim/prod/my_job");
  }
}
