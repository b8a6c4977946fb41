use std::collections::BTreeSet;

use crate::model::{JobKey, ScheduledTask, TaskStatus};

/// Declarative predicate over stored tasks. Every field is an optional filter;
/// unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskQuery {
  pub task_ids: Option<BTreeSet<String>>,
  pub role: Option<String>,
  pub user: Option<String>,
  pub environment: Option<String>,
  pub job_name: Option<String>,
  pub shard_ids: Option<BTreeSet<u32>>,
  pub slave_host: Option<String>,
  pub statuses: Option<BTreeSet<TaskStatus>>,
}

impl TaskQuery {
  pub fn new() -> Self {
    return TaskQuery::default();
  }

  pub fn by_id(task_id: impl Into<String>) -> Self {
    return TaskQuery {
      task_ids: Some([task_id.into()].into()),
      ..Default::default()
    };
  }

  pub fn by_ids(task_ids: impl IntoIterator<Item = String>) -> Self {
    return TaskQuery {
      task_ids: Some(task_ids.into_iter().collect()),
      ..Default::default()
    };
  }

  pub fn by_job(key: &JobKey) -> Self {
    return TaskQuery {
      role: Some(key.role.clone()),
      environment: Some(key.environment.clone()),
      job_name: Some(key.name.clone()),
      ..Default::default()
    };
  }

  pub fn by_role(role: impl Into<String>) -> Self {
    return TaskQuery {
      role: Some(role.into()),
      ..Default::default()
    };
  }

  pub fn by_host(host: impl Into<String>) -> Self {
    return TaskQuery {
      slave_host: Some(host.into()),
      ..Default::default()
    };
  }

  pub fn by_status(status: TaskStatus) -> Self {
    return TaskQuery {
      statuses: Some([status].into()),
      ..Default::default()
    };
  }

  pub fn with_shards(mut self, shard_ids: impl IntoIterator<Item = u32>) -> Self {
    self.shard_ids = Some(shard_ids.into_iter().collect());
    return self;
  }

  pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
    self.statuses = Some(statuses.into_iter().collect());
    return self;
  }

  /// Restricts the query to non-terminal tasks. Intersects with any status
  /// filter already present.
  pub fn active(mut self) -> Self {
    let active = TaskStatus::active_statuses();
    self.statuses = Some(match self.statuses {
      Some(statuses) => statuses.intersection(&active).copied().collect(),
      None => active,
    });
    return self;
  }

  pub fn matches(&self, task: &ScheduledTask) -> bool {
    let config = task.config();

    if let Some(ref task_ids) = self.task_ids {
      if !task_ids.contains(task.task_id()) {
        return false;
      }
    }
    if let Some(ref role) = self.role {
      if config.owner.role != *role {
        return false;
      }
    }
    if let Some(ref user) = self.user {
      if config.owner.user != *user {
        return false;
      }
    }
    if let Some(ref environment) = self.environment {
      if config.environment != *environment {
        return false;
      }
    }
    if let Some(ref job_name) = self.job_name {
      if config.job_name != *job_name {
        return false;
      }
    }
    if let Some(ref shard_ids) = self.shard_ids {
      if !shard_ids.contains(&config.shard_id) {
        return false;
      }
    }
    if let Some(ref slave_host) = self.slave_host {
      if task.assigned.slave_host.as_deref() != Some(slave_host.as_str()) {
        return false;
      }
    }
    if let Some(ref statuses) = self.statuses {
      if !statuses.contains(&task.status) {
        return false;
      }
    }
    return true;
  }

  /// The single job this query resolves to, if it pins role, environment and
  /// name without pinning ids. Drives index dispatch in the task store.
  pub(crate) fn pinned_job_key(&self) -> Option<JobKey> {
    if self.task_ids.is_some() {
      return None;
    }
    return match (&self.role, &self.environment, &self.job_name) {
      (Some(role), Some(environment), Some(name)) => Some(JobKey {
        role: role.clone(),
        environment: environment.clone(),
        name: name.clone(),
      }),
      _ => None,
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::fixtures;

  #[test]
  fn test_active_intersects_existing_statuses() {
    let query = TaskQuery::new()
      .with_statuses([TaskStatus::Pending, TaskStatus::Finished])
      .active();
    assert_eq!(query.statuses, Some([TaskStatus::Pending].into()));
  }

  #[test]
  fn test_matches() {
    let task = fixtures::scheduled_task("task-0", "jim", "my_job", 0, TaskStatus::Running);

    assert!(TaskQuery::by_id("task-0").matches(&task));
    assert!(!TaskQuery::by_id("task-1").matches(&task));
    assert!(TaskQuery::by_job(&JobKey::new("jim", "test", "my_job")).matches(&task));
    assert!(!TaskQuery::by_job(&JobKey::new("bob", "test", "my_job")).matches(&task));
    assert!(TaskQuery::by_status(TaskStatus::Running).matches(&task));
    assert!(TaskQuery::new().active().matches(&task));
    assert!(!TaskQuery::by_status(TaskStatus::Pending).matches(&task));
  }

  #[test]
  fn test_pinned_job_key() {
    let key = JobKey::new("jim", "test", "my_job");
    assert_eq!(TaskQuery::by_job(&key).pinned_job_key(), Some(key.clone()));
    assert_eq!(TaskQuery::by_role("jim").pinned_job_key(), None);
    // Pinned ids win over the job key.
    let mut query = TaskQuery::by_job(&key);
    query.task_ids = Some(["task-0".to_string()].into());
    assert_eq!(query.pinned_job_key(), None);
  }
}
