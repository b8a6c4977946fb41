use serde::{Deserialize, Serialize};

use crate::model::task::TaskConfig;

/// Owner of a job: the role tasks are accounted under and the submitting user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
  pub role: String,
  pub user: String,
}

/// (role, environment, name) triple uniquely identifying a job.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
  pub role: String,
  pub environment: String,
  pub name: String,
}

impl JobKey {
  pub fn new(
    role: impl Into<String>,
    environment: impl Into<String>,
    name: impl Into<String>,
  ) -> Self {
    return JobKey {
      role: role.into(),
      environment: environment.into(),
      name: name.into(),
    };
  }

  pub fn to_path(&self) -> String {
    return format!("{}/{}/{}", self.role, self.environment, self.name);
  }
}

impl std::fmt::Display for JobKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return write!(f, "{}", self.to_path());
  }
}

/// What to do when a cron fire finds prior tasks for the same job still active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronCollisionPolicy {
  /// Kill whatever is still active, then launch once everything is terminal.
  #[default]
  KillExisting,
  /// Drop the new run.
  CancelNew,
  /// Launch alongside the existing tasks, shifting shard ids past the live ones.
  RunOverlap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
  pub key: JobKey,
  pub owner: Identity,
  /// Template every shard is stamped from; `shard_id` is assigned at launch.
  pub task: TaskConfig,
  pub shard_count: u32,
  pub cron_schedule: Option<String>,
  pub cron_collision_policy: Option<CronCollisionPolicy>,
}

impl JobConfiguration {
  pub fn is_cron(&self) -> bool {
    return self.cron_schedule.is_some();
  }

  pub fn collision_policy(&self) -> CronCollisionPolicy {
    return self.cron_collision_policy.unwrap_or_default();
  }

  /// Stamps one config per shard from the template, offset for overlapping
  /// launches.
  pub fn shard_configs(&self, shard_offset: u32) -> Vec<TaskConfig> {
    return (0..self.shard_count)
      .map(|i| {
        let mut config = self.task.clone();
        config.shard_id = shard_offset + i;
        return config;
      })
      .collect();
  }
}
