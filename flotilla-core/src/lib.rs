#![forbid(unsafe_code)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod admission;
pub mod assigner;
pub mod codec;
pub mod config;
pub mod constants;
pub mod cron;
pub mod driver;
pub mod events;
pub mod filter;
pub mod model;
pub mod preemption;
pub mod query;
pub mod scheduler;
pub mod state_machine;
pub mod stats;
pub mod storage;
pub mod updates;

#[cfg(test)]
mod test;

pub use config::SchedulerConfig;
pub use events::{EventBus, SchedulerEvent};
pub use model::{
  AssignedTask, Attribute, Constraint, CronCollisionPolicy, HostAttributes, Identity,
  JobConfiguration, JobKey, MaintenanceMode, Quota, Resources, ScheduledTask, TaskConfig,
  TaskStatus,
};
pub use query::TaskQuery;
pub use scheduler::{Scheduler, SchedulerArgs, SchedulerError};

pub(crate) mod rand {
  use rand::distr::Alphanumeric;
  use rand::Rng;

  pub(crate) fn generate_random_string(length: usize) -> String {
    return rand::rng()
      .sample_iter(&Alphanumeric)
      .take(length)
      .map(char::from)
      .collect();
  }
}
