use serde::{Deserialize, Serialize};

use crate::model::task::TaskConfig;

/// A quantity of schedulable resources, either offered by a host or required
/// by a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
  pub num_cpus: f64,
  pub ram_mb: u64,
  pub disk_mb: u64,
  pub num_ports: u32,
}

impl Resources {
  pub fn from_task(config: &TaskConfig) -> Self {
    return Resources {
      num_cpus: config.num_cpus,
      ram_mb: config.ram_mb,
      disk_mb: config.disk_mb,
      num_ports: config.requested_ports.len() as u32,
    };
  }

  pub fn plus(&self, other: &Resources) -> Resources {
    return Resources {
      num_cpus: self.num_cpus + other.num_cpus,
      ram_mb: self.ram_mb + other.ram_mb,
      disk_mb: self.disk_mb + other.disk_mb,
      num_ports: self.num_ports + other.num_ports,
    };
  }

  /// Component-wise subtraction, floored at zero.
  pub fn minus(&self, other: &Resources) -> Resources {
    return Resources {
      num_cpus: (self.num_cpus - other.num_cpus).max(0.0),
      ram_mb: self.ram_mb.saturating_sub(other.ram_mb),
      disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
      num_ports: self.num_ports.saturating_sub(other.num_ports),
    };
  }
}

/// Resource ceiling for a role. Only production tasks are charged against it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quota {
  pub num_cpus: f64,
  pub ram_mb: u64,
  pub disk_mb: u64,
}

impl Quota {
  pub fn accommodates(&self, used: &Resources, requested: &Resources) -> bool {
    return used.num_cpus + requested.num_cpus <= self.num_cpus
      && used.ram_mb + requested.ram_mb <= self.ram_mb
      && used.disk_mb + requested.disk_mb <= self.disk_mb;
  }
}
