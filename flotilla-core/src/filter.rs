use serde::Serialize;
use std::collections::BTreeSet;

use crate::constants::{DEDICATED_ATTRIBUTE, MAX_VETO_SCORE};
use crate::events::SchedulerEvent;
use crate::model::{ConstraintKind, HostAttributes, Resources, TaskConfig};
use crate::query::TaskQuery;
use crate::storage::{Storage, StoreState};

/// A reason a task cannot be placed on a slot. Vetoes at `MAX_VETO_SCORE`
/// are hard and cannot be overcome by preemption; lesser scores are
/// informational.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Veto {
  pub reason: String,
  pub score: u32,
}

impl Veto {
  fn hard(reason: String) -> Self {
    return Veto {
      reason,
      score: MAX_VETO_SCORE,
    };
  }

  pub fn insufficient_resource(resource: &str) -> Self {
    return Veto::hard(format!("Insufficient {resource}"));
  }

  pub fn constraint_mismatch(name: &str) -> Self {
    return Veto::hard(format!("Constraint not satisfied: {name}"));
  }

  pub fn unsatisfied_limit(name: &str) -> Self {
    return Veto::hard(format!("Limit not satisfied: {name}"));
  }

  pub fn maintenance(mode: crate::model::MaintenanceMode) -> Self {
    return Veto::hard(format!("Host {mode} for maintenance"));
  }

  pub fn dedicated_host() -> Self {
    return Veto::hard("Host is dedicated to another role".to_string());
  }

  pub fn is_hard(&self) -> bool {
    return self.score >= MAX_VETO_SCORE;
  }
}

/// Scores a task against an offered slot: resource fit, host maintenance,
/// value/limit constraints and dedicated-host reservations. An empty result
/// permits placement.
#[derive(Clone)]
pub struct SchedulingFilter {
  storage: Storage,
}

impl SchedulingFilter {
  pub fn new(storage: Storage) -> Self {
    return SchedulingFilter { storage };
  }

  /// Pure given a storage snapshot: identical inputs yield identical vetoes.
  /// Publishes a `Vetoed` event iff the result is non-empty.
  pub fn filter(
    &self,
    slot: &Resources,
    host: &str,
    task: &TaskConfig,
    task_id: &str,
  ) -> Vec<Veto> {
    let vetoes = self
      .storage
      .weakly_consistent_read(|state| filter_against_state(state, slot, host, task));

    if !vetoes.is_empty() {
      self.storage.bus().publish(SchedulerEvent::Vetoed {
        task_id: task_id.to_string(),
        vetoes: vetoes.clone(),
      });
    }
    return vetoes;
  }
}

fn filter_against_state(
  state: &StoreState,
  slot: &Resources,
  host: &str,
  task: &TaskConfig,
) -> Vec<Veto> {
  let mut vetoes = Vec::new();

  if slot.num_cpus < task.num_cpus {
    vetoes.push(Veto::insufficient_resource("CPU"));
  }
  if slot.ram_mb < task.ram_mb {
    vetoes.push(Veto::insufficient_resource("RAM"));
  }
  if slot.disk_mb < task.disk_mb {
    vetoes.push(Veto::insufficient_resource("disk"));
  }
  if (slot.num_ports as usize) < task.requested_ports.len() {
    vetoes.push(Veto::insufficient_resource("ports"));
  }

  let host_attributes = state.attributes.fetch_host_attributes(host);

  if let Some(ref attributes) = host_attributes {
    if attributes.mode.blocks_placement() {
      vetoes.push(Veto::maintenance(attributes.mode));
    }
  }

  for constraint in &task.constraints {
    match &constraint.kind {
      ConstraintKind::Value { negated, values } => {
        if !value_constraint_matches(host_attributes.as_ref(), &constraint.name, *negated, values)
        {
          vetoes.push(Veto::constraint_mismatch(&constraint.name));
        }
      }
      ConstraintKind::Limit { limit } => {
        let host_value = host_attributes
          .as_ref()
          .and_then(|a| a.values_of(&constraint.name))
          .and_then(|values| values.first().cloned());
        match host_value {
          None => vetoes.push(Veto::constraint_mismatch(&constraint.name)),
          Some(host_value) => {
            let count = count_limit_occupancy(state, task, &constraint.name, &host_value);
            if count >= *limit as usize {
              vetoes.push(Veto::unsatisfied_limit(&constraint.name));
            }
          }
        };
      }
    };
  }

  if let Some(ref attributes) = host_attributes {
    if let Some(dedicated_values) = attributes.values_of(DEDICATED_ATTRIBUTE) {
      if !dedicated_admits(task, &dedicated_values) {
        vetoes.push(Veto::dedicated_host());
      }
    }
  }

  return vetoes;
}

fn value_constraint_matches(
  host_attributes: Option<&HostAttributes>,
  name: &str,
  negated: bool,
  values: &BTreeSet<String>,
) -> bool {
  let present = host_attributes
    .and_then(|a| a.values_of(name))
    .map(|host_values| values.iter().any(|v| host_values.contains(v)))
    .unwrap_or(false);
  return present != negated;
}

/// Number of active tasks of the same job already sitting on hosts whose
/// `attribute_name` carries `host_value`.
fn count_limit_occupancy(
  state: &StoreState,
  task: &TaskConfig,
  attribute_name: &str,
  host_value: &str,
) -> usize {
  let active = state
    .tasks
    .fetch_tasks(&TaskQuery::by_job(&task.job_key()).active());

  return active
    .iter()
    .filter(|t| {
      let Some(ref task_host) = t.assigned.slave_host else {
        return false;
      };
      return state
        .attributes
        .fetch_host_attributes(task_host)
        .and_then(|a| a.values_of(attribute_name))
        .map(|values| values.contains(host_value))
        .unwrap_or(false);
    })
    .count();
}

/// A host carrying the dedicated attribute only admits tasks whose dedicated
/// constraint names one of the host's values, prefixed by the task's own
/// role.
fn dedicated_admits(task: &TaskConfig, dedicated_values: &BTreeSet<String>) -> bool {
  return task.constraints.iter().any(|c| {
    if c.name != DEDICATED_ATTRIBUTE {
      return false;
    }
    let ConstraintKind::Value { negated: false, ref values } = c.kind else {
      return false;
    };
    return values.iter().any(|v| {
      return dedicated_values.contains(v)
        && v.split('/').next() == Some(task.owner.role.as_str());
    });
  });
}
