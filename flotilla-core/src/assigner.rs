use itertools::Itertools;
use log::*;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::codec::Codec;
use crate::config::ConfigHandle;
use crate::driver::{
  AttributeLoader, DriverCall, DriverHandle, DriverStatus, Offer, TaskLaunch,
};
use crate::filter::SchedulingFilter;
use crate::model::{HostAttributes, Resources, ScheduledTask, TaskStatus};
use crate::query::TaskQuery;
use crate::state_machine::StateManager;
use crate::stats;

/// Stable scheduling order: priority before production before age, with the
/// task id as the final tie breaker so runs are reproducible.
pub fn scheduling_order(tasks: Vec<ScheduledTask>) -> Vec<ScheduledTask> {
  return tasks
    .into_iter()
    .sorted_by_key(|task| {
      return (
        Reverse(task.config().priority),
        Reverse(task.config().production),
        task.first_event_timestamp(),
        task.task_id().to_string(),
      );
    })
    .collect();
}

/// Deterministic port binding: requested names in order, lowest free ports
/// first.
fn allocate_ports(free: &BTreeSet<u16>, requested: &BTreeSet<String>) -> BTreeMap<String, u16> {
  return requested
    .iter()
    .cloned()
    .zip(free.iter().copied())
    .collect();
}

/// Matches incoming offers against PENDING tasks and applies driver status
/// updates to the state machine.
#[derive(Clone)]
pub struct TaskAssigner {
  state: StateManager,
  filter: SchedulingFilter,
  driver: DriverHandle,
  codec: Arc<dyn Codec>,
  attribute_loader: Option<Arc<dyn AttributeLoader>>,
  config: Arc<ConfigHandle>,
}

impl TaskAssigner {
  pub fn new(
    state: StateManager,
    filter: SchedulingFilter,
    driver: DriverHandle,
    codec: Arc<dyn Codec>,
    attribute_loader: Option<Arc<dyn AttributeLoader>>,
    config: Arc<ConfigHandle>,
  ) -> Self {
    return TaskAssigner {
      state,
      filter,
      driver,
      codec,
      attribute_loader,
      config,
    };
  }

  /// Offers are consumed by at most one task and never retained: either a
  /// task is launched against the offer or the offer is cancelled back to
  /// the driver. Returns whether a task was launched.
  pub fn handle_offer(&self, offer: &Offer) -> bool {
    self.refresh_host_attributes(&offer.host);

    let config = self.config.load_full();
    let usable = offer.resources().minus(&config.executor_reservation());

    let pending = self
      .state
      .storage()
      .weakly_consistent_read(|state| {
        return state
          .tasks
          .fetch_tasks(&TaskQuery::by_status(TaskStatus::Pending));
      });

    for candidate in scheduling_order(pending) {
      let vetoes = self.filter.filter(
        &usable,
        &offer.host,
        candidate.config(),
        candidate.task_id(),
      );
      if !vetoes.is_empty() {
        continue;
      }

      let ports = allocate_ports(&offer.ports, &candidate.config().requested_ports);

      // Encode before committing the assignment so a codec failure leaves
      // no half-assigned task behind.
      let mut prospective = candidate.assigned.clone();
      prospective.slave_host = Some(offer.host.clone());
      prospective.slave_id = Some(offer.slave_id.clone());
      prospective.assigned_ports = ports.clone();
      let data = match self.codec.encode(&prospective) {
        Ok(data) => data,
        Err(err) => {
          error!(
            "Failed to encode task {} for launch, skipping offer {}: {err}",
            candidate.task_id(),
            offer.offer_id
          );
          self.driver.send(DriverCall::CancelOffer {
            offer_id: offer.offer_id.clone(),
          });
          return false;
        }
      };

      let assigned = match self.state.assign_task(
        candidate.task_id(),
        &offer.host,
        &offer.slave_id,
        ports.clone(),
      ) {
        Ok(Some(task)) => task,
        Ok(None) => continue,
        Err(err) => {
          error!("Assignment of {} failed: {err}", candidate.task_id());
          continue;
        }
      };

      self.driver.send(DriverCall::LaunchTask {
        offer_id: offer.offer_id.clone(),
        task: Box::new(TaskLaunch {
          task_id: assigned.task_id().to_string(),
          slave_id: offer.slave_id.clone(),
          resources: Resources::from_task(assigned.config()),
          ports,
          data,
        }),
      });
      return true;
    }

    stats::increment(stats::names::OFFERS_DECLINED);
    self.driver.send(DriverCall::CancelOffer {
      offer_id: offer.offer_id.clone(),
    });
    return false;
  }

  /// Applies a driver-reported status to the owning task. Reports for ids we
  /// do not track, and UNKNOWN reports, are answered with a kill and touch
  /// no storage.
  pub fn status_update(&self, task_id: &str, status: DriverStatus, message: Option<String>) {
    let Some(new_status) = status.as_task_status() else {
      warn!("Driver reported {status:?} for {task_id}; instructing kill");
      self.driver.send(DriverCall::KillTask {
        task_id: task_id.to_string(),
      });
      return;
    };

    let known = self
      .state
      .storage()
      .weakly_consistent_read(|state| {
        return !state.tasks.fetch_tasks(&TaskQuery::by_id(task_id)).is_empty();
      });
    if !known {
      info!("Status update for untracked task {task_id}; instructing kill");
      self.driver.send(DriverCall::KillTask {
        task_id: task_id.to_string(),
      });
      return;
    }

    if let Err(err) = self
      .state
      .change_state(&TaskQuery::by_id(task_id), new_status, message)
    {
      error!("Failed to apply status update for {task_id}: {err}");
    }
  }

  /// Captures the attribute set the host advertises, preserving any
  /// maintenance mode operators have set.
  fn refresh_host_attributes(&self, host: &str) {
    let Some(ref loader) = self.attribute_loader else {
      return;
    };
    let attributes = loader.load(host);
    let host = host.to_string();

    let result = self.state.storage().write(move |state, _work| {
      let mode = state
        .attributes
        .fetch_host_attributes(&host)
        .map(|a| a.mode)
        .unwrap_or_default();
      state.attributes.save_host_attributes(HostAttributes {
        host: host.clone(),
        attributes: attributes.clone(),
        mode,
      });
      return Ok(());
    });
    if let Err(err) = result {
      warn!("Failed to refresh host attributes: {err}");
    }
  }
}
