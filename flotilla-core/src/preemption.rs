use chrono::{DateTime, Utc};
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConfigHandle;
use crate::filter::SchedulingFilter;
use crate::model::{Resources, ScheduledTask, TaskConfig, TaskStatus};
use crate::query::TaskQuery;
use crate::state_machine::StateManager;
use crate::stats;
use crate::assigner::scheduling_order;

/// Remembered pairing between a preempted task and the pending task that
/// displaced it, so the freed slot can be attributed when the kill lands.
#[derive(Clone, Debug, PartialEq)]
pub struct PreemptionClaim {
  pub candidate_task_id: String,
  pub host: String,
}

/// A candidate may displace a victim only across a production boundary or,
/// within a role, up the priority ladder.
fn may_preempt(candidate: &TaskConfig, victim: &TaskConfig) -> bool {
  if candidate.production && !victim.production {
    return true;
  }
  return candidate.owner.role == victim.owner.role && candidate.priority > victim.priority;
}

/// Periodically reclaims slots held by lower-priority tasks for pending work
/// that has waited out its candidacy delay.
pub struct Preempter {
  state: StateManager,
  filter: SchedulingFilter,
  config: Arc<ConfigHandle>,
  claims: Mutex<HashMap<String, PreemptionClaim>>,
}

impl Preempter {
  pub fn new(state: StateManager, filter: SchedulingFilter, config: Arc<ConfigHandle>) -> Self {
    return Preempter {
      state,
      filter,
      config,
      claims: Mutex::new(HashMap::new()),
    };
  }

  /// One preemption pass. Feasibility is judged against each victim's slot
  /// alone; free capacity already on the victim's host is not considered, so
  /// a candidate needing more than any single victim frees is never
  /// admitted. At most one task is preempted per victim per pass.
  pub fn run_once(&self, now: DateTime<Utc>) -> usize {
    let config = self.config.load_full();
    let candidacy_delay = config.preemption_candidacy_delay();
    let reservation = config.executor_reservation();

    let (pending, active) = self.state.storage().weakly_consistent_read(|state| {
      let pending = state
        .tasks
        .fetch_tasks(&TaskQuery::by_status(TaskStatus::Pending));
      let active = state.tasks.fetch_tasks(&TaskQuery::new().active());
      return (pending, active);
    });

    let mut candidates: Vec<ScheduledTask> = scheduling_order(
      pending
        .into_iter()
        .filter(|task| now - task.current_status_since() >= candidacy_delay)
        .collect(),
    );
    if candidates.is_empty() {
      return 0;
    }

    // Cheapest victims first: reverse scheduling order, placed tasks only.
    let victims: Vec<ScheduledTask> = scheduling_order(
      active
        .into_iter()
        .filter(|task| task.status != TaskStatus::Pending)
        .filter(|task| task.assigned.slave_host.is_some())
        .collect(),
    )
    .into_iter()
    .rev()
    .collect();

    let mut preemptions = 0;
    for victim in victims {
      if candidates.is_empty() {
        break;
      }
      let victim_host = victim
        .assigned
        .slave_host
        .clone()
        .expect("filtered on slave_host above");

      // The victim's executor reservation is freed with it; the candidate
      // brings its own.
      let slot = Resources::from_task(victim.config()).plus(&reservation);
      let usable = slot.minus(&reservation);

      let matched = candidates.iter().position(|candidate| {
        return may_preempt(candidate.config(), victim.config())
          && self
            .filter
            .filter(&usable, &victim_host, candidate.config(), candidate.task_id())
            .is_empty();
      });
      let Some(index) = matched else {
        continue;
      };
      let candidate = candidates.remove(index);

      self.preempt_task(&victim, &candidate, &victim_host);
      preemptions += 1;
    }
    return preemptions;
  }

  fn preempt_task(&self, victim: &ScheduledTask, candidate: &ScheduledTask, host: &str) {
    let message = format!("Preempted by {}", candidate.task_id());
    match self.state.change_state(
      &TaskQuery::by_id(victim.task_id()),
      TaskStatus::Preempting,
      Some(message),
    ) {
      Ok(1) => {
        info!(
          "Preempting {} on {host} in favor of {}",
          victim.task_id(),
          candidate.task_id()
        );
        stats::increment(stats::names::PREEMPTION_VICTORIES);
        self.claims.lock().insert(
          victim.task_id().to_string(),
          PreemptionClaim {
            candidate_task_id: candidate.task_id().to_string(),
            host: host.to_string(),
          },
        );
      }
      Ok(_) => debug!("Victim {} changed state underneath us", victim.task_id()),
      Err(err) => error!("Preemption of {} failed: {err}", victim.task_id()),
    };
  }

  /// Retires the claim for a victim whose kill has completed, returning the
  /// candidate now owed the freed slot.
  pub fn release_claim(&self, victim_task_id: &str) -> Option<PreemptionClaim> {
    return self.claims.lock().remove(victim_task_id);
  }

  pub fn claim_for(&self, victim_task_id: &str) -> Option<PreemptionClaim> {
    return self.claims.lock().get(victim_task_id).cloned();
  }

  /// Ticks `run_once` until aborted.
  pub fn start(self: &Arc<Self>) -> tokio::task::AbortHandle {
    let preempter = self.clone();
    let handle = tokio::spawn(async move {
      loop {
        let interval = preempter.config.load().preemption_interval();
        tokio::time::sleep(interval).await;
        preempter.run_once(Utc::now());
      }
    });
    return handle.abort_handle();
  }
}
