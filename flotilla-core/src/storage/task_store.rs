use log::*;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::constants::SLOW_QUERY_THRESHOLD_DEFAULT;
use crate::model::{JobKey, ScheduledTask};
use crate::query::TaskQuery;
use crate::stats;

/// Primary task map plus the job-key secondary index. The index is maintained
/// in the same mutation as the primary map, so the two never diverge within a
/// committed snapshot.
#[derive(Clone)]
pub struct TaskStore {
  tasks: HashMap<String, ScheduledTask>,
  by_job: HashMap<JobKey, BTreeSet<String>>,
  slow_query_threshold: Duration,
}

impl Default for TaskStore {
  fn default() -> Self {
    return TaskStore::new(
      SLOW_QUERY_THRESHOLD_DEFAULT
        .to_std()
        .expect("constant is non-negative"),
    );
  }
}

impl TaskStore {
  pub fn new(slow_query_threshold: Duration) -> Self {
    return TaskStore {
      tasks: HashMap::new(),
      by_job: HashMap::new(),
      slow_query_threshold,
    };
  }

  pub fn len(&self) -> usize {
    return self.tasks.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.tasks.is_empty();
  }

  pub(crate) fn get(&self, task_id: &str) -> Option<&ScheduledTask> {
    return self.tasks.get(task_id);
  }

  /// Inserts or replaces tasks, keeping the job index in step.
  pub fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) {
    for task in tasks {
      let task_id = task.task_id().to_string();
      let job_key = task.job_key();

      if let Some(previous) = self.tasks.get(&task_id) {
        let previous_key = previous.job_key();
        if previous_key != job_key {
          self.unindex(&previous_key, &task_id);
        }
      }

      self.by_job.entry(job_key).or_default().insert(task_id.clone());
      self.tasks.insert(task_id, task);
    }
  }

  /// Returns deep copies of every task matching `query`. Dispatch walks the
  /// cheapest structure the query allows: pinned ids, then the job index,
  /// then a full scan. Results are identical regardless of the path taken.
  pub fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
    let start = Instant::now();

    let mut result: Vec<ScheduledTask> = if let Some(ref task_ids) = query.task_ids {
      task_ids
        .iter()
        .filter_map(|id| self.tasks.get(id))
        .filter(|task| query.matches(task))
        .cloned()
        .collect()
    } else if let Some(job_key) = query.pinned_job_key() {
      self
        .by_job
        .get(&job_key)
        .map(|ids| {
          return ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| query.matches(task))
            .cloned()
            .collect();
        })
        .unwrap_or_default()
    } else {
      self
        .tasks
        .values()
        .filter(|task| query.matches(task))
        .cloned()
        .collect()
    };

    // Deterministic output regardless of map iteration order.
    result.sort_by(|a, b| a.task_id().cmp(b.task_id()));

    let elapsed = start.elapsed();
    if elapsed > self.slow_query_threshold {
      stats::increment(stats::names::SLOW_QUERIES);
      warn!("Slow task query ({elapsed:?}): {query:?}");
    }

    return result;
  }

  /// Loads tasks matching `query`, hands each to `mutator` as a mutable copy
  /// and commits only the ones whose content changed. Task ids are immutable;
  /// a mutator overwriting one is ignored and logged.
  pub fn mutate_tasks(
    &mut self,
    query: &TaskQuery,
    mut mutator: impl FnMut(&mut ScheduledTask),
  ) -> Vec<ScheduledTask> {
    let originals = self.fetch_tasks(query);

    let mut changed = Vec::new();
    for original in originals {
      let mut copy = original.clone();
      mutator(&mut copy);

      if copy.assigned.task_id != original.assigned.task_id {
        error!(
          "Mutator attempted to change immutable task id {}; reverting",
          original.task_id()
        );
        copy.assigned.task_id = original.assigned.task_id.clone();
      }

      if copy != original {
        self.save_tasks(vec![copy.clone()]);
        changed.push(copy);
      }
    }
    return changed;
  }

  /// Removes tasks by id, returning the removed entries.
  pub fn delete_tasks(&mut self, task_ids: &BTreeSet<String>) -> Vec<ScheduledTask> {
    let mut removed = Vec::new();
    for task_id in task_ids {
      if let Some(task) = self.tasks.remove(task_id) {
        self.unindex(&task.job_key(), task_id);
        removed.push(task);
      }
    }
    return removed;
  }

  /// Startup repair: rebuilds the job index from the primary map and reports
  /// duplicate active shards. For each (job, shard) held by more than one
  /// active task, every id except the lexicographically greatest is returned
  /// for killing.
  pub fn backfill(&mut self) -> Vec<String> {
    self.by_job.clear();
    for (task_id, task) in &self.tasks {
      self
        .by_job
        .entry(task.job_key())
        .or_default()
        .insert(task_id.clone());
    }

    let mut by_shard: HashMap<(JobKey, u32), BTreeSet<String>> = HashMap::new();
    for (task_id, task) in &self.tasks {
      if task.status.is_active() {
        by_shard
          .entry((task.job_key(), task.shard_id()))
          .or_default()
          .insert(task_id.clone());
      }
    }

    let mut to_kill = Vec::new();
    for ((job_key, shard_id), mut ids) in by_shard {
      if ids.len() < 2 {
        continue;
      }
      let keep = ids.pop_last().expect("len checked above");
      error!(
        "Duplicate active tasks for {job_key}/{shard_id}: keeping {keep}, killing {ids:?}"
      );
      for id in ids {
        stats::increment(stats::names::SHARD_UNIQUENESS_REPAIRS);
        to_kill.push(id);
      }
    }
    to_kill.sort();
    return to_kill;
  }

  /// Operator-only escape hatch: swaps a task's config in place with no
  /// lifecycle checks. Loudly logged.
  pub fn unsafe_replace_config(
    &mut self,
    task_id: &str,
    config: crate::model::TaskConfig,
  ) -> bool {
    let Some(task) = self.tasks.get(task_id) else {
      return false;
    };

    warn!("Unsafe in-place config replace for task {task_id}");
    let mut replacement = task.clone();
    replacement.assigned.config = config;
    self.save_tasks(vec![replacement]);
    return true;
  }

  fn unindex(&mut self, job_key: &JobKey, task_id: &str) {
    if let Some(ids) = self.by_job.get_mut(job_key) {
      ids.remove(task_id);
      if ids.is_empty() {
        self.by_job.remove(job_key);
      }
    }
  }
}
