use indexmap::IndexMap;

use crate::model::{JobConfiguration, JobKey};

/// Job templates keyed by the manager that owns them ("CRON", "IMMEDIATE"),
/// then by job key. Insertion order is kept so startup registration replays
/// deterministically.
#[derive(Clone, Default)]
pub struct JobStore {
  jobs: IndexMap<String, IndexMap<JobKey, JobConfiguration>>,
}

impl JobStore {
  pub fn save_job(&mut self, manager_id: &str, job: JobConfiguration) {
    self
      .jobs
      .entry(manager_id.to_string())
      .or_default()
      .insert(job.key.clone(), job);
  }

  pub fn fetch_job(&self, manager_id: &str, key: &JobKey) -> Option<JobConfiguration> {
    return self.jobs.get(manager_id).and_then(|m| m.get(key)).cloned();
  }

  pub fn fetch_jobs(&self, manager_id: &str) -> Vec<JobConfiguration> {
    return self
      .jobs
      .get(manager_id)
      .map(|m| m.values().cloned().collect())
      .unwrap_or_default();
  }

  pub fn remove_job(&mut self, manager_id: &str, key: &JobKey) -> Option<JobConfiguration> {
    return self
      .jobs
      .get_mut(manager_id)
      .and_then(|m| m.shift_remove(key));
  }

  /// True if any manager owns a job with this key.
  pub fn contains_job(&self, key: &JobKey) -> bool {
    return self.jobs.values().any(|m| m.contains_key(key));
  }
}
