use indexmap::IndexMap;

use crate::model::Quota;

/// Resource ceilings by role. Absence means the role has no quota and cannot
/// run production tasks.
#[derive(Clone, Default)]
pub struct QuotaStore {
  quotas: IndexMap<String, Quota>,
}

impl QuotaStore {
  pub fn save_quota(&mut self, role: &str, quota: Quota) {
    self.quotas.insert(role.to_string(), quota);
  }

  pub fn fetch_quota(&self, role: &str) -> Option<Quota> {
    return self.quotas.get(role).copied();
  }

  pub fn remove_quota(&mut self, role: &str) -> Option<Quota> {
    return self.quotas.shift_remove(role);
  }
}
